//! Per-instance connection state machine.
//!
//! ```text
//!   disconnected ──start──▶ connecting ──qr──▶ qr_pending
//!        ▲                      │                  │
//!        │                      └──────open────────┴──▶ connected
//!        │                                                  │
//!        └──── fallback / eviction due ◀── closing ◀──close─┘
//!
//!   connecting / qr_pending ──deadline──▶ timeout
//!   link construction failure ─────────▶ error
//! ```
//!
//! The machine is pure: [`SessionMachine::handle`] takes one event and returns
//! the effects the driver must apply, in order. It owns the "has this request
//! been answered" bit, so at most one [`Effect::Respond`] is ever produced.

use std::time::Duration;

use serde::Serialize;

use crate::protocol::{CloseReason, FailureClass};

/// Connection state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    QrPending,
    Connected,
    Closing,
    Timeout,
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::QrPending => "qr_pending",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Timeout => "timeout",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Inputs to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    Start,
    /// A protocol client was built and subscribed to.
    LinkOpened,
    LinkFailed(String),
    Qr(String),
    Open,
    CredentialsUpdated,
    Closed(CloseReason),
    FallbackDue,
    EvictionDue,
    ReconnectDue,
    DeadlineElapsed,
    Superseded,
}

/// Timers the driver runs on the machine's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    Fallback,
    Eviction,
    Reconnect,
}

impl Timer {
    pub fn into_event(self) -> MachineEvent {
        match self {
            Self::Fallback => MachineEvent::FallbackDue,
            Self::Eviction => MachineEvent::EvictionDue,
            Self::Reconnect => MachineEvent::ReconnectDue,
        }
    }
}

/// What the single response to the connect request should say.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Qr(String),
    Connected,
    Fallback,
    Disconnected { reason: String, code: Option<u16> },
    Timeout,
    Error(String),
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Load credentials, build a protocol client and subscribe to it.
    OpenLink,
    Respond(Reply),
    PersistCredentials,
    ForgetCredentials,
    RegisterActive,
    Deregister,
    Schedule(Duration, Timer),
    /// Reconnect after the retry delay of `class`.
    Reconnect(FailureClass),
    Finish,
}

/// Tunables of the machine.
#[derive(Debug, Clone)]
pub struct MachinePolicy {
    pub fallback_delay: Duration,
    pub eviction_delay: Duration,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug)]
pub struct SessionMachine {
    policy: MachinePolicy,
    state: SessionState,
    responded: bool,
    ever_connected: bool,
    reconnect_attempts: u32,
    last_failure: FailureClass,
}

impl SessionMachine {
    pub fn new(policy: MachinePolicy) -> Self {
        Self {
            policy,
            state: SessionState::Disconnected,
            responded: false,
            ever_connected: false,
            reconnect_attempts: 0,
            last_failure: FailureClass::Unknown,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn has_responded(&self) -> bool {
        self.responded
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn handle(&mut self, event: MachineEvent) -> Vec<Effect> {
        let mut effects = Vec::new();

        match event {
            MachineEvent::Start | MachineEvent::ReconnectDue => {
                self.state = SessionState::Disconnected;
                effects.push(Effect::OpenLink);
            }

            MachineEvent::LinkOpened => {
                self.state = SessionState::Connecting;
            }

            MachineEvent::LinkFailed(reason) => {
                self.state = SessionState::Error;
                self.respond(&mut effects, Reply::Error(reason));
                effects.push(Effect::Finish);
            }

            MachineEvent::Qr(payload) => {
                if matches!(
                    self.state,
                    SessionState::Connecting | SessionState::QrPending
                ) {
                    self.state = SessionState::QrPending;
                    self.respond(&mut effects, Reply::Qr(payload));
                }
            }

            MachineEvent::Open => {
                self.state = SessionState::Connected;
                self.ever_connected = true;
                self.reconnect_attempts = 0;
                effects.push(Effect::RegisterActive);
                self.respond(&mut effects, Reply::Connected);
                effects.push(Effect::PersistCredentials);
            }

            MachineEvent::CredentialsUpdated => {
                effects.push(Effect::PersistCredentials);
            }

            MachineEvent::Closed(reason) => {
                let class = reason.class();
                self.last_failure = class;
                effects.push(Effect::Deregister);

                if reason.is_method_not_allowed() {
                    self.last_failure = FailureClass::MethodNotAllowed;
                    self.state = SessionState::Closing;
                    effects.push(Effect::Schedule(self.policy.fallback_delay, Timer::Fallback));
                } else if class.is_terminal() {
                    self.state = SessionState::Disconnected;
                    self.respond(&mut effects, disconnected(reason));
                    if class == FailureClass::LoggedOut {
                        effects.push(Effect::ForgetCredentials);
                    }
                    effects.push(Effect::Finish);
                } else {
                    self.state = SessionState::Closing;
                    self.respond(&mut effects, disconnected(reason));
                    effects.push(Effect::Schedule(self.policy.eviction_delay, Timer::Eviction));
                }
            }

            MachineEvent::FallbackDue => {
                self.state = SessionState::Disconnected;
                effects.push(Effect::Deregister);
                self.respond(&mut effects, Reply::Fallback);
                self.after_close(&mut effects);
            }

            MachineEvent::EvictionDue => {
                self.state = SessionState::Disconnected;
                effects.push(Effect::Deregister);
                self.after_close(&mut effects);
            }

            MachineEvent::DeadlineElapsed => {
                if !self.responded {
                    self.state = SessionState::Timeout;
                    self.respond(&mut effects, Reply::Timeout);
                    effects.push(Effect::Finish);
                }
            }

            MachineEvent::Superseded => {
                self.state = SessionState::Disconnected;
                effects.push(Effect::Deregister);
                self.respond(
                    &mut effects,
                    Reply::Error("superseded by a newer connect".to_string()),
                );
                effects.push(Effect::Finish);
            }
        }

        effects
    }

    fn respond(&mut self, effects: &mut Vec<Effect>, reply: Reply) {
        if !self.responded {
            self.responded = true;
            effects.push(Effect::Respond(reply));
        }
    }

    /// Reconnect only links that were working; pairing failures wait for a new connect.
    fn after_close(&mut self, effects: &mut Vec<Effect>) {
        if self.policy.auto_reconnect
            && self.ever_connected
            && self.reconnect_attempts < self.policy.max_reconnect_attempts
        {
            self.reconnect_attempts += 1;
            effects.push(Effect::Reconnect(self.last_failure));
        } else {
            effects.push(Effect::Finish);
        }
    }
}

fn disconnected(reason: CloseReason) -> Reply {
    Reply::Disconnected {
        reason: if reason.message.is_empty() {
            "Connection lost".to_string()
        } else {
            reason.message
        },
        code: reason.status,
    }
}
