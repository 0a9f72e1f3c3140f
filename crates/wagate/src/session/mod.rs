//! Connection lifecycle of tenant instances.

mod machine;
mod manager;
mod pending;
mod registry;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub use machine::{
    Effect, MachineEvent, MachinePolicy, Reply, SessionMachine, SessionState, Timer,
};
pub use manager::LifecycleManager;
pub use pending::PendingResponse;
pub use registry::{ActiveSession, ActiveSessionRegistry};

/// Externally visible status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    QrPending,
    Connected,
    Timeout,
    Error,
}

impl From<SessionState> for SessionStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Disconnected | SessionState::Closing => Self::Disconnected,
            SessionState::Connecting => Self::Connecting,
            SessionState::QrPending => Self::QrPending,
            SessionState::Connected => Self::Connected,
            SessionState::Timeout => Self::Timeout,
            SessionState::Error => Self::Error,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::QrPending => "qr_pending",
            Self::Connected => "connected",
            Self::Timeout => "timeout",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of one instance's lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct TenantSession {
    pub instance_id: String,
    pub phone_number: Option<String>,
    pub status: SessionStatus,
    pub last_seen_at: DateTime<Utc>,
    #[serde(skip)]
    pub generation: u64,
}

/// The single answer a connect request receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Pairing is needed; `qr_code` is a base64 PNG of `qr_raw`.
    QrCode { qr_code: String, qr_raw: String },
    Connected,
    /// Negotiation was rejected; `qr_code` encodes a click-to-chat link.
    Fallback { qr_code: String },
    Disconnected { reason: String, code: Option<u16> },
    Timeout,
    Error { reason: String },
}

impl ConnectOutcome {
    /// Wire status string.
    pub fn status(&self) -> &'static str {
        match self {
            Self::QrCode { .. } => "qrcode",
            Self::Connected => "connected",
            Self::Fallback { .. } => "qrcode_fallback",
            Self::Disconnected { .. } => "disconnected",
            Self::Timeout => "timeout",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid instance id: {0:?}")]
    InvalidInstanceId(String),
}
