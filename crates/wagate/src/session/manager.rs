//! Lifecycle manager.
//!
//! Owns one session task per instance. A connect request either joins the
//! in-flight attempt for its instance or starts a new task, then waits for
//! that task's single [`ConnectOutcome`]. The task keeps running after it has
//! answered: it persists credential updates, keeps the registry current and
//! reconnects links that drop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::Shared;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::machine::{Effect, MachineEvent, MachinePolicy, Reply, SessionMachine, Timer};
use super::pending::PendingResponse;
use super::registry::{ActiveSession, ActiveSessionRegistry};
use super::{ConnectOutcome, SessionError, SessionStatus, TenantSession};
use crate::config::LifecycleConfig;
use crate::protocol::{ClientFactory, CloseReason, FailureClass, ProtocolClient, ProtocolEvent};
use crate::qr;
use crate::store::{Credentials, SessionStore, validate_instance_id};

const MAX_JITTER_MS: u64 = 1_000;

type SharedOutcome = Shared<oneshot::Receiver<ConnectOutcome>>;

struct SessionHandle {
    generation: u64,
    outcome: SharedOutcome,
    cancel: CancellationToken,
}

struct Inner {
    factory: Arc<dyn ClientFactory>,
    store: SessionStore,
    registry: ActiveSessionRegistry,
    sessions: DashMap<String, SessionHandle>,
    snapshots: DashMap<String, TenantSession>,
    config: LifecycleConfig,
    next_generation: AtomicU64,
}

/// Drives connect requests through the session state machine.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        store: SessionStore,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                store,
                registry: ActiveSessionRegistry::new(),
                sessions: DashMap::new(),
                snapshots: DashMap::new(),
                config,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &ActiveSessionRegistry {
        &self.inner.registry
    }

    /// Latest lifecycle snapshot of an instance, if a connect was ever attempted.
    pub fn session(&self, instance_id: &str) -> Option<TenantSession> {
        self.inner
            .snapshots
            .get(instance_id)
            .map(|entry| entry.clone())
    }

    /// Connect an instance and wait for the first decisive outcome.
    ///
    /// Concurrent calls for the same instance share one attempt and observe
    /// the same outcome. A call made after the previous attempt already
    /// answered supersedes that attempt.
    pub async fn connect(
        &self,
        instance_id: &str,
        phone_number: Option<String>,
    ) -> Result<ConnectOutcome, SessionError> {
        validate_instance_id(instance_id)
            .map_err(|_| SessionError::InvalidInstanceId(instance_id.to_string()))?;

        if self.inner.registry.contains(instance_id) {
            debug!(instance_id, "Instance already connected");
            return Ok(ConnectOutcome::Connected);
        }

        let (outcome, task) = match self.inner.sessions.entry(instance_id.to_string()) {
            Entry::Occupied(entry) if entry.get().outcome.clone().now_or_never().is_none() => {
                debug!(instance_id, "Joining in-flight connect");
                (entry.get().outcome.clone(), None)
            }
            entry => {
                if let Entry::Occupied(previous) = &entry {
                    info!(
                        instance_id,
                        generation = previous.get().generation,
                        "Superseding previous session"
                    );
                    previous.get().cancel.cancel();
                }

                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let (pending, rx) = PendingResponse::new();
                let outcome = rx.shared();
                let cancel = CancellationToken::new();
                entry.insert(SessionHandle {
                    generation,
                    outcome: outcome.clone(),
                    cancel: cancel.clone(),
                });

                let task = SessionTask::new(
                    self.inner.clone(),
                    instance_id.to_string(),
                    phone_number,
                    generation,
                    cancel,
                    pending,
                );
                (outcome, Some(task))
            }
        };

        if let Some(task) = task {
            self.prune_snapshots();
            task.publish();
            tokio::spawn(task.run());
        }

        Ok(outcome.await.unwrap_or_else(|_| ConnectOutcome::Error {
            reason: "session ended before responding".to_string(),
        }))
    }

    /// Forget snapshots of instances with no live task that have been idle past the TTL.
    pub fn prune_snapshots(&self) {
        let ttl = chrono::Duration::from_std(self.inner.config.snapshot_ttl())
            .unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let inner = &self.inner;
        inner.snapshots.retain(|instance_id, snapshot| {
            inner.sessions.contains_key(instance_id)
                || inner.registry.contains(instance_id)
                || now - snapshot.last_seen_at < ttl
        });
    }

    /// Stop every session task.
    pub fn shutdown(&self) {
        for entry in self.inner.sessions.iter() {
            entry.cancel.cancel();
        }
    }
}

// ============================================================================
// SessionTask
// ============================================================================

enum Step {
    Continue,
    Follow(MachineEvent),
    Finish,
}

enum Wake {
    Cancelled,
    Protocol(Option<ProtocolEvent>),
    Deadline,
    Timer(Timer),
}

struct SessionTask {
    inner: Arc<Inner>,
    instance_id: String,
    phone_number: Option<String>,
    generation: u64,
    cancel: CancellationToken,
    machine: SessionMachine,
    pending: PendingResponse,
    client: Option<Arc<dyn ProtocolClient>>,
    events: Option<mpsc::Receiver<ProtocolEvent>>,
    credentials: Option<Credentials>,
    timer: Option<(Instant, Timer)>,
    deadline: Instant,
}

impl SessionTask {
    fn new(
        inner: Arc<Inner>,
        instance_id: String,
        phone_number: Option<String>,
        generation: u64,
        cancel: CancellationToken,
        pending: PendingResponse,
    ) -> Self {
        let machine = SessionMachine::new(MachinePolicy {
            fallback_delay: inner.config.fallback_delay(),
            eviction_delay: inner.config.eviction_delay(),
            auto_reconnect: inner.config.auto_reconnect,
            max_reconnect_attempts: inner.config.max_reconnect_attempts,
        });
        let deadline = Instant::now() + inner.config.connect_deadline();

        Self {
            inner,
            instance_id,
            phone_number,
            generation,
            cancel,
            machine,
            pending,
            client: None,
            events: None,
            credentials: None,
            timer: None,
            deadline,
        }
    }

    async fn run(mut self) {
        let mut queue = VecDeque::from([MachineEvent::Start]);

        'run: loop {
            while let Some(event) = queue.pop_front() {
                debug!(instance_id = %self.instance_id, state = %self.machine.state(), ?event, "Session event");
                for effect in self.machine.handle(event) {
                    match self.apply(effect).await {
                        Step::Continue => {}
                        Step::Follow(next) => queue.push_back(next),
                        Step::Finish => break 'run,
                    }
                }
                self.publish();
            }

            let responded = self.machine.has_responded();
            let deadline = self.deadline;
            let timer = self.timer;
            let cancel = self.cancel.clone();

            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                event = next_event(&mut self.events) => Wake::Protocol(event),
                _ = sleep_until(deadline), if !responded => Wake::Deadline,
                fired = wait_timer(timer) => Wake::Timer(fired),
            };

            let event = match wake {
                Wake::Cancelled => Some(MachineEvent::Superseded),
                Wake::Protocol(event) => self.translate(event),
                Wake::Deadline => Some(MachineEvent::DeadlineElapsed),
                Wake::Timer(fired) => {
                    self.timer = None;
                    Some(fired.into_event())
                }
            };
            queue.extend(event);
        }

        self.publish();
        self.cleanup().await;
    }

    /// Map a protocol event to a machine event. `None` is the end of the stream.
    fn translate(&mut self, event: Option<ProtocolEvent>) -> Option<MachineEvent> {
        match event {
            Some(ProtocolEvent::Qr(payload)) => Some(MachineEvent::Qr(payload)),
            Some(ProtocolEvent::Open) => Some(MachineEvent::Open),
            Some(ProtocolEvent::CredentialsUpdated(credentials)) => {
                self.credentials = Some(credentials);
                Some(MachineEvent::CredentialsUpdated)
            }
            Some(ProtocolEvent::Closed(reason)) => {
                self.events = None;
                Some(MachineEvent::Closed(reason))
            }
            Some(ProtocolEvent::Inbound { id, from }) => {
                debug!(instance_id = %self.instance_id, message_id = %id, %from, "Inbound message");
                self.touch();
                None
            }
            None => {
                self.events = None;
                Some(MachineEvent::Closed(CloseReason::stream_ended()))
            }
        }
    }

    async fn apply(&mut self, effect: Effect) -> Step {
        match effect {
            Effect::OpenLink => self.open_link().await,
            Effect::Respond(reply) => {
                let outcome = self.render(reply).await;
                self.publish();
                info!(instance_id = %self.instance_id, status = outcome.status(), "Connect resolved");
                self.pending.resolve(outcome);
                Step::Continue
            }
            Effect::PersistCredentials => {
                match self.credentials.clone() {
                    Some(credentials) => {
                        if let Err(e) = self.inner.store.put(&self.instance_id, credentials).await {
                            warn!(instance_id = %self.instance_id, error = %e, "Failed to persist credentials");
                        }
                    }
                    None => debug!(instance_id = %self.instance_id, "No credentials to persist"),
                }
                Step::Continue
            }
            Effect::ForgetCredentials => {
                self.credentials = None;
                if let Err(e) = self.inner.store.remove(&self.instance_id).await {
                    warn!(instance_id = %self.instance_id, error = %e, "Failed to remove credentials");
                }
                Step::Continue
            }
            Effect::RegisterActive => {
                if let Some(client) = &self.client {
                    self.inner.registry.insert(
                        &self.instance_id,
                        ActiveSession {
                            client: client.clone(),
                            generation: self.generation,
                            connected_at: Utc::now(),
                        },
                    );
                    info!(instance_id = %self.instance_id, "Instance connected");
                }
                Step::Continue
            }
            Effect::Deregister => {
                if self
                    .inner
                    .registry
                    .remove_generation(&self.instance_id, self.generation)
                {
                    info!(instance_id = %self.instance_id, "Instance deregistered");
                }
                Step::Continue
            }
            Effect::Schedule(delay, timer) => {
                self.timer = Some((Instant::now() + delay, timer));
                Step::Continue
            }
            Effect::Reconnect(class) => {
                self.schedule_reconnect(class).await;
                Step::Continue
            }
            Effect::Finish => Step::Finish,
        }
    }

    async fn open_link(&mut self) -> Step {
        if self.credentials.is_none() {
            self.credentials = self
                .inner
                .store
                .get(&self.instance_id)
                .await
                .map(|record| record.credentials);
        }
        debug!(
            instance_id = %self.instance_id,
            resuming = self.credentials.is_some(),
            "Opening protocol link"
        );

        let client = match self
            .inner
            .factory
            .create(&self.instance_id, self.credentials.clone())
        {
            Ok(client) => client,
            Err(e) => return Step::Follow(MachineEvent::LinkFailed(e.to_string())),
        };

        match client.connect().await {
            Ok(events) => {
                self.client = Some(client);
                self.events = Some(events);
                Step::Follow(MachineEvent::LinkOpened)
            }
            Err(e) => {
                client.shutdown().await;
                Step::Follow(MachineEvent::LinkFailed(e.to_string()))
            }
        }
    }

    async fn schedule_reconnect(&mut self, class: FailureClass) {
        let delay = self.inner.factory.config().retry_delay(class) + jitter();
        info!(
            instance_id = %self.instance_id,
            ?class,
            attempt = self.machine.reconnect_attempts(),
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        self.events = None;
        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
        self.timer = Some((Instant::now() + delay, Timer::Reconnect));
    }

    async fn render(&self, reply: Reply) -> ConnectOutcome {
        match reply {
            Reply::Qr(payload) => match render_qr(payload.clone()).await {
                Ok(qr_code) => ConnectOutcome::QrCode {
                    qr_code,
                    qr_raw: payload,
                },
                Err(reason) => ConnectOutcome::Error { reason },
            },
            Reply::Connected => ConnectOutcome::Connected,
            Reply::Fallback => {
                let link = format!(
                    "{}{}",
                    self.inner.config.fallback_link_base,
                    self.phone_number.as_deref().unwrap_or_default()
                );
                match render_qr(link).await {
                    Ok(qr_code) => ConnectOutcome::Fallback { qr_code },
                    Err(reason) => ConnectOutcome::Error { reason },
                }
            }
            Reply::Disconnected { reason, code } => ConnectOutcome::Disconnected { reason, code },
            Reply::Timeout => ConnectOutcome::Timeout,
            Reply::Error(reason) => ConnectOutcome::Error { reason },
        }
    }

    /// Write the current state into the snapshot, unless a newer task owns it.
    fn publish(&self) {
        let status = SessionStatus::from(self.machine.state());
        let snapshot = TenantSession {
            instance_id: self.instance_id.clone(),
            phone_number: self.phone_number.clone(),
            status,
            last_seen_at: Utc::now(),
            generation: self.generation,
        };
        match self.inner.snapshots.entry(self.instance_id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().generation <= self.generation {
                    entry.insert(snapshot);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(snapshot);
            }
        }
    }

    fn touch(&self) {
        if let Some(mut snapshot) = self.inner.snapshots.get_mut(&self.instance_id) {
            if snapshot.generation == self.generation {
                snapshot.last_seen_at = Utc::now();
            }
        }
    }

    async fn cleanup(mut self) {
        self.inner
            .registry
            .remove_generation(&self.instance_id, self.generation);
        self.events = None;
        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
        self.inner
            .sessions
            .remove_if(&self.instance_id, |_, handle| handle.generation == self.generation);
        debug!(
            instance_id = %self.instance_id,
            generation = self.generation,
            state = %self.machine.state(),
            "Session task finished"
        );
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<ProtocolEvent>>) -> Option<ProtocolEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_timer(timer: Option<(Instant, Timer)>) -> Timer {
    match timer {
        Some((at, timer)) => {
            sleep_until(at).await;
            timer
        }
        None => std::future::pending().await,
    }
}

/// Encode a QR PNG off the async workers.
async fn render_qr(payload: String) -> Result<String, String> {
    match tokio::task::spawn_blocking(move || qr::render_base64(&payload)).await {
        Ok(Ok(qr_code)) => Ok(qr_code),
        Ok(Err(e)) => Err(format!("Failed to generate QR code: {}", e)),
        Err(e) => Err(format!("Failed to generate QR code: {}", e)),
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::rng().random_range(0..MAX_JITTER_MS))
}
