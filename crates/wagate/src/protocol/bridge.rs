//! Subprocess bridge client.
//!
//! One bridge process per instance. wagate writes [`BridgeCommand`]s to its
//! stdin and reads [`BridgeEvent`]s from its stdout, one JSON object per line.
//! Send results are correlated back to callers by request id.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};
use wagate_protocol::{BridgeCommand, BridgeEvent, ProtocolLogLevel};

use super::{
    ClientConfig, ClientFactory, CloseReason, OutboundContent, ProtocolClient, ProtocolError,
    ProtocolEvent,
};
use crate::config::BridgeConfig;
use crate::store::Credentials;

const EVENT_BUFFER: usize = 64;

type SendWaiters = Arc<DashMap<String, oneshot::Sender<Result<String, String>>>>;

// ============================================================================
// BridgeClientFactory
// ============================================================================

/// Builds [`ProtocolClient`]s backed by a bridge subprocess.
pub struct BridgeClientFactory {
    bridge: BridgeConfig,
    config: ClientConfig,
}

impl BridgeClientFactory {
    pub fn new(bridge: BridgeConfig, config: ClientConfig) -> Self {
        Self { bridge, config }
    }
}

impl ClientFactory for BridgeClientFactory {
    fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn create(
        &self,
        instance_id: &str,
        credentials: Option<Credentials>,
    ) -> Result<Arc<dyn ProtocolClient>, ProtocolError> {
        if self.bridge.command.trim().is_empty() {
            return Err(ProtocolError::Construction(
                "no bridge command configured".to_string(),
            ));
        }

        let stderr = match self.config.log_level {
            ProtocolLogLevel::Off => Stdio::null(),
            _ => Stdio::inherit(),
        };

        let mut child = Command::new(&self.bridge.command)
            .args(&self.bridge.args)
            .env("WAGATE_INSTANCE_ID", instance_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProtocolError::Construction(format!(
                    "failed to spawn bridge '{}': {}",
                    self.bridge.command, e
                ))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ProtocolError::Construction(
                "bridge stdio not captured".to_string(),
            ));
        };

        debug!(instance_id, pid = ?child.id(), "Bridge process spawned");

        Ok(Arc::new(BridgeClient {
            instance_id: instance_id.to_string(),
            config: self.config.clone(),
            credentials,
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(Some(stdout)),
            waiters: Arc::new(DashMap::new()),
        }))
    }
}

// ============================================================================
// BridgeClient
// ============================================================================

struct BridgeClient {
    instance_id: String,
    config: ClientConfig,
    credentials: Option<Credentials>,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,
    waiters: SendWaiters,
}

impl BridgeClient {
    async fn write_command(&self, command: &BridgeCommand) -> Result<(), ProtocolError> {
        let mut line = serde_json::to_string(command)
            .map_err(|e| ProtocolError::Send(format!("failed to encode command: {}", e)))?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ProtocolError::Closed)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn connect(&self) -> Result<mpsc::Receiver<ProtocolEvent>, ProtocolError> {
        let stdout = self
            .stdout
            .lock()
            .await
            .take()
            .ok_or(ProtocolError::AlreadyConnected)?;

        self.write_command(&BridgeCommand::Connect {
            instance_id: self.instance_id.clone(),
            config: self.config.clone(),
            credentials: self.credentials.as_ref().map(|c| c.0.clone()),
        })
        .await?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(read_events(
            self.instance_id.clone(),
            stdout,
            self.config.clone(),
            self.waiters.clone(),
            tx,
        ));
        Ok(rx)
    }

    async fn send(&self, to: &str, content: OutboundContent) -> Result<String, ProtocolError> {
        let request_id = ulid::Ulid::new().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request_id.clone(), tx);

        let command = BridgeCommand::Send {
            request_id: request_id.clone(),
            to: to.to_string(),
            content,
        };
        if let Err(e) = self.write_command(&command).await {
            self.waiters.remove(&request_id);
            return Err(e);
        }

        let timeout = std::time::Duration::from_millis(self.config.default_query_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(message_id))) => Ok(message_id),
            Ok(Ok(Err(message))) => Err(ProtocolError::Send(message)),
            Ok(Err(_)) => Err(ProtocolError::Closed),
            Err(_) => {
                self.waiters.remove(&request_id);
                Err(ProtocolError::Timeout(timeout))
            }
        }
    }

    async fn shutdown(&self) {
        if self.write_command(&BridgeCommand::Shutdown).await.is_ok() {
            debug!(instance_id = %self.instance_id, "Bridge shutdown requested");
        }
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        match tokio::time::timeout(self.config.connect_timeout() / 10, child.wait()).await {
            Ok(Ok(status)) => debug!(instance_id = %self.instance_id, %status, "Bridge exited"),
            _ => {
                if let Err(e) = child.kill().await {
                    warn!(instance_id = %self.instance_id, error = %e, "Failed to kill bridge");
                }
            }
        }
    }
}

/// Pump bridge stdout into the event channel until EOF.
async fn read_events(
    instance_id: String,
    stdout: ChildStdout,
    config: ClientConfig,
    waiters: SendWaiters,
    tx: mpsc::Sender<ProtocolEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut closed = false;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(%instance_id, error = %e, "Bridge stdout read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<BridgeEvent>(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(%instance_id, error = %e, "Ignoring malformed bridge event");
                continue;
            }
        };

        let mapped = match event {
            BridgeEvent::Qr { code } => Some(ProtocolEvent::Qr(code)),
            BridgeEvent::Open => Some(ProtocolEvent::Open),
            BridgeEvent::CredsUpdate { credentials } => {
                Some(ProtocolEvent::CredentialsUpdated(Credentials(credentials)))
            }
            BridgeEvent::Close { status, message } => {
                closed = true;
                Some(ProtocolEvent::Closed(CloseReason::new(status, message)))
            }
            BridgeEvent::Message { id, from } => {
                if config.should_ignore_jid(&from) {
                    None
                } else {
                    Some(ProtocolEvent::Inbound { id, from })
                }
            }
            BridgeEvent::SendResult {
                request_id,
                message_id,
            } => {
                if let Some((_, waiter)) = waiters.remove(&request_id) {
                    let _ = waiter.send(Ok(message_id));
                }
                None
            }
            BridgeEvent::SendError {
                request_id,
                message,
            } => {
                if let Some((_, waiter)) = waiters.remove(&request_id) {
                    let _ = waiter.send(Err(message));
                }
                None
            }
        };

        if let Some(event) = mapped {
            if tx.send(event).await.is_err() {
                break;
            }
        }
        if closed {
            break;
        }
    }

    // Dropping the waiters fails any send still in flight.
    waiters.clear();
    if !closed {
        let _ = tx
            .send(ProtocolEvent::Closed(CloseReason::stream_ended()))
            .await;
    }
    debug!(%instance_id, "Bridge event stream ended");
}
