//! Protocol client adapter.
//!
//! The messaging protocol is an opaque capability: something that can
//! connect, emit connection-state events, and send messages. A
//! [`ClientFactory`] builds one configured [`ProtocolClient`] per tenant
//! instance; building never touches the network.
//!
//! The shipped factory is [`BridgeClientFactory`], which drives an external
//! bridge program over the `wagate-protocol` JSON Lines protocol.

mod bridge;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use bridge::BridgeClientFactory;
pub use wagate_protocol::{ClientConfig, FailureClass, OutboundContent, disconnect_codes};

use crate::store::Credentials;

/// Connection-state events emitted by a protocol client.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// A pairing token to render as a QR code.
    Qr(String),
    Open,
    CredentialsUpdated(Credentials),
    Closed(CloseReason),
    /// Inbound message that passed the JID filter.
    Inbound { id: String, from: String },
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub status: Option<u16>,
    pub message: String,
}

impl CloseReason {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// The event stream ended without an explicit close.
    pub fn stream_ended() -> Self {
        Self::new(None, "Connection lost")
    }

    pub fn class(&self) -> FailureClass {
        FailureClass::from_status(self.status)
    }

    /// 405 during negotiation, reported either as a status or only in the message.
    pub fn is_method_not_allowed(&self) -> bool {
        self.status == Some(disconnect_codes::METHOD_NOT_ALLOWED)
            || self.message.contains("Method Not Allowed")
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to construct protocol client: {0}")]
    Construction(String),

    #[error("protocol client already connected")]
    AlreadyConnected,

    #[error("protocol client io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol client is closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

/// A live protocol session for one tenant instance.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Start connecting and subscribe to connection-state events.
    ///
    /// May be called once per client.
    async fn connect(&self) -> Result<mpsc::Receiver<ProtocolEvent>, ProtocolError>;

    /// Send a message and return the remote message id.
    async fn send(&self, to: &str, content: OutboundContent) -> Result<String, ProtocolError>;

    /// Tear the session down. Idempotent.
    async fn shutdown(&self);
}

/// Builds configured protocol clients.
pub trait ClientFactory: Send + Sync {
    /// Policy applied to every client this factory builds.
    fn config(&self) -> &ClientConfig;

    /// Construct a client for `instance_id`, resuming from `credentials` when given.
    fn create(
        &self,
        instance_id: &str,
        credentials: Option<Credentials>,
    ) -> Result<Arc<dyn ProtocolClient>, ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_not_allowed_detected_by_status_or_message() {
        assert!(CloseReason::new(Some(405), "").is_method_not_allowed());
        assert!(
            CloseReason::new(None, "Request failed: Method Not Allowed").is_method_not_allowed()
        );
        assert!(!CloseReason::new(Some(428), "Connection Closed").is_method_not_allowed());
    }

    #[test]
    fn stream_end_classifies_as_end() {
        assert_eq!(CloseReason::stream_ended().class(), FailureClass::End);
        assert_eq!(
            CloseReason::new(Some(401), "logged out").class(),
            FailureClass::LoggedOut
        );
    }
}
