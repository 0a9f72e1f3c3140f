//! Bridge protocol types for wagate.
//!
//! wagate never speaks the WhatsApp wire protocol itself. Each tenant
//! instance is served by a *bridge*: an external program that owns the
//! protocol session and talks to wagate over stdio using JSON Lines.
//!
//! - [`BridgeCommand`]: wagate → bridge (connect, send, shutdown)
//! - [`BridgeEvent`]: bridge → wagate (qr, open, close, credential rotation, ...)
//!
//! The crate also carries [`ClientConfig`], the tuning a bridge must apply
//! to its protocol client. The defaults are values tuned against the
//! upstream service's undocumented behaviour and should not be re-derived.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Disconnect status codes
// ============================================================================

/// Close status codes reported by the upstream protocol.
pub mod disconnect_codes {
    pub const LOGGED_OUT: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const METHOD_NOT_ALLOWED: u16 = 405;
    pub const CONNECTION_LOST: u16 = 408;
    pub const MULTIDEVICE_MISMATCH: u16 = 411;
    pub const CONNECTION_CLOSED: u16 = 428;
    pub const RATE_LIMITED: u16 = 429;
    pub const CONNECTION_REPLACED: u16 = 440;
    pub const BAD_SESSION: u16 = 500;
    pub const UNAVAILABLE_SERVICE: u16 = 503;
    pub const RESTART_REQUIRED: u16 = 515;
}

// ============================================================================
// FailureClass
// ============================================================================

/// Known classes of connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    LoggedOut,
    Forbidden,
    MethodNotAllowed,
    RequestTimeout,
    RateLimited,
    ServiceUnavailable,
    /// The socket was closed underneath us.
    Disconnect,
    /// The event stream ended without a status.
    End,
    Unknown,
}

impl FailureClass {
    /// Classify a close status. `None` means the stream ended without one.
    pub fn from_status(status: Option<u16>) -> Self {
        use disconnect_codes::*;

        match status {
            None => Self::End,
            Some(LOGGED_OUT) => Self::LoggedOut,
            Some(FORBIDDEN) => Self::Forbidden,
            Some(METHOD_NOT_ALLOWED) => Self::MethodNotAllowed,
            Some(CONNECTION_LOST) => Self::RequestTimeout,
            Some(RATE_LIMITED) => Self::RateLimited,
            Some(UNAVAILABLE_SERVICE) => Self::ServiceUnavailable,
            Some(CONNECTION_CLOSED | CONNECTION_REPLACED | RESTART_REQUIRED) => Self::Disconnect,
            Some(_) => Self::Unknown,
        }
    }

    /// Authentication failures that must never be retried.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::LoggedOut | Self::Forbidden)
    }
}

// ============================================================================
// RetryDelays
// ============================================================================

/// Per failure class retry delays, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryDelays {
    pub forbidden_ms: u64,
    pub method_not_allowed_ms: u64,
    pub request_timeout_ms: u64,
    pub rate_limited_ms: u64,
    pub service_unavailable_ms: u64,
    pub disconnect_ms: u64,
    pub end_ms: u64,
}

impl Default for RetryDelays {
    fn default() -> Self {
        Self {
            forbidden_ms: 5_000,
            method_not_allowed_ms: 15_000,
            request_timeout_ms: 3_000,
            rate_limited_ms: 10_000,
            service_unavailable_ms: 20_000,
            disconnect_ms: 15_000,
            end_ms: 15_000,
        }
    }
}

impl RetryDelays {
    /// Delay for `class`, falling back to `default_ms` for classes without an entry.
    pub fn delay_for(&self, class: FailureClass, default_ms: u64) -> Duration {
        let ms = match class {
            FailureClass::Forbidden => self.forbidden_ms,
            FailureClass::MethodNotAllowed => self.method_not_allowed_ms,
            FailureClass::RequestTimeout => self.request_timeout_ms,
            FailureClass::RateLimited => self.rate_limited_ms,
            FailureClass::ServiceUnavailable => self.service_unavailable_ms,
            FailureClass::Disconnect => self.disconnect_ms,
            FailureClass::End => self.end_ms,
            FailureClass::LoggedOut | FailureClass::Unknown => default_ms,
        };
        Duration::from_millis(ms)
    }
}

// ============================================================================
// ClientConfig
// ============================================================================

/// Identification presented to the network so reconnects look like the same device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSignature {
    pub platform: String,
    pub version: String,
    pub browser: String,
    pub browser_version: String,
}

impl Default for ClientSignature {
    fn default() -> Self {
        // Legacy web signature; newer ones trigger 405s during negotiation.
        Self {
            platform: "WhatsApp".to_string(),
            version: "2.23.24.84".to_string(),
            browser: "Chrome".to_string(),
            browser_version: "1.0".to_string(),
        }
    }
}

/// Verbosity of the protocol client's own diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolLogLevel {
    #[default]
    Off,
    Error,
    Warn,
    Info,
    Debug,
}

/// Configuration applied to every protocol client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub signature: ClientSignature,
    pub connect_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub default_query_timeout_ms: u64,
    pub retry_request_delay_ms: u64,
    pub max_restart_after_ms: u64,
    pub connect_cooldown_ms: u64,
    pub retry_delays: RetryDelays,
    pub sync_full_history: bool,
    pub mark_online_on_connect: bool,
    pub generate_high_quality_link_preview: bool,
    pub sync_history_messages: bool,
    /// JID suffixes excluded from inbound processing.
    pub ignored_jid_suffixes: Vec<String>,
    pub log_level: ProtocolLogLevel,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signature: ClientSignature::default(),
            connect_timeout_ms: 30_000,
            keep_alive_interval_ms: 30_000,
            default_query_timeout_ms: 60_000,
            retry_request_delay_ms: 3_000,
            max_restart_after_ms: 30_000,
            connect_cooldown_ms: 10_000,
            retry_delays: RetryDelays::default(),
            sync_full_history: false,
            mark_online_on_connect: false,
            generate_high_quality_link_preview: false,
            sync_history_messages: false,
            ignored_jid_suffixes: vec!["@newsletter".to_string(), "@broadcast".to_string()],
            log_level: ProtocolLogLevel::Off,
        }
    }
}

impl ClientConfig {
    /// Retry delay for a failure class, using the default retry delay for unknown classes.
    pub fn retry_delay(&self, class: FailureClass) -> Duration {
        self.retry_delays
            .delay_for(class, self.retry_request_delay_ms)
    }

    /// Whether inbound traffic from `jid` should be dropped (broadcast lists, newsletters).
    pub fn should_ignore_jid(&self, jid: &str) -> bool {
        self.ignored_jid_suffixes
            .iter()
            .any(|suffix| jid.contains(suffix.as_str()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ============================================================================
// Wire messages
// ============================================================================

/// Outbound message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundContent {
    Text { text: String },
    Image { url: String },
    Document { url: String },
}

impl OutboundContent {
    /// Build content from a loosely typed message type; unknown types are sent as text.
    pub fn from_type(message_type: &str, body: String) -> Self {
        match message_type {
            "image" => Self::Image { url: body },
            "document" => Self::Document { url: body },
            _ => Self::Text { text: body },
        }
    }
}

/// Commands sent from wagate to a bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeCommand {
    Connect {
        instance_id: String,
        config: ClientConfig,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<Value>,
    },
    Send {
        request_id: String,
        to: String,
        content: OutboundContent,
    },
    Shutdown,
}

/// Events sent from a bridge to wagate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// A pairing token to be rendered as a QR code.
    Qr { code: String },
    Open,
    CredsUpdate { credentials: Value },
    Close {
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        message: String,
    },
    /// Inbound message notification.
    Message { id: String, from: String },
    SendResult {
        request_id: String,
        message_id: String,
    },
    SendError { request_id: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_class_from_status() {
        assert_eq!(FailureClass::from_status(Some(401)), FailureClass::LoggedOut);
        assert_eq!(FailureClass::from_status(Some(403)), FailureClass::Forbidden);
        assert_eq!(
            FailureClass::from_status(Some(405)),
            FailureClass::MethodNotAllowed
        );
        assert_eq!(
            FailureClass::from_status(Some(429)),
            FailureClass::RateLimited
        );
        assert_eq!(FailureClass::from_status(Some(428)), FailureClass::Disconnect);
        assert_eq!(FailureClass::from_status(None), FailureClass::End);
        assert_eq!(FailureClass::from_status(Some(999)), FailureClass::Unknown);
    }

    #[test]
    fn only_auth_failures_are_terminal() {
        assert!(FailureClass::LoggedOut.is_terminal());
        assert!(FailureClass::Forbidden.is_terminal());
        assert!(!FailureClass::MethodNotAllowed.is_terminal());
        assert!(!FailureClass::Unknown.is_terminal());
    }

    #[test]
    fn retry_delay_table() {
        let config = ClientConfig::default();
        assert_eq!(
            config.retry_delay(FailureClass::MethodNotAllowed),
            Duration::from_secs(15)
        );
        assert_eq!(
            config.retry_delay(FailureClass::ServiceUnavailable),
            Duration::from_secs(20)
        );
        assert_eq!(
            config.retry_delay(FailureClass::Unknown),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn ignores_broadcast_and_newsletter() {
        let config = ClientConfig::default();
        assert!(config.should_ignore_jid("status@broadcast"));
        assert!(config.should_ignore_jid("120363@newsletter"));
        assert!(!config.should_ignore_jid("5511999999999@s.whatsapp.net"));
    }

    #[test]
    fn outbound_content_defaults_to_text() {
        assert_eq!(
            OutboundContent::from_type("sticker", "hi".to_string()),
            OutboundContent::Text {
                text: "hi".to_string()
            }
        );
        assert_eq!(
            OutboundContent::from_type("image", "https://x/y.png".to_string()),
            OutboundContent::Image {
                url: "https://x/y.png".to_string()
            }
        );
    }

    #[test]
    fn bridge_event_wire_format() {
        let event: BridgeEvent =
            serde_json::from_str(r#"{"type":"close","status":405,"message":"Method Not Allowed"}"#)
                .unwrap();
        match event {
            BridgeEvent::Close { status, message } => {
                assert_eq!(status, Some(405));
                assert_eq!(message, "Method Not Allowed");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let event: BridgeEvent = serde_json::from_str(r#"{"type":"close"}"#).unwrap();
        assert!(matches!(event, BridgeEvent::Close { status: None, .. }));
    }

    #[test]
    fn connect_command_omits_missing_credentials() {
        let cmd = BridgeCommand::Connect {
            instance_id: "t1".to_string(),
            config: ClientConfig::default(),
            credentials: None,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"type\":\"connect\""));
        assert!(!json.contains("credentials"));
        assert!(json.contains("\"browser\":\"Chrome\""));
    }
}
