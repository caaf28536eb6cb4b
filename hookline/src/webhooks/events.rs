//! Webhook event catalog and the envelope delivered to endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ScopeId;

/// The closed catalog of events an endpoint can subscribe to.
///
/// Adding a variant here is the only supported way to introduce a new event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "message.received")]
    MessageReceived,
    #[serde(rename = "message.sent")]
    MessageSent,
    #[serde(rename = "message.delivered")]
    MessageDelivered,
    #[serde(rename = "message.read")]
    MessageRead,
    #[serde(rename = "session.connected")]
    SessionConnected,
    #[serde(rename = "session.disconnected")]
    SessionDisconnected,
    /// A new pairing QR code is available for the session
    #[serde(rename = "session.qr")]
    SessionQr,
    /// Synthetic ping used to check an endpoint's configuration
    #[serde(rename = "webhook.test")]
    WebhookTest,
}

impl EventName {
    pub const ALL: [EventName; 8] = [
        Self::MessageReceived,
        Self::MessageSent,
        Self::MessageDelivered,
        Self::MessageRead,
        Self::SessionConnected,
        Self::SessionDisconnected,
        Self::SessionQr,
        Self::WebhookTest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageReceived => "message.received",
            Self::MessageSent => "message.sent",
            Self::MessageDelivered => "message.delivered",
            Self::MessageRead => "message.read",
            Self::SessionConnected => "session.connected",
            Self::SessionDisconnected => "session.disconnected",
            Self::SessionQr => "session.qr",
            Self::WebhookTest => "webhook.test",
        }
    }

    /// Comma separated list of every event name, for error messages.
    pub fn catalog() -> String {
        Self::ALL.iter().map(EventName::as_str).collect::<Vec<_>>().join(", ")
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| format!("Unknown event type: {}", s))
    }
}

/// Complete webhook payload, immutable once built.
///
/// Serializes as `{"event", "timestamp", "sessionId", "data"}`; the serialized bytes are what
/// gets signed and sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    event: EventName,
    timestamp: DateTime<Utc>,
    #[serde(rename = "sessionId")]
    session_id: Option<ScopeId>,
    data: serde_json::Value,
}

impl Envelope {
    pub fn new(event: EventName, session_id: Option<ScopeId>, data: serde_json::Value) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
            session_id,
            data,
        }
    }

    /// The synthetic `webhook.test` ping sent when an endpoint is created or re-targeted.
    pub fn test_ping(session_id: Option<ScopeId>) -> Self {
        Self::new(
            EventName::WebhookTest,
            session_id,
            serde_json::json!({
                "message": "This is a test webhook delivery",
            }),
        )
    }

    pub fn event(&self) -> EventName {
        self.event
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Canonical wire form: compact JSON with a fixed field order.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
