use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{ConnectionStatus, SessionId, SubscriptionId, ThemeSettings, TimerState, TimerUpdate},
    error::ProtocolError,
};

/// Raw feed frame: `{metadata: {message_type, ..}, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedFrame {
    pub metadata: FrameMetadata,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRef {
    pub id: SubscriptionId,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub subscription: SubscriptionRef,
    #[serde(default)]
    pub event: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Welcome {
        session_id: SessionId,
        keepalive_timeout_seconds: Option<u64>,
    },
    Keepalive,
    Notification(Notification),
    /// Migrate directive. `reconnect_url` is `None` when the feed omitted it.
    Reconnect {
        reconnect_url: Option<String>,
    },
    Revocation {
        subscription_id: SubscriptionId,
        status: Option<String>,
    },
}

impl FeedMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: FeedFrame = serde_json::from_str(text)?;
        Self::from_frame(frame)
    }

    pub fn from_frame(frame: FeedFrame) -> Result<Self, ProtocolError> {
        let payload = frame.payload;
        match frame.metadata.message_type.as_str() {
            "session_welcome" => {
                let session = payload.get("session");
                let session_id = session
                    .and_then(|s| s.get("id"))
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .ok_or(ProtocolError::MissingField {
                        message_type: "session_welcome",
                        field: "payload.session.id",
                    })?;
                Ok(Self::Welcome {
                    session_id: SessionId::from(session_id),
                    keepalive_timeout_seconds: session
                        .and_then(|s| s.get("keepalive_timeout_seconds"))
                        .and_then(Value::as_u64),
                })
            }
            "session_keepalive" => Ok(Self::Keepalive),
            "notification" => Ok(Self::Notification(serde_json::from_value(payload)?)),
            "session_reconnect" => Ok(Self::Reconnect {
                reconnect_url: payload
                    .get("session")
                    .and_then(|s| s.get("reconnect_url"))
                    .and_then(Value::as_str)
                    .filter(|url| !url.trim().is_empty())
                    .map(str::to_string),
            }),
            "revocation" => {
                let subscription = payload.get("subscription");
                let subscription_id = subscription
                    .and_then(|s| s.get("id"))
                    .and_then(Value::as_str)
                    .ok_or(ProtocolError::MissingField {
                        message_type: "revocation",
                        field: "payload.subscription.id",
                    })?;
                Ok(Self::Revocation {
                    subscription_id: SubscriptionId::from(subscription_id),
                    status: subscription
                        .and_then(|s| s.get("status"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            }
            other => Err(ProtocolError::UnknownMessageType(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "session_welcome",
            Self::Keepalive => "session_keepalive",
            Self::Notification(_) => "notification",
            Self::Reconnect { .. } => "session_reconnect",
            Self::Revocation { .. } => "revocation",
        }
    }
}

/// Tagged frames on the overlay broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OverlayEvent {
    Theme { settings: ThemeSettings },
}

/// Everything the broadcast server writes: a bare timer state or a tagged event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OverlayFrame {
    Event(OverlayEvent),
    Timer(TimerState),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OverlayRequest {
    GetTheme,
}

/// Events for the desktop UI bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum UiEvent {
    TimerUpdate(TimerUpdate),
    TimerIncrement {
        #[serde(rename = "timeToAdd")]
        time_to_add: f64,
        reason: String,
    },
    FeedStatus {
        status: ConnectionStatus,
    },
    /// Notifications the translator has no rule for, passed through for diagnostics.
    RawNotification(Notification),
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
