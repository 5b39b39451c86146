//! Push-channel vocabulary.
//!
//! Every frame is a `{ "type": ..., "data": {...} }` envelope. Inbound
//! envelopes are kept raw ([`EventEnvelope`]) and mapped into the typed
//! [`InboundEvent`] view; unknown types survive as
//! [`InboundEvent::Unrecognized`] rather than failing.

use crate::models::{ChatCategory, HandlerMode, MessageRecord, SessionSummary, WireSession};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    fn data_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        match &self.data {
            serde_json::Value::Null => serde_json::from_value(serde_json::json!({})),
            data => T::deserialize(data),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageData {
    #[serde(default, alias = "sessionId")]
    session_id: Option<String>,
    message: MessageRecord,
}

#[derive(Debug, Deserialize)]
struct StatusChangedData {
    #[serde(alias = "sessionId")]
    session_id: String,
    status: ChatCategory,
    #[serde(default, alias = "handlerType")]
    handler_type: Option<HandlerMode>,
}

#[derive(Debug, Deserialize)]
struct UnreadData {
    #[serde(alias = "sessionId")]
    session_id: String,
    #[serde(alias = "unreadCount")]
    unread_count: u32,
}

#[derive(Debug, Deserialize)]
struct NewSessionData {
    session: WireSession,
}

#[derive(Debug, Deserialize)]
struct NoticeData {
    #[serde(default, alias = "sessionId")]
    session_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    #[serde(default)]
    message: Option<String>,
}

/// Typed view of an inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewMessage {
        session_id: Option<String>,
        message: MessageRecord,
    },
    /// Admin-side duplicate of a customer's `new_message`.
    CustomerMessage {
        session_id: Option<String>,
        message: MessageRecord,
    },
    SessionStatusChanged {
        session_id: String,
        status: ChatCategory,
        handler: Option<HandlerMode>,
    },
    UnreadCountUpdated {
        session_id: String,
        unread_count: u32,
    },
    NewChatSession {
        session: SessionSummary,
    },
    SessionCompleted {
        session_id: Option<String>,
        message: Option<String>,
    },
    AgentConnected {
        session_id: Option<String>,
        message: Option<String>,
    },
    Ack,
    ServerError {
        message: String,
    },
    Unrecognized(EventEnvelope),
}

impl InboundEvent {
    /// Map a raw envelope. An error means the type is known but its data
    /// does not have the expected shape.
    pub fn from_envelope(envelope: EventEnvelope) -> Result<Self, serde_json::Error> {
        let event = match envelope.kind.as_str() {
            "new_message" | "customer_message" => {
                let data: MessageData = envelope.data_as()?;
                let session_id = data.session_id.or_else(|| data.message.session_id.clone());
                if envelope.kind == "new_message" {
                    InboundEvent::NewMessage {
                        session_id,
                        message: data.message,
                    }
                } else {
                    InboundEvent::CustomerMessage {
                        session_id,
                        message: data.message,
                    }
                }
            }
            "session_status_changed" => {
                let data: StatusChangedData = envelope.data_as()?;
                InboundEvent::SessionStatusChanged {
                    session_id: data.session_id,
                    status: data.status,
                    handler: data.handler_type,
                }
            }
            "unread_count_updated" => {
                let data: UnreadData = envelope.data_as()?;
                InboundEvent::UnreadCountUpdated {
                    session_id: data.session_id,
                    unread_count: data.unread_count,
                }
            }
            // The server only announces sessions entering the pending list
            // this way, so a row without a status is a pending one.
            "new_chat_session" => {
                let data: NewSessionData = envelope.data_as()?;
                InboundEvent::NewChatSession {
                    session: data.session.into_summary(ChatCategory::Pending),
                }
            }
            "session_completed" => {
                let data: NoticeData = envelope.data_as()?;
                InboundEvent::SessionCompleted {
                    session_id: data.session_id,
                    message: data.message,
                }
            }
            "agent_connected" => {
                let data: NoticeData = envelope.data_as()?;
                InboundEvent::AgentConnected {
                    session_id: data.session_id,
                    message: data.message,
                }
            }
            "ack" => InboundEvent::Ack,
            "error" => {
                let data: ErrorData = envelope.data_as()?;
                InboundEvent::ServerError {
                    message: data.message.unwrap_or_default(),
                }
            }
            _ => InboundEvent::Unrecognized(envelope),
        };
        Ok(event)
    }

    /// Parse one text frame all the way to a typed event.
    pub fn parse_frame(frame: &str) -> Result<Self, serde_json::Error> {
        Self::from_envelope(EventEnvelope::parse(frame)?)
    }

    /// The session this event refers to, when it names one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            InboundEvent::NewMessage { session_id, .. }
            | InboundEvent::CustomerMessage { session_id, .. }
            | InboundEvent::SessionCompleted { session_id, .. }
            | InboundEvent::AgentConnected { session_id, .. } => session_id.as_deref(),
            InboundEvent::SessionStatusChanged { session_id, .. }
            | InboundEvent::UnreadCountUpdated { session_id, .. } => Some(session_id),
            InboundEvent::NewChatSession { session } => Some(&session.id),
            InboundEvent::Ack
            | InboundEvent::ServerError { .. }
            | InboundEvent::Unrecognized(_) => None,
        }
    }
}

/// Client → server envelopes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    SubscribeChats { chat_type: ChatCategory },
    AgentMessage { session_id: String, content: String },
    SendMessage { session_id: String, content: String },
    Typing { session_id: String },
}

impl OutboundEvent {
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
