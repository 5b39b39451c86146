use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Ordering;

/// Who authored a message. Wire names follow the server (`user`, `agent`, `ai`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sender {
    #[serde(rename = "user", alias = "customer")]
    Customer,
    #[serde(rename = "agent", alias = "human_agent", alias = "human-agent")]
    HumanAgent,
    #[serde(rename = "ai", alias = "automated")]
    Automated,
}

impl Sender {
    /// Tie-break rank for messages sharing a timestamp: the customer acts
    /// first, a human agent answers, the automated reply lands last.
    pub fn rank(self) -> u8 {
        match self {
            Sender::Customer => 0,
            Sender::HumanAgent => 1,
            Sender::Automated => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub url: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_image: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AttachmentWire {
    Url(String),
    Full {
        url: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        size: Option<u64>,
        #[serde(default, alias = "mime", alias = "mimeType")]
        mime_type: Option<String>,
        #[serde(default, alias = "isImage")]
        is_image: Option<bool>,
    },
}

impl From<AttachmentWire> for Attachment {
    fn from(wire: AttachmentWire) -> Self {
        match wire {
            AttachmentWire::Url(url) => {
                let name = file_name_of(&url);
                Attachment {
                    url,
                    name,
                    size: None,
                    mime_type: None,
                    is_image: None,
                }
            }
            AttachmentWire::Full {
                url,
                name,
                size,
                mime_type,
                is_image,
            } => {
                let name = name.unwrap_or_else(|| file_name_of(&url));
                Attachment {
                    url,
                    name,
                    size,
                    mime_type,
                    is_image,
                }
            }
        }
    }
}

impl<'de> Deserialize<'de> for Attachment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        AttachmentWire::deserialize(deserializer).map(Attachment::from)
    }
}

fn file_name_of(url: &str) -> String {
    url.rsplit('/').next().unwrap_or(url).to_string()
}

/// `null` and a missing field both mean "no attachments".
fn attachments_or_empty<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<Attachment>, D::Error> {
    Ok(Option::<Vec<Attachment>>::deserialize(deserializer)?.unwrap_or_default())
}

/// One chat message. Append-only: never updated in place once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    #[serde(default, alias = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "sender_type", alias = "senderType", alias = "sender")]
    pub sender: Sender,
    pub content: String,
    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        deserialize_with = "attachments_or_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub attachments: Vec<Attachment>,
}

impl MessageRecord {
    pub fn new(
        id: impl Into<String>,
        sender: Sender,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: None,
            sender,
            content: content.into(),
            created_at,
            attachments: Vec::new(),
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Total timeline order: `created_at`, then sender rank, then `id`.
    pub fn timeline_cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.sender.rank().cmp(&other.sender.rank()))
            .then_with(|| self.id.cmp(&other.id))
    }
}
