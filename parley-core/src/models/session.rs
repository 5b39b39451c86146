use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three disjoint lists a session can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatCategory {
    Active,
    Pending,
    Completed,
}

impl ChatCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatCategory::Active => "active",
            ChatCategory::Pending => "pending",
            ChatCategory::Completed => "completed",
        }
    }
}

impl fmt::Display for ChatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ChatCategory::Active),
            "pending" => Ok(ChatCategory::Pending),
            "completed" => Ok(ChatCategory::Completed),
            other => Err(format!("unknown chat category: {other}")),
        }
    }
}

/// Who is currently answering the customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerMode {
    #[serde(rename = "ai", alias = "automated")]
    Automated,
    #[serde(rename = "agent", alias = "human")]
    Human,
}

impl HandlerMode {
    fn from_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ai" | "automated" => Some(HandlerMode::Automated),
            "agent" | "human" | "상담원" => Some(HandlerMode::Human),
            _ => None,
        }
    }
}

/// Pending-list triage priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub customer_ref: String,
    pub customer_name: Option<String>,
    pub category: ChatCategory,
    /// Business classification assigned by the server ("shipping", "refund", ...).
    pub category_label: Option<String>,
    pub last_message_preview: String,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub handler_mode: HandlerMode,
    pub unread_count: u32,
    pub priority: Option<Priority>,
    pub wait_minutes: Option<u32>,
    pub summary: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionSummary {
    pub fn new(id: impl Into<String>, category: ChatCategory) -> Self {
        Self {
            id: id.into(),
            customer_ref: String::new(),
            customer_name: None,
            category,
            category_label: None,
            last_message_preview: String::new(),
            last_activity_at: None,
            handler_mode: HandlerMode::Automated,
            unread_count: 0,
            priority: None,
            wait_minutes: None,
            summary: None,
            completed_at: None,
        }
    }
}

/// Session shape as the server emits it, in list rows and in
/// `new_chat_session` pushes. Field names differ per list, so every known
/// spelling is accepted and normalised by [`WireSession::into_summary`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireSession {
    pub id: String,
    #[serde(default, alias = "customerRef", alias = "customer_ref")]
    pub customer_id: Option<String>,
    #[serde(default, alias = "customerName")]
    pub customer_name: Option<String>,
    /// Business label on the server; a list category on some clients.
    #[serde(default)]
    pub category: Option<String>,
    /// Either a list category or, on the active list, the handler (`ai|agent`).
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "handlerType", alias = "handler_mode")]
    pub handler_type: Option<String>,
    #[serde(default)]
    pub handled_by: Option<String>,
    #[serde(default, alias = "issue", alias = "last_message_preview", alias = "lastMessage")]
    pub last_message: Option<String>,
    #[serde(default, alias = "last_message_at", alias = "last_activity_at", alias = "lastActivityAt")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "unread_count", alias = "unreadCount")]
    pub unread: Option<u32>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default, alias = "wait_minutes")]
    pub wait_time: Option<u32>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl WireSession {
    /// Normalise into a summary. `fallback` is the list category to assume
    /// when the row does not name one.
    pub fn into_summary(self, fallback: ChatCategory) -> SessionSummary {
        let status = self.status.as_deref();
        let category = status
            .and_then(|s| s.parse::<ChatCategory>().ok())
            .or_else(|| {
                self.category
                    .as_deref()
                    .and_then(|c| c.parse::<ChatCategory>().ok())
            })
            .unwrap_or(fallback);

        // A category field that is really a list name is not a business label.
        let category_label = self
            .category
            .filter(|c| c.parse::<ChatCategory>().is_err() && !c.trim().is_empty());

        let handler_mode = self
            .handler_type
            .as_deref()
            .and_then(HandlerMode::from_wire)
            .or_else(|| status.and_then(HandlerMode::from_wire))
            .or_else(|| {
                self.handled_by
                    .as_deref()
                    .map(|h| HandlerMode::from_wire(h).unwrap_or(HandlerMode::Human))
            })
            .unwrap_or(HandlerMode::Automated);

        let last_activity_at = self
            .timestamp
            .or(self.completed_at)
            .or(self.started_at);

        SessionSummary {
            id: self.id,
            customer_ref: self.customer_id.unwrap_or_default(),
            customer_name: self.customer_name,
            category,
            category_label,
            last_message_preview: self.last_message.unwrap_or_default(),
            last_activity_at,
            handler_mode,
            unread_count: self.unread.unwrap_or(0),
            priority: self.priority,
            wait_minutes: self.wait_time,
            summary: self.summary.filter(|s| !s.is_empty()),
            completed_at: self.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(value: serde_json::Value) -> WireSession {
        serde_json::from_value(value).expect("wire session should decode")
    }

    #[test]
    fn test_active_row_status_is_handler() {
        let summary = wire(serde_json::json!({
            "id": "s1",
            "customer_id": "c1",
            "customer_name": "kim@example.com",
            "category": "shipping",
            "last_message": "still waiting",
            "timestamp": "2026-03-01T10:05:00+00:00",
            "status": "agent",
            "unread": 2
        }))
        .into_summary(ChatCategory::Active);

        assert_eq!(summary.category, ChatCategory::Active);
        assert_eq!(summary.handler_mode, HandlerMode::Human);
        assert_eq!(summary.category_label.as_deref(), Some("shipping"));
        assert_eq!(summary.unread_count, 2);
        assert_eq!(summary.last_message_preview, "still waiting");
        assert!(summary.last_activity_at.is_some());
    }

    #[test]
    fn test_pending_row_uses_issue_and_priority() {
        let summary = wire(serde_json::json!({
            "id": "s2",
            "customer_id": "c2",
            "category": "refund",
            "issue": "wants a refund",
            "wait_time": 12,
            "priority": "high"
        }))
        .into_summary(ChatCategory::Pending);

        assert_eq!(summary.category, ChatCategory::Pending);
        assert_eq!(summary.last_message_preview, "wants a refund");
        assert_eq!(summary.priority, Some(Priority::High));
        assert_eq!(summary.wait_minutes, Some(12));
        assert_eq!(summary.handler_mode, HandlerMode::Automated);
    }

    #[test]
    fn test_completed_row_handled_by_human() {
        let summary = wire(serde_json::json!({
            "id": "s3",
            "customer_id": "c3",
            "handled_by": "상담원",
            "completed_at": "2026-03-01T11:00:00Z",
            "summary": ""
        }))
        .into_summary(ChatCategory::Completed);

        assert_eq!(summary.handler_mode, HandlerMode::Human);
        assert_eq!(summary.summary, None);
        assert_eq!(summary.last_activity_at, summary.completed_at);
    }

    #[test]
    fn test_explicit_list_status_wins_over_fallback() {
        let summary = wire(serde_json::json!({"id": "s4", "status": "completed"}))
            .into_summary(ChatCategory::Pending);
        assert_eq!(summary.category, ChatCategory::Completed);
        assert_eq!(summary.category_label, None);
    }
}
