//! Snapshot fetches over REST.
//!
//! Provides a `SnapshotSource` trait (what the reconciler and synchronizer
//! consume) and `RestClient`, its reqwest implementation against the chat
//! server's endpoints.

use crate::config::{HttpConfig, ParleyConfig};
use crate::connection::CredentialProvider;
use crate::error::SyncError;
use crate::models::{ChatCategory, HandlerMode, MessageRecord, SessionSummary, WireSession};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

// ============================================================================
// SnapshotSource trait
// ============================================================================

/// Point-in-time state from the server. Results may race with push events;
/// callers merge them rather than trusting either side alone.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>, SyncError>;

    async fn fetch_sessions(
        &self,
        category: ChatCategory,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionSummary>, SyncError>;
}

// ============================================================================
// Filters
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DateRange {
    #[default]
    All,
    Today,
    Week,
    Month,
}

impl DateRange {
    pub fn as_str(self) -> &'static str {
        match self {
            DateRange::All => "all",
            DateRange::Today => "today",
            DateRange::Week => "week",
            DateRange::Month => "month",
        }
    }

    fn cutoff(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            DateRange::All => None,
            DateRange::Today => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|midnight| midnight.and_utc()),
            DateRange::Week => Some(now - ChronoDuration::days(7)),
            DateRange::Month => Some(now - ChronoDuration::days(30)),
        }
    }
}

impl FromStr for DateRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(DateRange::All),
            "today" => Ok(DateRange::Today),
            "week" => Ok(DateRange::Week),
            "month" => Ok(DateRange::Month),
            other => Err(format!("unknown date range '{}'", other)),
        }
    }
}

/// List filter, sent to the server and re-applied locally to pushed sessions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionFilter {
    /// Business label; `None` means all labels.
    pub label: Option<String>,
    /// Case-insensitive substring of the customer name.
    pub search: String,
    /// Completed list only.
    pub handler: Option<HandlerMode>,
    /// Completed list only.
    pub date_range: DateRange,
}

impl SessionFilter {
    pub fn matches(&self, session: &SessionSummary) -> bool {
        self.matches_at(session, Utc::now())
    }

    pub fn matches_at(&self, session: &SessionSummary, now: DateTime<Utc>) -> bool {
        if let Some(label) = &self.label {
            if session.category_label.as_deref() != Some(label.as_str()) {
                return false;
            }
        }

        let needle = self.search.trim().to_lowercase();
        if !needle.is_empty() {
            let name = session.customer_name.as_deref().unwrap_or_default().to_lowercase();
            if !name.contains(&needle) {
                return false;
            }
        }

        if session.category == ChatCategory::Completed {
            if let Some(handler) = self.handler {
                if session.handler_mode != handler {
                    return false;
                }
            }
            if let (Some(cutoff), Some(completed_at)) =
                (self.date_range.cutoff(now), session.completed_at)
            {
                if completed_at < cutoff {
                    return false;
                }
            }
        }

        true
    }

    fn query(&self, category: ChatCategory) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("category", self.label.clone().unwrap_or_else(|| "all".to_string())),
            ("search", self.search.trim().to_string()),
        ];
        if category == ChatCategory::Completed {
            let handler = match self.handler {
                None => "all",
                Some(HandlerMode::Automated) => "AI",
                Some(HandlerMode::Human) => "상담원",
            };
            query.push(("handler", handler.to_string()));
            query.push(("dateRange", self.date_range.as_str().to_string()));
        }
        query
    }
}

// ============================================================================
// Server envelope (private)
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    detail: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MessagesData {
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct SendMessageBody<'a> {
    session_id: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct SentData {
    message: MessageRecord,
}

#[derive(Debug, Deserialize)]
struct ChatsData {
    #[serde(default)]
    chats: Vec<serde_json::Value>,
}

/// Decode each row on its own so one bad row does not sink the snapshot.
fn decode_rows<T: DeserializeOwned>(rows: Vec<serde_json::Value>, what: &str) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<T>(row) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, kind = what, "Skipping undecodable snapshot row");
                None
            }
        })
        .collect()
}

// ============================================================================
// RestClient
// ============================================================================

/// REST client for the chat server's snapshot and send endpoints.
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
    max_retries: usize,
    retry_delay_ms: u64,
}

impl RestClient {
    pub fn new(
        config: &ParleyConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, SyncError> {
        Self::with_base_url(&config.http, config.server.base_url.clone(), credentials)
    }

    /// Create a client with a custom base URL (for testing / integration)
    pub fn with_base_url(
        config: &HttpConfig,
        base_url: String,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        })
    }

    /// `GET /health`, unauthenticated.
    pub async fn health(&self) -> Result<serde_json::Value, SyncError> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Api {
                code: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    async fn get_data<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&'static str, String)],
    ) -> Result<T, SyncError> {
        let token = self
            .credentials
            .bearer_token()
            .ok_or(SyncError::Unauthenticated)?;

        let retry_strategy = ExponentialBackoff::from_millis(2)
            .factor(self.retry_delay_ms.max(1))
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.max_retries);

        let result = RetryIf::spawn(
            retry_strategy,
            || self.get_once::<T>(path, query, &token),
            |e: &SyncError| {
                let retry = e.is_retriable();
                if retry {
                    tracing::debug!(path, error = %e, "Snapshot fetch failed; retrying");
                }
                retry
            },
        )
        .await;

        match result {
            Ok(data) => Ok(data),
            Err(e) if e.is_retriable() => {
                tracing::error!(
                    path,
                    attempts = self.max_retries + 1,
                    error = %e,
                    "All snapshot fetch attempts failed"
                );
                Err(SyncError::RetryExhausted {
                    attempts: self.max_retries + 1,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&'static str, String)],
        token: &str,
    ) -> Result<T, SyncError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        read_data(response, path).await
    }

    /// `POST /api/chats/messages`: the server stores the message, fans it
    /// out on the push channel, and returns the stored record.
    ///
    /// Sent once. A retry after an ambiguous failure could store the message
    /// twice, so that decision is left to the caller.
    pub async fn send_message(
        &self,
        session_id: &str,
        content: &str,
    ) -> Result<MessageRecord, SyncError> {
        let token = self
            .credentials
            .bearer_token()
            .ok_or(SyncError::Unauthenticated)?;
        let path = "/api/chats/messages";
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&SendMessageBody {
                session_id,
                content,
            })
            .send()
            .await?;

        let data: SentData = read_data(response, path).await?;
        tracing::debug!(session_id, message_id = %data.message.id, "Message sent over REST");
        Ok(data.message)
    }
}

async fn read_data<T: DeserializeOwned>(
    response: reqwest::Response,
    path: &str,
) -> Result<T, SyncError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorDetail>(&body)
            .ok()
            .map(|e| match e.detail {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or(body);
        tracing::warn!(code = status.as_u16(), message = %message, path, "Chat API error");
        return Err(SyncError::Api {
            code: status.as_u16(),
            message,
        });
    }

    let envelope: ApiEnvelope<T> = response.json().await?;
    if !envelope.success {
        return Err(SyncError::Api {
            code: status.as_u16(),
            message: envelope.message.unwrap_or_else(|| "request rejected".to_string()),
        });
    }
    envelope.data.ok_or_else(|| SyncError::Api {
        code: status.as_u16(),
        message: "response carried no data".to_string(),
    })
}

#[async_trait]
impl SnapshotSource for RestClient {
    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>, SyncError> {
        let path = format!("/api/chats/messages/{}", conversation_id);
        let data: MessagesData = self.get_data(&path, &[]).await?;
        let messages = decode_rows(data.messages, "message");
        tracing::debug!(conversation_id, count = messages.len(), "Fetched message snapshot");
        Ok(messages)
    }

    async fn fetch_sessions(
        &self,
        category: ChatCategory,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionSummary>, SyncError> {
        let path = format!("/api/admin/chats/{}", category);
        let data: ChatsData = self.get_data(&path, &filter.query(category)).await?;
        let sessions: Vec<SessionSummary> = decode_rows::<WireSession>(data.chats, "session")
            .into_iter()
            .map(|row| row.into_summary(category))
            .collect();
        tracing::debug!(%category, count = sessions.len(), "Fetched session list snapshot");
        Ok(sessions)
    }
}

// ============================================================================
// TESTS
// ============================================================================
