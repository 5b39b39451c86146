use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("All {attempts} retry attempts failed")]
    RetryExhausted { attempts: usize },

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("No credential available")]
    Unauthenticated,

    #[error("Conversation {session_id} is closed")]
    ConversationClosed { session_id: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl SyncError {
    /// Whether retrying the same request can succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            SyncError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            SyncError::Api { code, .. } => *code >= 500,
            SyncError::RetryExhausted { .. } | SyncError::Channel(_) => true,
            _ => false,
        }
    }
}
