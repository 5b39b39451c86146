pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod models;
pub mod reconciler;
pub mod resync;
pub mod sessions;
pub mod snapshot;
pub mod transport;

pub use config::ParleyConfig;
pub use connection::{
    channel_url, ChannelHandler, ChannelSession, ChannelState, ChannelStats, ConnectionHandle,
    ConnectionManager, CredentialProvider, Outbound, StaticToken,
};
pub use envelope::{EventEnvelope, InboundEvent, OutboundEvent};
pub use error::SyncError;
pub use models::{ChatCategory, HandlerMode, MessageRecord, Sender, SessionSummary};
pub use reconciler::{merge, LoadTicket, MessageReconciler, OutgoingMessage, Role, Timeline};
pub use resync::ResyncLimiter;
pub use sessions::{FetchTicket, ResyncRequest, SessionListSync};
pub use snapshot::{DateRange, RestClient, SessionFilter, SnapshotSource};
pub use transport::{Connector, Link, WsConnector};
