pub mod message;
pub mod session;

pub use message::{Attachment, MessageRecord, Sender};
pub use session::{ChatCategory, HandlerMode, Priority, SessionSummary, WireSession};
