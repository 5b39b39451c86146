//! Channel transport seam.
//!
//! The connection manager only sees a [`Link`]: a sink of outgoing text
//! frames and a stream of incoming ones. [`WsConnector`] backs it with a
//! WebSocket; tests back it with in-memory pipes.
//!
//! A stream item of `Err(SyncError::MalformedFrame)` is a bad frame on a
//! healthy channel. Any other error ends the link.

use crate::error::SyncError;
use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::{self, Message};

pub type FrameSink = Pin<Box<dyn Sink<String, Error = SyncError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, SyncError>> + Send>>;

/// One established channel. Dropping it releases the underlying transport.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Link, SyncError>;
}

/// Production connector over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Link, SyncError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SyncError::Channel(e.to_string()))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .with(|text: String| future::ready(Ok::<_, tungstenite::Error>(Message::Text(text.into()))))
            .sink_map_err(|e| SyncError::Channel(e.to_string()));

        let stream = read.filter_map(|msg| future::ready(decode_message(msg)));

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Text and binary frames carry JSON text. Control frames are consumed by
/// tungstenite and yield nothing here.
fn decode_message(msg: Result<Message, tungstenite::Error>) -> Option<Result<String, SyncError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
        Ok(Message::Binary(bytes)) => Some(
            String::from_utf8(bytes.to_vec())
                .map_err(|e| SyncError::MalformedFrame(format!("binary frame is not UTF-8: {}", e))),
        ),
        Ok(_) => None,
        Err(e) => Some(Err(SyncError::Channel(e.to_string()))),
    }
}
