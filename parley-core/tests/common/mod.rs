//! In-memory channel transport shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc as pipe;
use futures::{SinkExt, StreamExt};
use parley_core::{
    ChannelHandler, ConnectionHandle, Connector, CredentialProvider, InboundEvent, Link,
    OutboundEvent, SyncError,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Server side of one accepted in-memory connection. Dropping it closes the
/// channel from the server's end.
pub struct ServerEnd {
    pub url: String,
    to_client: pipe::UnboundedSender<Result<String, SyncError>>,
    from_client: pipe::UnboundedReceiver<String>,
}

impl ServerEnd {
    pub fn push_raw(&self, frame: &str) {
        self.to_client
            .unbounded_send(Ok(frame.to_string()))
            .expect("client end dropped");
    }

    pub fn push(&self, frame: serde_json::Value) {
        self.push_raw(&frame.to_string());
    }

    /// Break the channel with a transport error instead of a clean close.
    pub fn fail(&self) {
        let _ = self
            .to_client
            .unbounded_send(Err(SyncError::Channel("connection reset".to_string())));
    }

    pub async fn next_frame(&mut self) -> serde_json::Value {
        let frame = self.from_client.next().await.expect("client closed the channel");
        serde_json::from_str(&frame).expect("client sent invalid JSON")
    }

    /// Every frame the client sends until it closes its end.
    pub async fn remaining_frames(self) -> Vec<String> {
        self.from_client.collect().await
    }
}

pub struct MemoryConnector {
    attempts: AtomicUsize,
    refusals: AtomicUsize,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

impl MemoryConnector {
    /// The first `refusals` connect attempts fail.
    pub fn new(refusals: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            attempts: AtomicUsize::new(0),
            refusals: AtomicUsize::new(refusals),
            accepted,
        });
        (connector, rx)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Link, SyncError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::Channel("connection refused".to_string()));
        }

        let (client_tx, from_client) = pipe::unbounded::<String>();
        let (to_client, client_rx) = pipe::unbounded::<Result<String, SyncError>>();
        let _ = self.accepted.send(ServerEnd {
            url: url.to_string(),
            to_client,
            from_client,
        });

        Ok(Link {
            sink: Box::pin(client_tx.sink_map_err(|e| SyncError::Channel(e.to_string()))),
            stream: Box::pin(client_rx),
        })
    }
}

/// Hands out tokens from a list, repeating the last one.
pub struct RotatingToken {
    tokens: Mutex<VecDeque<String>>,
}

impl RotatingToken {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: Mutex::new(tokens.iter().map(|t| t.to_string()).collect()),
        }
    }
}

impl CredentialProvider for RotatingToken {
    fn bearer_token(&self) -> Option<String> {
        let mut tokens = self.tokens.lock().unwrap();
        if tokens.len() > 1 {
            tokens.pop_front()
        } else {
            tokens.front().cloned()
        }
    }
}

/// Sends a handshake on every open and records what it sees.
#[derive(Default)]
pub struct RecordingHandler {
    pub handshake: Option<OutboundEvent>,
    pub opens: AtomicUsize,
    pub events: Mutex<Vec<InboundEvent>>,
}

impl RecordingHandler {
    pub fn with_handshake(event: OutboundEvent) -> Self {
        Self {
            handshake: Some(event),
            ..Default::default()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<InboundEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ChannelHandler for RecordingHandler {
    fn on_open(&self, handle: &ConnectionHandle) {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(event) = &self.handshake {
            assert!(handle.send(event), "handshake must go out on an open channel");
        }
    }

    fn on_event(&self, event: &InboundEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Let spawned tasks run until `cond` holds. Does not advance time.
pub async fn settle(mut cond: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
