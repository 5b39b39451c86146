//! Connection manager: owns the one logical push channel to the server.
//!
//! - Resolves a bearer credential before every connect attempt; without one
//!   the manager stays idle (`Unauthenticated`) instead of failing.
//! - Runs the channel on a background task: outbound frames, inbound frames,
//!   and cancellation are raced in one `select!` loop.
//! - On any closure, sleeps a fixed delay and reconnects. `close()` cancels
//!   both the live channel and a pending reconnect.

use crate::config::{ConnectionConfig, ParleyConfig, ServerConfig};
use crate::envelope::{InboundEvent, OutboundEvent};
use crate::error::SyncError;
use crate::transport::{Connector, Link, WsConnector};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};

// ============================================================================
// Credentials
// ============================================================================

/// Source of the bearer credential, consulted on every (re)connect so a
/// rotated token is picked up.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

#[derive(Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone().filter(|t| !t.trim().is_empty())
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Callbacks run on the channel task, in frame receipt order.
pub trait ChannelHandler: Send + Sync + 'static {
    /// Called once per established channel, before any inbound frame is
    /// dispatched. The place to send subscription handshakes.
    fn on_open(&self, _handle: &ConnectionHandle) {}

    fn on_event(&self, _event: &InboundEvent) {}
}

impl ChannelHandler for () {}

/// Best-effort outbound path. `false` means the frame was not handed to an
/// open channel and the caller owns any retry.
pub trait Outbound {
    fn send(&self, event: &OutboundEvent) -> bool;
}

// ============================================================================
// Channel session state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
    /// No credential was available; nothing is attempted until reopened.
    Unauthenticated,
}

/// Identity of one connect attempt. Replaced on every reconnect.
#[derive(Clone)]
pub struct ChannelSession {
    pub token: String,
    pub state: ChannelState,
    pub last_open_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("token", &"<redacted>")
            .field("state", &self.state)
            .field("last_open_at", &self.last_open_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub opens: u64,
    pub reconnects_scheduled: u64,
    pub events_received: u64,
    pub malformed_frames: u64,
}

struct Status {
    session: ChannelSession,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct Shared {
    status: Mutex<Status>,
    cancel: CancellationToken,
    events: broadcast::Sender<InboundEvent>,
    opens: AtomicU64,
    reconnects_scheduled: AtomicU64,
    events_received: AtomicU64,
    malformed_frames: AtomicU64,
}

/// Cloneable handle to one opened channel.
///
/// Dropping the last handle returned by [`ConnectionManager::open`] (and its
/// clones) closes the channel. The copy passed to
/// [`ChannelHandler::on_open`] does not keep the channel alive.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    _owner: Option<Arc<DropGuard>>,
}

impl ConnectionHandle {
    fn new(state: ChannelState, event_buffer: usize) -> Self {
        let (events, _rx) = broadcast::channel(event_buffer.max(1));
        let cancel = CancellationToken::new();
        Self {
            _owner: Some(Arc::new(cancel.clone().drop_guard())),
            shared: Arc::new(Shared {
                status: Mutex::new(Status {
                    session: ChannelSession {
                        token: String::new(),
                        state,
                        last_open_at: None,
                    },
                    outbound: None,
                }),
                cancel,
                events,
                opens: AtomicU64::new(0),
                reconnects_scheduled: AtomicU64::new(0),
                events_received: AtomicU64::new(0),
                malformed_frames: AtomicU64::new(0),
            }),
        }
    }

    /// Same channel, without a say in its lifetime.
    fn detached(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _owner: None,
        }
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ChannelState {
        self.status().session.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn session(&self) -> ChannelSession {
        self.status().session.clone()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            opens: self.shared.opens.load(Ordering::SeqCst),
            reconnects_scheduled: self.shared.reconnects_scheduled.load(Ordering::SeqCst),
            events_received: self.shared.events_received.load(Ordering::SeqCst),
            malformed_frames: self.shared.malformed_frames.load(Ordering::SeqCst),
        }
    }

    /// Independent listener on the inbound event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.shared.events.subscribe()
    }

    /// Hand a frame to the open channel. No queueing: returns `false`
    /// whenever the channel is not open.
    pub fn send(&self, event: &OutboundEvent) -> bool {
        let status = self.status();
        if status.session.state != ChannelState::Open {
            return false;
        }
        let Some(tx) = status.outbound.as_ref() else {
            return false;
        };
        match event.to_frame() {
            Ok(frame) => tx.send(frame).is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode outbound event");
                false
            }
        }
    }

    /// Tear down the channel and any pending reconnect. Safe to repeat.
    pub fn close(&self) {
        if !self.shared.cancel.is_cancelled() {
            tracing::info!("Closing channel");
        }
        self.shared.cancel.cancel();
        let mut status = self.status();
        status.outbound = None;
        status.session.state = ChannelState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    fn begin_attempt(&self, token: String) {
        let mut status = self.status();
        status.session = ChannelSession {
            token,
            state: ChannelState::Connecting,
            last_open_at: status.session.last_open_at,
        };
        status.outbound = None;
    }

    /// Returns `false` if `close()` already ran.
    fn mark_open(&self, outbound: mpsc::UnboundedSender<String>) -> bool {
        let mut status = self.status();
        if self.shared.cancel.is_cancelled() {
            return false;
        }
        status.session.state = ChannelState::Open;
        status.session.last_open_at = Some(Utc::now());
        status.outbound = Some(outbound);
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn mark_state(&self, state: ChannelState) {
        let mut status = self.status();
        status.outbound = None;
        status.session.state = state;
    }

    fn dispatch(&self, frame: &str, handler: &dyn ChannelHandler) {
        match InboundEvent::parse_frame(frame) {
            Ok(event) => {
                self.shared.events_received.fetch_add(1, Ordering::SeqCst);
                handler.on_event(&event);
                // No subscribers is fine.
                let _ = self.shared.events.send(event);
            }
            Err(e) => self.discard_malformed(&e),
        }
    }

    fn discard_malformed(&self, error: &dyn fmt::Display) {
        self.shared.malformed_frames.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(error = %error, "Discarding malformed frame");
    }
}

impl Outbound for ConnectionHandle {
    fn send(&self, event: &OutboundEvent) -> bool {
        ConnectionHandle::send(self, event)
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Build the channel URL: the REST base with a `ws`/`wss` scheme, the
/// channel path, and the bearer credential as `token` query parameter.
pub fn channel_url(server: &ServerConfig, token: &str) -> Result<Url, SyncError> {
    let mut url = Url::parse(&server.base_url)
        .map_err(|e| SyncError::InvalidUrl(format!("{}: {}", server.base_url, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::InvalidUrl(format!(
                "unsupported scheme '{}' in {}",
                other, server.base_url
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::InvalidUrl(server.base_url.clone()))?;

    let path = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        server.ws_path.trim_start_matches('/')
    );
    url.set_path(&path);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

pub struct ConnectionManager {
    server: ServerConfig,
    connection: ConnectionConfig,
    connector: Arc<dyn Connector>,
}

impl ConnectionManager {
    pub fn new(config: &ParleyConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(config: &ParleyConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            server: config.server.clone(),
            connection: config.connection.clone(),
            connector,
        }
    }

    /// Open the channel. Must be called inside a tokio runtime.
    ///
    /// Without a credential the returned handle is `Unauthenticated` and no
    /// task is started; call `open` again once a token exists.
    pub fn open(
        &self,
        credentials: Arc<dyn CredentialProvider>,
        handler: Arc<dyn ChannelHandler>,
    ) -> ConnectionHandle {
        let Some(token) = credentials.bearer_token() else {
            tracing::info!("No credential available; channel not opened");
            return ConnectionHandle::new(ChannelState::Unauthenticated, self.connection.event_buffer);
        };

        let handle = ConnectionHandle::new(ChannelState::Connecting, self.connection.event_buffer);
        let driver = Driver {
            server: self.server.clone(),
            connection: self.connection.clone(),
            connector: self.connector.clone(),
            credentials,
            handler,
            handle: handle.detached(),
        };
        tokio::spawn(driver.run(token));
        handle
    }
}

struct Driver {
    server: ServerConfig,
    connection: ConnectionConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    handler: Arc<dyn ChannelHandler>,
    handle: ConnectionHandle,
}

impl Driver {
    async fn run(self, first_token: String) {
        let cancel = self.handle.shared.cancel.clone();
        let delay = self.connection.reconnect_delay();
        let mut token = Some(first_token);

        loop {
            let Some(current) = token.take().or_else(|| self.credentials.bearer_token()) else {
                tracing::info!("Credential no longer available; reconnect abandoned");
                self.handle.mark_state(ChannelState::Unauthenticated);
                return;
            };

            let url = match channel_url(&self.server, &current) {
                Ok(url) => url,
                Err(e) => {
                    tracing::error!(error = %e, "Cannot build channel URL");
                    self.handle.mark_state(ChannelState::Closed);
                    return;
                }
            };

            self.handle.begin_attempt(current);
            tracing::debug!(
                host = url.host_str().unwrap_or_default(),
                path = url.path(),
                "Connecting channel"
            );

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.connector.connect(url.as_str()) => res,
            };

            match connected {
                Ok(link) => self.run_link(link, &cancel).await,
                Err(e) => tracing::warn!(error = %e, "Channel connect failed"),
            }

            if cancel.is_cancelled() {
                break;
            }
            self.handle.mark_state(ChannelState::Closed);

            self.handle
                .shared
                .reconnects_scheduled
                .fetch_add(1, Ordering::SeqCst);
            tracing::info!(
                delay_ms = self.connection.reconnect_delay_ms,
                "Channel closed; reconnect scheduled"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Pending reconnect cancelled");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.handle.mark_state(ChannelState::Closed);
    }

    async fn run_link(&self, link: Link, cancel: &CancellationToken) {
        let Link {
            mut sink,
            mut stream,
        } = link;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        if !self.handle.mark_open(tx) {
            let _ = sink.close().await;
            return;
        }
        tracing::info!("Channel open");
        self.handler.on_open(&self.handle);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.close().await;
                    break;
                }
                Some(frame) = rx.recv() => {
                    if let Err(e) = sink.send(frame).await {
                        tracing::warn!(error = %e, "Channel write failed");
                        break;
                    }
                }
                next = stream.next() => match next {
                    Some(Ok(frame)) => self.handle.dispatch(&frame, self.handler.as_ref()),
                    Some(Err(SyncError::MalformedFrame(reason))) => {
                        self.handle.discard_malformed(&reason)
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Channel read failed");
                        break;
                    }
                    None => {
                        tracing::info!("Channel closed by server");
                        break;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(base_url: &str) -> ServerConfig {
        ServerConfig {
            base_url: base_url.to_string(),
            ws_path: "/ws".to_string(),
        }
    }

    #[test]
    fn test_channel_url_swaps_scheme_and_carries_token() {
        let url = channel_url(&server("http://127.0.0.1:8000"), "abc.def").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8000/ws?token=abc.def");

        let url = channel_url(&server("https://support.example.com/api-root/"), "t").unwrap();
        assert_eq!(url.as_str(), "wss://support.example.com/api-root/ws?token=t");
    }

    #[test]
    fn test_channel_url_rejects_unknown_scheme() {
        let err = channel_url(&server("ftp://example.com"), "t").unwrap_err();
        assert!(matches!(err, SyncError::InvalidUrl(_)));
    }

    #[test]
    fn test_token_is_url_encoded() {
        let url = channel_url(&server("http://localhost:8000"), "a b&c").unwrap();
        assert_eq!(url.query(), Some("token=a+b%26c"));
    }

    #[test]
    fn test_blank_static_token_counts_as_absent() {
        assert_eq!(StaticToken::new("  ").bearer_token(), None);
        assert_eq!(StaticToken::none().bearer_token(), None);
        assert_eq!(StaticToken::new("x").bearer_token().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_open_without_credential_is_noop() {
        let manager = ConnectionManager::new(&ParleyConfig::default());
        let handle = manager.open(Arc::new(StaticToken::none()), Arc::new(()));

        assert_eq!(handle.state(), ChannelState::Unauthenticated);
        assert!(!handle.send(&OutboundEvent::Typing {
            session_id: "s1".to_string()
        }));
        handle.close();
        handle.close();
        assert_eq!(handle.state(), ChannelState::Closed);
    }

    #[test]
    fn test_session_debug_redacts_token() {
        let session = ChannelSession {
            token: "secret-token".to_string(),
            state: ChannelState::Open,
            last_open_at: None,
        };
        assert!(!format!("{session:?}").contains("secret-token"));
    }
}
