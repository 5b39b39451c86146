//! parley-cli: terminal console for the support-chat sync core
//!
//! Composes the connection manager, REST snapshots, and the reconcilers
//! against a live chat server.
//!
//! # Subcommands
//! - `sessions --category <c> [--label L] [--search S]` : watch one session list
//! - `tail <conversation_id> [--as agent|customer]` : follow a conversation, send stdin lines
//! - `status` : show server health

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use parley_core::{
    ChannelHandler, ChannelState, ChatCategory, ConnectionHandle, ConnectionManager,
    CredentialProvider, DateRange, FetchTicket, HandlerMode, InboundEvent, LoadTicket,
    MessageReconciler, MessageRecord, OutboundEvent, OutgoingMessage, ParleyConfig, RestClient,
    Role, Sender, SessionFilter, SessionListSync, SessionSummary, SnapshotSource, StaticToken,
    SyncError,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing_subscriber::{fmt, EnvFilter};

const PREVIEW_CHARS: usize = 48;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "parley-cli", version, about = "Support-chat realtime console")]
struct Cli {
    #[arg(short, long, default_value = "parley.toml")]
    config: String,

    /// Chat server base URL (overrides `server.base_url`)
    #[arg(long, env = "PARLEY_SERVER")]
    server: Option<String>,

    /// Bearer token for the REST API and the push channel
    #[arg(long, env = "PARLEY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Watch one categorized session list
    Sessions {
        #[arg(long, default_value = "active")]
        category: ChatCategory,

        /// Business label ("shipping", "refund", ...)
        #[arg(long)]
        label: Option<String>,

        /// Customer name substring
        #[arg(long, default_value = "")]
        search: String,

        /// Completed list only
        #[arg(long, value_enum)]
        handler: Option<HandlerArg>,

        /// Completed list only: all, today, week, month
        #[arg(long, default_value = "all")]
        date_range: DateRange,
    },

    /// Follow one conversation; lines typed on stdin are sent to it
    Tail {
        conversation_id: String,

        #[arg(long = "as", value_enum, default_value_t = RoleArg::Agent)]
        role: RoleArg,
    },

    /// Show chat server status
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    Agent,
    Customer,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Agent => Role::Agent,
            RoleArg::Customer => Role::Customer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HandlerArg {
    Ai,
    Agent,
}

impl From<HandlerArg> for HandlerMode {
    fn from(handler: HandlerArg) -> Self {
        match handler {
            HandlerArg::Ai => HandlerMode::Automated,
            HandlerArg::Agent => HandlerMode::Human,
        }
    }
}

fn build_filter(
    label: Option<String>,
    search: String,
    handler: Option<HandlerArg>,
    date_range: DateRange,
) -> SessionFilter {
    SessionFilter {
        label: label.filter(|l| !l.trim().is_empty() && l != "all"),
        search,
        handler: handler.map(HandlerMode::from),
        date_range,
    }
}

// ============================================================================
// Channel handler
// ============================================================================

/// Sends the subscription handshake on every open and tells the main loop,
/// which refetches to cover anything missed while disconnected.
struct ConsoleHandler {
    handshake: Option<OutboundEvent>,
    opened: mpsc::UnboundedSender<()>,
}

impl ChannelHandler for ConsoleHandler {
    fn on_open(&self, handle: &ConnectionHandle) {
        if let Some(event) = &self.handshake {
            if !handle.send(event) {
                tracing::warn!("Subscription handshake not sent");
            }
        }
        let _ = self.opened.send(());
    }
}

fn open_channel(
    config: &ParleyConfig,
    credentials: Arc<dyn CredentialProvider>,
    handshake: Option<OutboundEvent>,
) -> anyhow::Result<(ConnectionHandle, mpsc::UnboundedReceiver<()>)> {
    let (opened, opened_rx) = mpsc::unbounded_channel();
    let handle = ConnectionManager::new(config)
        .open(credentials, Arc::new(ConsoleHandler { handshake, opened }));
    if handle.state() == ChannelState::Unauthenticated {
        anyhow::bail!("no credential: pass --token or set PARLEY_TOKEN");
    }
    Ok((handle, opened_rx))
}

fn shutdown_signal() -> broadcast::Receiver<()> {
    let (tx, rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = tx.send(());
        }
    });
    rx
}

// ============================================================================
// Rendering
// ============================================================================

fn sender_label(sender: Sender) -> &'static str {
    match sender {
        Sender::Customer => "customer",
        Sender::HumanAgent => "agent",
        Sender::Automated => "ai",
    }
}

fn render_message(message: &MessageRecord) -> String {
    let time = message.created_at.with_timezone(&Local).format("%H:%M:%S");
    let mut line = format!("[{}] {:>8}: {}", time, sender_label(message.sender), message.content);
    for attachment in &message.attachments {
        line.push_str(&format!("\n           📎 {} ({})", attachment.name, attachment.url));
    }
    line
}

fn render_session(session: &SessionSummary) -> String {
    let who = session
        .customer_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .unwrap_or(&session.customer_ref);
    let handler = match session.handler_mode {
        HandlerMode::Automated => "ai",
        HandlerMode::Human => "agent",
    };
    let preview: String = session.last_message_preview.chars().take(PREVIEW_CHARS).collect();
    let unread = if session.unread_count > 0 {
        format!(" ({} unread)", session.unread_count)
    } else {
        String::new()
    };
    let label = session
        .category_label
        .as_deref()
        .map(|l| format!(" [{}]", l))
        .unwrap_or_default();
    format!("{:<12} {:<20} {:<5}{}{}  {}", session.id, who, handler, label, unread, preview)
}

fn print_sessions(sync: &SessionListSync) {
    println!("── {} sessions: {} ──", sync.category(), sync.len());
    for session in sync.sessions() {
        println!("{}", render_session(session));
    }
}

// ============================================================================
// Commands
// ============================================================================

type SessionFetch = (FetchTicket, Result<Vec<SessionSummary>, SyncError>);

fn spawn_session_fetch(fetches: &mut JoinSet<SessionFetch>, rest: &RestClient, ticket: FetchTicket) {
    let rest = rest.clone();
    fetches.spawn(async move {
        let result = rest.fetch_sessions(ticket.category, &ticket.filter).await;
        (ticket, result)
    });
}

async fn do_sessions(
    config: &ParleyConfig,
    credentials: Arc<dyn CredentialProvider>,
    category: ChatCategory,
    filter: SessionFilter,
) -> anyhow::Result<()> {
    let rest = RestClient::new(config, credentials.clone())?;
    let mut sync = SessionListSync::new(category, filter, config.sessions.resync_debounce());
    let (handle, mut opened) = open_channel(config, credentials, Some(sync.subscribe_event()))?;
    let mut events = handle.subscribe();
    let mut shutdown = shutdown_signal();
    let mut fetches = JoinSet::new();

    spawn_session_fetch(&mut fetches, &rest, sync.begin_fetch());

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            Some(()) = opened.recv() => {
                spawn_session_fetch(&mut fetches, &rest, sync.begin_fetch());
            }
            Some(joined) = fetches.join_next() => {
                let (ticket, result) = joined.context("session fetch task failed")?;
                match sync.apply_fetch(&ticket, result) {
                    Ok(true) => print_sessions(&sync),
                    Ok(false) => {}
                    Err(e) => eprintln!("parley-cli: session list fetch failed: {}", e),
                }
                if let Some(ticket) = sync.take_pending_resync() {
                    spawn_session_fetch(&mut fetches, &rest, ticket);
                }
            }
            received = events.recv() => match received {
                Ok(event) => {
                    let before = sync.sessions().to_vec();
                    if let Some(request) = sync.apply_delta(&event, Instant::now()) {
                        if let Some(ticket) = sync.request_resync(&request) {
                            tracing::info!(session_id = %request.session_id, "Resyncing session list");
                            spawn_session_fetch(&mut fetches, &rest, ticket);
                        }
                    }
                    if sync.sessions() != before.as_slice() {
                        print_sessions(&sync);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event listener lagged; resyncing");
                    spawn_session_fetch(&mut fetches, &rest, sync.begin_fetch());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    handle.close();
    Ok(())
}

type MessageFetch = (LoadTicket, Result<Vec<MessageRecord>, SyncError>);

fn spawn_message_fetch(fetches: &mut JoinSet<MessageFetch>, rest: &RestClient, ticket: LoadTicket) {
    let rest = rest.clone();
    fetches.spawn(async move {
        let result = rest.fetch_messages(&ticket.conversation_id).await;
        (ticket, result)
    });
}

/// The server stores and fans out messages only through its REST endpoint;
/// the push channel carries them back as `new_message` echoes.
fn spawn_send(
    sends: &mut JoinSet<Result<MessageRecord, SyncError>>,
    rest: &RestClient,
    outgoing: OutgoingMessage,
) {
    let rest = rest.clone();
    sends.spawn(async move { rest.send_message(&outgoing.session_id, &outgoing.content).await });
}

async fn do_tail(
    config: &ParleyConfig,
    credentials: Arc<dyn CredentialProvider>,
    conversation_id: &str,
    role: Role,
) -> anyhow::Result<()> {
    let rest = RestClient::new(config, credentials.clone())?;
    let mut reconciler = MessageReconciler::new(role, config.conversation.clone());
    let (handle, mut opened) = open_channel(config, credentials, None)?;
    let mut events = handle.subscribe();
    let mut shutdown = shutdown_signal();
    let mut fetches = JoinSet::new();
    let mut sends = JoinSet::new();
    let mut printed: HashSet<String> = HashSet::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut grace = tokio::time::interval(Duration::from_millis(250));

    spawn_message_fetch(&mut fetches, &rest, reconciler.view(conversation_id));

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            Some(()) = opened.recv() => {
                spawn_message_fetch(&mut fetches, &rest, reconciler.view(conversation_id));
            }
            Some(joined) = fetches.join_next() => {
                let (ticket, result) = joined.context("message fetch task failed")?;
                match reconciler.apply_snapshot(&ticket, result) {
                    Ok(_) => {
                        for message in reconciler.timeline() {
                            if printed.insert(message.id.clone()) {
                                println!("{}", render_message(message));
                            }
                        }
                    }
                    Err(e) => eprintln!("parley-cli: could not load conversation: {}", e),
                }
            }
            received = events.recv() => match received {
                Ok(event) => {
                    if let InboundEvent::ServerError { message } = &event {
                        eprintln!("parley-cli: server error: {}", message);
                    }
                    if let Some(message) = reconciler.ingest(&event) {
                        if printed.insert(message.id.clone()) {
                            println!("{}", render_message(&message));
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event listener lagged; reloading conversation");
                    spawn_message_fetch(&mut fetches, &rest, reconciler.view(conversation_id));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(joined) = sends.join_next() => {
                match joined.context("message send task failed")? {
                    Ok(record) => {
                        if let Some(message) = reconciler.record_sent(record) {
                            if printed.insert(message.id.clone()) {
                                println!("{}", render_message(&message));
                            }
                        }
                    }
                    Err(e) => eprintln!("parley-cli: message not sent: {}", e),
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match reconciler.prepare_send(&line) {
                    Ok(Some(outgoing)) => spawn_send(&mut sends, &rest, outgoing),
                    Ok(None) => {}
                    Err(e) => eprintln!("parley-cli: {}", e),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    stdin_open = false;
                }
            },
            _ = grace.tick(), if reconciler.is_locked() => {
                if reconciler.navigate_away_due(Instant::now()) {
                    println!("── conversation {} completed ──", conversation_id);
                    break;
                }
            }
        }
    }

    handle.close();
    Ok(())
}

async fn do_status(config: &ParleyConfig) -> anyhow::Result<()> {
    let rest = RestClient::new(config, Arc::new(StaticToken::none()))?;
    let url = &config.server.base_url;
    match rest.health().await {
        Ok(body) => {
            println!("Chat server: {}", url);
            println!("Status:      {}", body["status"].as_str().unwrap_or("unknown"));
            if let Some(version) = body["version"].as_str() {
                println!("Version:     {}", version);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("parley-cli: server unhealthy at {}: {}", url, e);
            std::process::exit(1);
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let mut config = ParleyConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config))?;
    if let Some(server) = cli.server {
        config.server.base_url = server;
    }
    let credentials: Arc<dyn CredentialProvider> = match cli.token {
        Some(token) => Arc::new(StaticToken::new(token)),
        None => Arc::new(StaticToken::none()),
    };

    match cli.command {
        Commands::Sessions {
            category,
            label,
            search,
            handler,
            date_range,
        } => {
            let filter = build_filter(label, search, handler, date_range);
            do_sessions(&config, credentials, category, filter).await
        }
        Commands::Tail {
            conversation_id,
            role,
        } => do_tail(&config, credentials, &conversation_id, role.into()).await,
        Commands::Status => do_status(&config).await,
    }
}

// ============================================================================
// Tests
// ============================================================================
