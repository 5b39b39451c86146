//! Message reconciler: one ordered, deduplicated timeline for the
//! conversation currently in view.
//!
//! Snapshot and push records meet here. Both paths go through the same
//! id-deduplicating insert followed by a full re-sort, so the outcome does
//! not depend on which side arrives first.

use crate::config::ConversationConfig;
use crate::connection::Outbound;
use crate::envelope::{InboundEvent, OutboundEvent};
use crate::error::SyncError;
use crate::models::{HandlerMode, MessageRecord, Sender};
use crate::snapshot::SnapshotSource;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use tokio::time::Instant;

const AGENT_CONNECTED_NOTICE: &str = "A support agent has joined the conversation.";

// ============================================================================
// Timeline
// ============================================================================

/// Messages of one conversation in total timeline order, unique by id.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    records: Vec<MessageRecord>,
    ids: HashSet<String>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = MessageRecord>) -> Self {
        let mut timeline = Self::new();
        timeline.extend(records);
        timeline
    }

    /// Insert one record; `false` if its id is already present.
    ///
    /// Re-sorts the whole timeline so a late record with an early timestamp
    /// still lands in place.
    pub fn insert(&mut self, record: MessageRecord) -> bool {
        if !self.ids.insert(record.id.clone()) {
            return false;
        }
        self.records.push(record);
        self.records.sort_by(MessageRecord::timeline_cmp);
        true
    }

    /// Insert many records, sorting once. Returns how many were new.
    pub fn extend(&mut self, records: impl IntoIterator<Item = MessageRecord>) -> usize {
        let before = self.records.len();
        for record in records {
            if self.ids.insert(record.id.clone()) {
                self.records.push(record);
            }
        }
        let added = self.records.len() - before;
        if added > 0 {
            self.records.sort_by(MessageRecord::timeline_cmp);
        }
        added
    }

    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&MessageRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<MessageRecord> {
        self.records
    }
}

/// Ordered, deduplicated union of two record lists.
pub fn merge(existing: &[MessageRecord], incoming: &[MessageRecord]) -> Vec<MessageRecord> {
    let mut timeline = Timeline::from_records(existing.iter().cloned());
    timeline.extend(incoming.iter().cloned());
    timeline.into_records()
}

// ============================================================================
// Reconciler
// ============================================================================

/// Which outbound event a reconciler sends on behalf of its user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    Customer,
}

/// A validated message, ready for either send path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub session_id: String,
    pub content: String,
}

/// Proof of which conversation a snapshot fetch was started for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub conversation_id: String,
    generation: u64,
}

#[derive(Debug)]
struct ActiveConversation {
    id: String,
    timeline: Timeline,
    locked: bool,
    completed_at: Option<Instant>,
    handler_mode: HandlerMode,
}

impl ActiveConversation {
    fn new(id: String) -> Self {
        Self {
            id,
            timeline: Timeline::new(),
            locked: false,
            completed_at: None,
            handler_mode: HandlerMode::Automated,
        }
    }
}

pub struct MessageReconciler {
    role: Role,
    config: ConversationConfig,
    generation: u64,
    active: Option<ActiveConversation>,
}

impl MessageReconciler {
    pub fn new(role: Role, config: ConversationConfig) -> Self {
        Self {
            role,
            config,
            generation: 0,
            active: None,
        }
    }

    /// Put `conversation_id` in view and return the ticket for its snapshot
    /// fetch. Switching conversations drops the previous timeline; viewing
    /// the same one again keeps it and supersedes older tickets.
    pub fn view(&mut self, conversation_id: &str) -> LoadTicket {
        self.generation += 1;
        let same = self
            .active
            .as_ref()
            .is_some_and(|a| a.id == conversation_id);
        if !same {
            tracing::debug!(conversation_id, "Switching viewed conversation");
            self.active = Some(ActiveConversation::new(conversation_id.to_string()));
        }
        LoadTicket {
            conversation_id: conversation_id.to_string(),
            generation: self.generation,
        }
    }

    /// Stop following any conversation.
    pub fn clear(&mut self) {
        self.generation += 1;
        self.active = None;
    }

    fn is_current_ticket(&self, ticket: &LoadTicket) -> bool {
        ticket.generation == self.generation
            && self
                .active
                .as_ref()
                .is_some_and(|a| a.id == ticket.conversation_id)
    }

    /// Apply a snapshot fetch result.
    ///
    /// Returns `Ok(false)` when the ticket is stale (the view moved on while
    /// the fetch was in flight). A fetch error is handed back unchanged and
    /// leaves the timeline as it was.
    pub fn apply_snapshot(
        &mut self,
        ticket: &LoadTicket,
        result: Result<Vec<MessageRecord>, SyncError>,
    ) -> Result<bool, SyncError> {
        if !self.is_current_ticket(ticket) {
            tracing::debug!(
                conversation_id = %ticket.conversation_id,
                "Discarding stale snapshot response"
            );
            return Ok(false);
        }

        let records = match result {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %ticket.conversation_id,
                    error = %e,
                    "Snapshot fetch failed; timeline unchanged"
                );
                return Err(e);
            }
        };

        let Some(active) = self.active.as_mut() else {
            return Ok(false);
        };
        let id = active.id.clone();
        let added = active.timeline.extend(
            records
                .into_iter()
                .filter(|r| r.session_id.as_deref().map_or(true, |s| s == id)),
        );
        tracing::debug!(
            conversation_id = %id,
            added,
            total = active.timeline.len(),
            "Snapshot merged"
        );
        Ok(true)
    }

    /// View `conversation_id` and load its snapshot in one step.
    pub async fn load(
        &mut self,
        source: &dyn SnapshotSource,
        conversation_id: &str,
    ) -> Result<&[MessageRecord], SyncError> {
        let ticket = self.view(conversation_id);
        let result = source.fetch_messages(conversation_id).await;
        self.apply_snapshot(&ticket, result)?;
        Ok(self.timeline())
    }

    /// Merge a push event. Returns the record it added, if any.
    pub fn ingest(&mut self, event: &InboundEvent) -> Option<MessageRecord> {
        self.ingest_at(event, Utc::now(), Instant::now())
    }

    /// [`MessageReconciler::ingest`] with explicit clocks: `wall` stamps
    /// synthetic messages, `now` starts the completion grace period.
    pub fn ingest_at(
        &mut self,
        event: &InboundEvent,
        wall: DateTime<Utc>,
        now: Instant,
    ) -> Option<MessageRecord> {
        if !self.targets_active(event.session_id()) {
            if let Some(session_id) = event.session_id() {
                tracing::trace!(session_id, "Ignoring event for a conversation not in view");
            }
            return None;
        }
        let active = self.active.as_mut()?;

        match event {
            InboundEvent::NewMessage { message, .. }
            | InboundEvent::CustomerMessage { message, .. } => {
                if message.session_id.as_deref().is_some_and(|s| s != active.id) {
                    return None;
                }
                if active.timeline.insert(message.clone()) {
                    Some(message.clone())
                } else {
                    tracing::debug!(message_id = %message.id, "Dropping duplicate message");
                    None
                }
            }
            InboundEvent::SessionCompleted { message, .. } => {
                let content = message
                    .clone()
                    .unwrap_or_else(|| self.config.closing_message.clone());
                let record = synthetic(active, "closing", content, wall);
                let added = active.timeline.insert(record.clone());
                if !active.locked {
                    tracing::info!(conversation_id = %active.id, "Conversation completed; input locked");
                    active.locked = true;
                    active.completed_at = Some(now);
                }
                added.then_some(record)
            }
            InboundEvent::AgentConnected { message, .. } => {
                active.handler_mode = HandlerMode::Human;
                let content = message
                    .clone()
                    .unwrap_or_else(|| AGENT_CONNECTED_NOTICE.to_string());
                let record = synthetic(active, "agent-connected", content, wall);
                active.timeline.insert(record.clone()).then_some(record)
            }
            InboundEvent::SessionStatusChanged {
                status, handler, ..
            } => {
                if let Some(handler) = handler {
                    active.handler_mode = *handler;
                }
                if *status == crate::models::ChatCategory::Completed && !active.locked {
                    tracing::info!(conversation_id = %active.id, "Conversation completed; input locked");
                    active.locked = true;
                    active.completed_at = Some(now);
                }
                None
            }
            _ => None,
        }
    }

    /// An event with no session id is taken to belong to the conversation in
    /// view: the server scopes customer channels to their own conversation.
    fn targets_active(&self, session_id: Option<&str>) -> bool {
        match (&self.active, session_id) {
            (Some(active), Some(id)) => active.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.id.as_str())
    }

    pub fn timeline(&self) -> &[MessageRecord] {
        self.active
            .as_ref()
            .map(|a| a.timeline.records())
            .unwrap_or_default()
    }

    pub fn is_locked(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.locked)
    }

    pub fn handler_mode(&self) -> Option<HandlerMode> {
        self.active.as_ref().map(|a| a.handler_mode)
    }

    /// True once the grace period after completion has elapsed.
    pub fn navigate_away_due(&self, now: Instant) -> bool {
        self.active
            .as_ref()
            .and_then(|a| a.completed_at)
            .is_some_and(|at| now.saturating_duration_since(at) >= self.config.completion_grace())
    }

    /// Validate an outgoing message for the viewed conversation.
    ///
    /// A completed conversation rejects locally. `Ok(None)` means there is
    /// nothing to send (no conversation in view, or blank content).
    pub fn prepare_send(&self, content: &str) -> Result<Option<OutgoingMessage>, SyncError> {
        let Some(active) = self.active.as_ref() else {
            return Ok(None);
        };
        if active.locked {
            return Err(SyncError::ConversationClosed {
                session_id: active.id.clone(),
            });
        }
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }
        Ok(Some(OutgoingMessage {
            session_id: active.id.clone(),
            content: content.to_string(),
        }))
    }

    /// Send a message on the push channel.
    ///
    /// A completed conversation rejects locally without touching the channel.
    /// `Ok(false)` means nothing was sent (no conversation, blank content, or
    /// channel not open); the REST path is the caller's fallback.
    pub fn send(&self, outbound: &dyn Outbound, content: &str) -> Result<bool, SyncError> {
        let Some(outgoing) = self.prepare_send(content)? else {
            return Ok(false);
        };
        let event = match self.role {
            Role::Agent => OutboundEvent::AgentMessage {
                session_id: outgoing.session_id,
                content: outgoing.content,
            },
            Role::Customer => OutboundEvent::SendMessage {
                session_id: outgoing.session_id,
                content: outgoing.content,
            },
        };
        Ok(outbound.send(&event))
    }

    /// Merge the record the server stored for a message sent over REST.
    /// The push echo of the same message later collapses onto it by id.
    pub fn record_sent(&mut self, record: MessageRecord) -> Option<MessageRecord> {
        let active = self.active.as_mut()?;
        if record.session_id.as_deref().is_some_and(|s| s != active.id) {
            return None;
        }
        active
            .timeline
            .insert(record.clone())
            .then_some(record)
    }

    /// Typing indicator; silently skipped for a locked conversation.
    pub fn typing(&self, outbound: &dyn Outbound) -> bool {
        match self.active.as_ref() {
            Some(active) if !active.locked => outbound.send(&OutboundEvent::Typing {
                session_id: active.id.clone(),
            }),
            _ => false,
        }
    }
}

/// Client-made message with a deterministic id, so re-delivery of the
/// triggering event collapses onto it. Stamped strictly after the current
/// tail so no tie-break can put it ahead of the tail.
fn synthetic(
    active: &ActiveConversation,
    kind: &str,
    content: String,
    wall: DateTime<Utc>,
) -> MessageRecord {
    let created_at = match active.timeline.last() {
        Some(tail) if wall <= tail.created_at => tail.created_at + ChronoDuration::microseconds(1),
        _ => wall,
    };
    MessageRecord::new(
        format!("{}:{}", kind, active.id),
        Sender::Automated,
        content,
        created_at,
    )
    .in_session(active.id.clone())
}

// ============================================================================
// TESTS
// ============================================================================
