//! Session list synchronizer: one categorized, filtered session list kept
//! in step with the server through snapshot fetches and push deltas.

use crate::envelope::{InboundEvent, OutboundEvent};
use crate::error::SyncError;
use crate::models::{ChatCategory, HandlerMode, MessageRecord, SessionSummary};
use crate::resync::ResyncLimiter;
use crate::snapshot::{SessionFilter, SnapshotSource};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// Identifies one list fetch. Carries the category and filter the fetch
/// must be issued with, so it can be run on another task.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTicket {
    pub category: ChatCategory,
    pub filter: SessionFilter,
    generation: u64,
}

/// A delta referenced a session this list does not hold; the caller should
/// run a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRequest {
    pub session_id: String,
}

pub struct SessionListSync {
    category: ChatCategory,
    filter: SessionFilter,
    sessions: Vec<SessionSummary>,
    limiter: ResyncLimiter,
    generation: u64,
    in_flight: bool,
    /// A resync was asked for while a fetch was outstanding.
    resync_pending: bool,
    /// Deltas seen while a fetch is outstanding, replayed over its result.
    replay: Vec<InboundEvent>,
    selected: Option<String>,
}

impl SessionListSync {
    pub fn new(category: ChatCategory, filter: SessionFilter, debounce: Duration) -> Self {
        Self {
            category,
            filter,
            sessions: Vec::new(),
            limiter: ResyncLimiter::new(debounce),
            generation: 0,
            in_flight: false,
            resync_pending: false,
            replay: Vec::new(),
            selected: None,
        }
    }

    pub fn category(&self) -> ChatCategory {
        self.category
    }

    pub fn filter(&self) -> &SessionFilter {
        &self.filter
    }

    pub fn sessions(&self) -> &[SessionSummary] {
        &self.sessions
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionSummary> {
        self.sessions.iter().find(|s| s.id == session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.get(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Handshake frame for this list's category, sent from `on_open`.
    pub fn subscribe_event(&self) -> OutboundEvent {
        OutboundEvent::SubscribeChats {
            chat_type: self.category,
        }
    }

    // ========================================================================
    // Snapshot path
    // ========================================================================

    /// Start a fetch. Any fetch started earlier becomes stale.
    ///
    /// Use this when the request itself changed (filter, reconnect, lag).
    /// Resyncs for missing sessions go through [`SessionListSync::request_resync`].
    pub fn begin_fetch(&mut self) -> FetchTicket {
        self.generation += 1;
        self.in_flight = true;
        self.resync_pending = false;
        FetchTicket {
            category: self.category,
            filter: self.filter.clone(),
            generation: self.generation,
        }
    }

    /// Replace the filter. Sessions that no longer match are dropped right
    /// away; the returned ticket is for the refetch under the new filter.
    pub fn set_filter(&mut self, filter: SessionFilter) -> FetchTicket {
        tracing::debug!(category = %self.category, ?filter, "Session filter changed");
        self.filter = filter;
        let filter = &self.filter;
        self.sessions.retain(|s| filter.matches(s));
        self.begin_fetch()
    }

    /// Ticket for a resync, unless a fetch is already outstanding. In that
    /// case one follow-up is recorded and handed out by
    /// [`SessionListSync::take_pending_resync`] once the current fetch lands,
    /// so a steady stream of misses cannot keep superseding every fetch.
    pub fn request_resync(&mut self, request: &ResyncRequest) -> Option<FetchTicket> {
        if self.in_flight {
            if !self.resync_pending {
                tracing::debug!(
                    category = %self.category,
                    session_id = %request.session_id,
                    "Fetch in flight; resync deferred"
                );
            }
            self.resync_pending = true;
            return None;
        }
        Some(self.begin_fetch())
    }

    /// The deferred resync, once no fetch is outstanding.
    pub fn take_pending_resync(&mut self) -> Option<FetchTicket> {
        if self.in_flight || !self.resync_pending {
            return None;
        }
        Some(self.begin_fetch())
    }

    pub fn has_pending_resync(&self) -> bool {
        self.resync_pending
    }

    /// Apply a fetch result.
    ///
    /// Returns `Ok(false)` for a stale ticket. A fetch error is returned and
    /// the list keeps its current contents. Either way a current ticket ends
    /// the in-flight fetch; check [`SessionListSync::take_pending_resync`]
    /// afterwards.
    pub fn apply_fetch(
        &mut self,
        ticket: &FetchTicket,
        result: Result<Vec<SessionSummary>, SyncError>,
    ) -> Result<bool, SyncError> {
        if ticket.generation != self.generation {
            tracing::debug!(category = %self.category, "Discarding stale session list response");
            return Ok(false);
        }
        self.in_flight = false;
        let replay = std::mem::take(&mut self.replay);

        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(category = %self.category, error = %e, "Session list fetch failed");
                return Err(e);
            }
        };

        let mut seen = HashSet::new();
        self.sessions = rows
            .into_iter()
            .filter(|s| s.category == self.category && seen.insert(s.id.clone()))
            .collect();
        for session in &self.sessions {
            self.limiter.forget(&session.id);
        }

        let replayed = replay.len();
        for event in &replay {
            self.apply(event, None);
        }
        self.sort();

        tracing::debug!(
            category = %self.category,
            sessions = self.sessions.len(),
            replayed,
            "Session list snapshot applied"
        );
        Ok(true)
    }

    /// Fetch and apply in one step.
    pub async fn fetch(
        &mut self,
        source: &dyn SnapshotSource,
    ) -> Result<&[SessionSummary], SyncError> {
        let ticket = self.begin_fetch();
        let result = source.fetch_sessions(ticket.category, &ticket.filter).await;
        self.apply_fetch(&ticket, result)?;
        Ok(self.sessions())
    }

    // ========================================================================
    // Push path
    // ========================================================================

    /// Apply one push delta. Returns a resync request when the event refers
    /// to a session this list does not hold and the debounce window allows.
    pub fn apply_delta(&mut self, event: &InboundEvent, now: Instant) -> Option<ResyncRequest> {
        self.limiter.prune(now);
        let request = self.apply(event, Some(now));
        if self.in_flight && is_list_delta(event) {
            self.replay.push(event.clone());
        }
        request
    }

    /// Rate-limited resync for a missing session: at most one request per
    /// session id per debounce window.
    pub fn ensure_visible(&mut self, session_id: &str, now: Instant) -> Option<ResyncRequest> {
        if self.contains(session_id) {
            return None;
        }
        if self.limiter.try_acquire(session_id, now) {
            tracing::debug!(category = %self.category, session_id, "Unknown session referenced; resyncing");
            Some(ResyncRequest {
                session_id: session_id.to_string(),
            })
        } else {
            tracing::trace!(session_id, "Resync suppressed within debounce window");
            None
        }
    }

    /// `now` is `None` during replay: missing sessions are not chased then.
    fn apply(&mut self, event: &InboundEvent, now: Option<Instant>) -> Option<ResyncRequest> {
        match event {
            InboundEvent::NewMessage { session_id, message }
            | InboundEvent::CustomerMessage { session_id, message } => {
                let id = session_id.as_deref().or(message.session_id.as_deref())?;
                if self.touch(id, message) {
                    None
                } else {
                    self.miss(id, now)
                }
            }
            InboundEvent::UnreadCountUpdated {
                session_id,
                unread_count,
            } => match self.session_mut(session_id) {
                Some(session) => {
                    session.unread_count = *unread_count;
                    None
                }
                None => self.miss(session_id, now),
            },
            InboundEvent::SessionStatusChanged {
                session_id,
                status,
                handler,
            } => self.status_changed(session_id, *status, *handler, now),
            InboundEvent::SessionCompleted {
                session_id: Some(session_id),
                ..
            } => self.status_changed(session_id, ChatCategory::Completed, None, now),
            InboundEvent::NewChatSession { session } => {
                self.admit(session);
                None
            }
            _ => None,
        }
    }

    fn miss(&mut self, session_id: &str, now: Option<Instant>) -> Option<ResyncRequest> {
        now.and_then(|now| self.ensure_visible(session_id, now))
    }

    fn status_changed(
        &mut self,
        session_id: &str,
        status: ChatCategory,
        handler: Option<HandlerMode>,
        now: Option<Instant>,
    ) -> Option<ResyncRequest> {
        let known = self.contains(session_id);
        match (known, status == self.category) {
            (true, false) => {
                self.sessions.retain(|s| s.id != session_id);
                tracing::debug!(
                    category = %self.category,
                    session_id,
                    moved_to = %status,
                    "Session left list"
                );
                None
            }
            (true, true) => {
                if let (Some(handler), Some(session)) = (handler, self.session_mut(session_id)) {
                    session.handler_mode = handler;
                }
                None
            }
            // Moved into this category; the row itself comes from a fetch.
            (false, true) => self.miss(session_id, now),
            (false, false) => None,
        }
    }

    fn admit(&mut self, session: &SessionSummary) {
        if session.category != self.category
            || self.contains(&session.id)
            || !self.filter.matches(session)
        {
            return;
        }
        tracing::debug!(category = %self.category, session_id = %session.id, "Session joined list");
        self.limiter.forget(&session.id);
        self.sessions.push(session.clone());
        self.sort();
    }

    /// Update preview and activity from a message. `false` if the session
    /// is not in this list.
    fn touch(&mut self, session_id: &str, message: &MessageRecord) -> bool {
        let Some(session) = self.session_mut(session_id) else {
            return false;
        };
        let newer = session
            .last_activity_at
            .map_or(true, |at| message.created_at >= at);
        if newer {
            session.last_message_preview = message.content.clone();
            session.last_activity_at = Some(message.created_at);
            self.sort();
        }
        true
    }

    /// Open a session in the detail view; its unread count is cleared
    /// locally ahead of the server's own update.
    pub fn select(&mut self, session_id: &str) -> bool {
        self.selected = Some(session_id.to_string());
        match self.session_mut(session_id) {
            Some(session) => {
                session.unread_count = 0;
                true
            }
            None => false,
        }
    }

    fn session_mut(&mut self, session_id: &str) -> Option<&mut SessionSummary> {
        self.sessions.iter_mut().find(|s| s.id == session_id)
    }

    fn sort(&mut self) {
        self.sessions.sort_by(activity_cmp);
    }
}

fn is_list_delta(event: &InboundEvent) -> bool {
    matches!(
        event,
        InboundEvent::NewMessage { .. }
            | InboundEvent::CustomerMessage { .. }
            | InboundEvent::UnreadCountUpdated { .. }
            | InboundEvent::SessionStatusChanged { .. }
            | InboundEvent::SessionCompleted { .. }
            | InboundEvent::NewChatSession { .. }
    )
}

/// Most recent activity first; sessions with no activity last; ties by id.
fn activity_cmp(a: &SessionSummary, b: &SessionSummary) -> Ordering {
    match (a.last_activity_at, b.last_activity_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sender;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    const DEBOUNCE: Duration = Duration::from_millis(500);

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    fn session(id: &str, category: ChatCategory, activity: DateTime<Utc>) -> SessionSummary {
        let mut s = SessionSummary::new(id, category);
        s.customer_name = Some(format!("Customer {id}"));
        s.last_activity_at = Some(activity);
        s
    }

    fn active_list(rows: Vec<SessionSummary>) -> SessionListSync {
        let mut sync = SessionListSync::new(ChatCategory::Active, SessionFilter::default(), DEBOUNCE);
        let ticket = sync.begin_fetch();
        sync.apply_fetch(&ticket, Ok(rows)).unwrap();
        sync
    }

    fn ids(sync: &SessionListSync) -> Vec<&str> {
        sync.sessions().iter().map(|s| s.id.as_str()).collect()
    }

    fn message_event(session_id: &str, id: &str, content: &str, time: DateTime<Utc>) -> InboundEvent {
        InboundEvent::NewMessage {
            session_id: Some(session_id.to_string()),
            message: MessageRecord::new(id, Sender::Customer, content, time),
        }
    }

    struct CountingSource {
        calls: AtomicUsize,
        rows: Vec<SessionSummary>,
    }

    #[async_trait]
    impl SnapshotSource for CountingSource {
        async fn fetch_messages(&self, _id: &str) -> Result<Vec<MessageRecord>, SyncError> {
            Ok(Vec::new())
        }

        async fn fetch_sessions(
            &self,
            category: ChatCategory,
            _filter: &SessionFilter,
        ) -> Result<Vec<SessionSummary>, SyncError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(self
                .rows
                .iter()
                .filter(|s| s.category == category)
                .cloned()
                .collect())
        }
    }

    #[test]
    fn test_snapshot_sorted_by_activity_desc() {
        let sync = active_list(vec![
            session("a", ChatCategory::Active, at(9, 0)),
            session("b", ChatCategory::Active, at(11, 0)),
            session("c", ChatCategory::Active, at(10, 0)),
            session("x", ChatCategory::Pending, at(12, 0)),
        ]);
        assert_eq!(ids(&sync), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_status_change_removes_from_other_category() {
        let mut sync = active_list(vec![session("s1", ChatCategory::Active, at(10, 0))]);
        let request = sync.apply_delta(
            &InboundEvent::SessionStatusChanged {
                session_id: "s1".to_string(),
                status: ChatCategory::Pending,
                handler: None,
            },
            Instant::now(),
        );
        assert!(request.is_none());
        assert!(!sync.contains("s1"));
    }

    #[test]
    fn test_handler_change_updates_in_place() {
        let mut sync = active_list(vec![session("s1", ChatCategory::Active, at(10, 0))]);
        sync.apply_delta(
            &InboundEvent::SessionStatusChanged {
                session_id: "s1".to_string(),
                status: ChatCategory::Active,
                handler: Some(HandlerMode::Human),
            },
            Instant::now(),
        );
        assert_eq!(sync.get("s1").map(|s| s.handler_mode), Some(HandlerMode::Human));
    }

    #[test]
    fn test_unknown_status_change_into_category_requests_resync() {
        let mut sync = active_list(vec![]);
        let now = Instant::now();
        let into = InboundEvent::SessionStatusChanged {
            session_id: "s9".to_string(),
            status: ChatCategory::Active,
            handler: None,
        };
        assert_eq!(
            sync.apply_delta(&into, now),
            Some(ResyncRequest {
                session_id: "s9".to_string()
            })
        );

        let elsewhere = InboundEvent::SessionStatusChanged {
            session_id: "s8".to_string(),
            status: ChatCategory::Completed,
            handler: None,
        };
        assert!(sync.apply_delta(&elsewhere, now).is_none());
    }

    #[test]
    fn test_unread_burst_for_unknown_session_resyncs_once() {
        let mut sync = active_list(vec![]);
        let t0 = Instant::now();

        let requests = (0..25u64)
            .filter_map(|i| {
                sync.apply_delta(
                    &InboundEvent::UnreadCountUpdated {
                        session_id: "ghost".to_string(),
                        unread_count: i as u32,
                    },
                    t0 + Duration::from_millis(i * 15),
                )
            })
            .count();
        assert_eq!(requests, 1);

        // Past the window another resync is allowed.
        let later = sync.apply_delta(
            &InboundEvent::UnreadCountUpdated {
                session_id: "ghost".to_string(),
                unread_count: 30,
            },
            t0 + Duration::from_millis(900),
        );
        assert!(later.is_some());
    }

    #[test]
    fn test_miss_burst_across_sessions_coalesces_resyncs() {
        let mut sync = active_list(vec![]);
        let t0 = Instant::now();
        let round_trip = Duration::from_millis(100);
        let mut outstanding: Option<(FetchTicket, Instant)> = None;
        let mut started = 0usize;
        let mut applied = 0usize;

        // 1000 messages for 50 sessions this list has never seen, 20ms apart.
        for i in 0..1000u64 {
            let now = t0 + Duration::from_millis(i * 20);

            if let Some((ticket, issued)) = outstanding.take() {
                if now.saturating_duration_since(issued) >= round_trip {
                    assert!(
                        sync.apply_fetch(&ticket, Ok(vec![])).unwrap(),
                        "a resync must never be superseded by another resync"
                    );
                    applied += 1;
                    if let Some(next) = sync.take_pending_resync() {
                        started += 1;
                        outstanding = Some((next, now));
                    }
                } else {
                    outstanding = Some((ticket, issued));
                }
            }

            let event = message_event(&format!("ghost-{}", i % 50), &format!("m{i}"), "hi", at(10, 0));
            if let Some(request) = sync.apply_delta(&event, now) {
                if let Some(ticket) = sync.request_resync(&request) {
                    assert!(outstanding.is_none(), "one fetch at a time");
                    started += 1;
                    outstanding = Some((ticket, now));
                }
            }
            assert!(sync.replay.len() <= 5, "replay grew to {}", sync.replay.len());
        }

        assert!(started <= 201, "started {started} fetches");
        assert_eq!(applied + usize::from(outstanding.is_some()), started);
    }

    #[test]
    fn test_resync_when_idle_starts_fetch_and_filter_change_absorbs_pending() {
        let mut sync = active_list(vec![]);
        let request = ResyncRequest {
            session_id: "s1".to_string(),
        };

        let first = sync.request_resync(&request).expect("idle list fetches at once");
        assert!(sync.request_resync(&request).is_none());
        assert!(sync.has_pending_resync());
        assert!(sync.take_pending_resync().is_none(), "still in flight");

        // A filter change refetches anyway, which covers the deferred resync.
        let refetch = sync.set_filter(SessionFilter {
            search: "kim".to_string(),
            ..Default::default()
        });
        assert!(!sync.has_pending_resync());
        assert!(!sync.apply_fetch(&first, Ok(vec![])).unwrap());
        assert!(sync.apply_fetch(&refetch, Ok(vec![])).unwrap());
        assert!(sync.take_pending_resync().is_none());
    }

    #[test]
    fn test_failed_fetch_still_releases_pending_resync() {
        let mut sync = active_list(vec![]);
        let request = ResyncRequest {
            session_id: "s1".to_string(),
        };
        let ticket = sync.request_resync(&request).unwrap();
        sync.request_resync(&request);

        assert!(sync.apply_fetch(&ticket, Err(SyncError::Unauthenticated)).is_err());
        assert!(sync.take_pending_resync().is_some());
        assert!(!sync.has_pending_resync());
    }

    #[test]
    fn test_message_updates_preview_and_reorders() {
        let mut sync = active_list(vec![
            session("a", ChatCategory::Active, at(9, 0)),
            session("b", ChatCategory::Active, at(10, 0)),
        ]);
        sync.apply_delta(&message_event("a", "m1", "where is my parcel?", at(10, 30)), Instant::now());

        assert_eq!(ids(&sync), vec!["a", "b"]);
        let a = sync.get("a").unwrap();
        assert_eq!(a.last_message_preview, "where is my parcel?");
        assert_eq!(a.last_activity_at, Some(at(10, 30)));
        assert_eq!(a.category, ChatCategory::Active);
    }

    #[test]
    fn test_older_message_does_not_rewind_preview() {
        let mut sync = active_list(vec![session("a", ChatCategory::Active, at(10, 0))]);
        sync.apply_delta(&message_event("a", "new", "newest", at(10, 5)), Instant::now());
        sync.apply_delta(&message_event("a", "old", "older", at(9, 0)), Instant::now());

        let a = sync.get("a").unwrap();
        assert_eq!(a.last_message_preview, "newest");
        assert_eq!(a.last_activity_at, Some(at(10, 5)));
    }

    #[test]
    fn test_new_session_admission_rules() {
        let filter = SessionFilter {
            label: Some("shipping".to_string()),
            ..Default::default()
        };
        let mut sync = SessionListSync::new(ChatCategory::Pending, filter, DEBOUNCE);
        let now = Instant::now();

        let mut matching = session("p1", ChatCategory::Pending, at(10, 0));
        matching.category_label = Some("shipping".to_string());
        let mut other_label = session("p2", ChatCategory::Pending, at(10, 0));
        other_label.category_label = Some("refund".to_string());
        let mut wrong_category = session("p3", ChatCategory::Active, at(10, 0));
        wrong_category.category_label = Some("shipping".to_string());

        for s in [&matching, &other_label, &wrong_category] {
            sync.apply_delta(&InboundEvent::NewChatSession { session: s.clone() }, now);
        }
        assert_eq!(ids(&sync), vec!["p1"]);

        // Already visible: a second announcement changes nothing.
        let mut again = matching.clone();
        again.unread_count = 7;
        sync.apply_delta(&InboundEvent::NewChatSession { session: again }, now);
        assert_eq!(sync.len(), 1);
        assert_eq!(sync.get("p1").map(|s| s.unread_count), Some(0));
    }

    #[test]
    fn test_select_clears_unread() {
        let mut unread = session("s1", ChatCategory::Active, at(10, 0));
        unread.unread_count = 4;
        let mut sync = active_list(vec![unread]);

        assert!(sync.select("s1"));
        assert_eq!(sync.get("s1").map(|s| s.unread_count), Some(0));
        assert_eq!(sync.selected(), Some("s1"));
        assert!(!sync.select("missing"));
    }

    #[test]
    fn test_stale_fetch_after_filter_change_is_discarded() {
        let mut sync = SessionListSync::new(ChatCategory::Active, SessionFilter::default(), DEBOUNCE);
        let old = sync.begin_fetch();
        let new = sync.set_filter(SessionFilter {
            search: "kim".to_string(),
            ..Default::default()
        });
        assert_eq!(new.filter.search, "kim");

        let applied = sync
            .apply_fetch(&old, Ok(vec![session("stale", ChatCategory::Active, at(10, 0))]))
            .unwrap();
        assert!(!applied);
        assert!(sync.is_empty());
        assert!(sync.is_fetching());

        assert!(sync.apply_fetch(&new, Ok(vec![])).unwrap());
        assert!(!sync.is_fetching());
    }

    #[test]
    fn test_set_filter_drops_non_matching_rows() {
        let mut sync = active_list(vec![
            session("kim", ChatCategory::Active, at(10, 0)),
            session("lee", ChatCategory::Active, at(10, 1)),
        ]);
        sync.set_filter(SessionFilter {
            search: "KIM".to_string(),
            ..Default::default()
        });
        assert_eq!(ids(&sync), vec!["kim"]);
    }

    #[test]
    fn test_deltas_during_fetch_replayed_over_snapshot() {
        let mut sync = active_list(vec![]);
        let ticket = sync.begin_fetch();
        let now = Instant::now();

        // The snapshot below predates these.
        sync.apply_delta(&message_event("a", "m9", "latest", at(11, 0)), now);
        sync.apply_delta(
            &InboundEvent::SessionStatusChanged {
                session_id: "b".to_string(),
                status: ChatCategory::Completed,
                handler: None,
            },
            now,
        );

        sync.apply_fetch(
            &ticket,
            Ok(vec![
                session("a", ChatCategory::Active, at(10, 0)),
                session("b", ChatCategory::Active, at(10, 0)),
            ]),
        )
        .unwrap();

        assert_eq!(ids(&sync), vec!["a"]);
        assert_eq!(sync.get("a").map(|s| s.last_message_preview.as_str()), Some("latest"));
    }

    #[test]
    fn test_fetch_error_keeps_list() {
        let mut sync = active_list(vec![session("a", ChatCategory::Active, at(10, 0))]);
        let ticket = sync.begin_fetch();
        let result = sync.apply_fetch(&ticket, Err(SyncError::Unauthenticated));
        assert!(matches!(result, Err(SyncError::Unauthenticated)));
        assert_eq!(ids(&sync), vec!["a"]);
        assert!(!sync.is_fetching());
    }

    #[test]
    fn test_session_completed_leaves_active_list() {
        let mut sync = active_list(vec![session("s1", ChatCategory::Active, at(10, 0))]);
        sync.apply_delta(
            &InboundEvent::SessionCompleted {
                session_id: Some("s1".to_string()),
                message: None,
            },
            Instant::now(),
        );
        assert!(sync.is_empty());
    }

    #[test]
    fn test_subscribe_event_names_category() {
        let sync = SessionListSync::new(ChatCategory::Completed, SessionFilter::default(), DEBOUNCE);
        assert_eq!(
            sync.subscribe_event(),
            OutboundEvent::SubscribeChats {
                chat_type: ChatCategory::Completed
            }
        );
    }

    #[tokio::test]
    async fn test_fetch_uses_source_for_category() {
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            rows: vec![
                session("p1", ChatCategory::Pending, at(10, 0)),
                session("a1", ChatCategory::Active, at(10, 0)),
            ],
        };
        let mut sync = SessionListSync::new(ChatCategory::Pending, SessionFilter::default(), DEBOUNCE);
        let rows = sync.fetch(&source).await.expect("fetch should succeed");
        assert_eq!(rows.len(), 1);
        assert_eq!(source.calls.load(AtomicOrdering::SeqCst), 1);
    }
}
