//! Per-conversation timeline state and the rebuild pipeline.
//!
//! Each conversation owns an event store, its resolved relations, and a
//! background rebuild worker. Ingest, resolution and the dirty mark happen
//! inside one short critical section per conversation; the expensive view
//! build runs on the worker from an immutable snapshot, so a slow rebuild
//! never blocks ingestion. Rapid consecutive changes coalesce: the dirty
//! channel only ever holds the latest generation, and one in-flight build
//! picks it up.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::tidemark::error::Result;
use crate::tidemark::event_store::{EventStore, IngestResult};
use crate::tidemark::events::{ConversationId, Event, EventSource};
use crate::tidemark::profiles::ProfileDirectory;
use crate::tidemark::resolver::{self, ResolvedIndex};
use crate::tidemark::view::{self, DisplayItem, TimelineFilter, TimelineSnapshot, ViewConfig};
use crate::transport::{PaginationCursor, PaginationDirection};

/// Lifecycle of a conversation timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineStatus {
    /// Created, nothing ingested yet.
    Loading,
    Idle,
    Paginating,
}

/// What one ingest call changed, plus the generation whose snapshot will
/// reflect it.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IngestReport {
    pub added: usize,
    pub duplicates: usize,
    pub promoted: usize,
    /// Generation of the rebuild this ingest scheduled. Unchanged when the
    /// batch was entirely duplicates.
    pub generation: u64,
}

/// Counters describing one conversation's reconciliation state.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineStatistics {
    pub conversation_id: ConversationId,
    pub event_count: usize,
    pub item_count: usize,
    pub pending_relations: usize,
    pub generation: u64,
    pub status: TimelineStatus,
    pub start_reached: bool,
}

/// A live timeline handed to the embedder: the snapshot that was current at
/// subscription time plus a receiver for every publish after it.
#[derive(Debug)]
pub struct TimelineSubscription {
    pub conversation_id: ConversationId,
    pub current: TimelineSnapshot,
    pub updates: watch::Receiver<TimelineSnapshot>,
}

/// Cursor and status captured when a pagination request wins the
/// per-conversation guard.
#[derive(Debug, Clone)]
pub(crate) struct PaginationContext {
    pub(crate) cursor: Option<PaginationCursor>,
    pub(crate) start_reached: bool,
}

/// Result of merging a pagination response.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PaginationMerge {
    pub(crate) ingest: IngestResult,
    pub(crate) generation: u64,
    pub(crate) start_reached: bool,
}

struct ConversationState {
    store: EventStore,
    resolved: Arc<ResolvedIndex>,
    status: TimelineStatus,
    filter: TimelineFilter,
    generation: u64,
    start_reached: bool,
    back_cursor: Option<PaginationCursor>,
    forward_cursor: Option<PaginationCursor>,
}

pub(crate) struct ConversationHandle {
    conversation_id: ConversationId,
    state: Mutex<ConversationState>,
    dirty: watch::Sender<u64>,
    snapshot: watch::Sender<TimelineSnapshot>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    open: AtomicBool,
}

impl ConversationHandle {
    /// Creates the handle and starts its rebuild worker.
    pub(crate) fn spawn(
        conversation_id: ConversationId,
        profiles: Arc<ProfileDirectory>,
        view_config: ViewConfig,
        refresh_window: usize,
    ) -> Arc<Self> {
        let (dirty_tx, dirty_rx) = watch::channel(0u64);
        let (snapshot_tx, _) = watch::channel(TimelineSnapshot::empty());

        let handle = Arc::new(Self {
            conversation_id: conversation_id.clone(),
            state: Mutex::new(ConversationState {
                store: EventStore::new(conversation_id),
                resolved: Arc::new(ResolvedIndex::default()),
                status: TimelineStatus::Loading,
                filter: TimelineFilter::default(),
                generation: 0,
                start_reached: false,
                back_cursor: None,
                forward_cursor: None,
            }),
            dirty: dirty_tx,
            snapshot: snapshot_tx,
            worker: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            open: AtomicBool::new(false),
        });

        let worker = tokio::spawn(rebuild_worker(
            handle.clone(),
            dirty_rx,
            profiles,
            view_config,
            refresh_window,
        ));
        if let Ok(mut slot) = handle.worker.lock() {
            *slot = Some(worker);
        }

        handle
    }

    pub(crate) fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Ingest, resolve and mark dirty, all inside the per-conversation
    /// critical section. A batch of pure duplicates changes nothing and
    /// schedules no rebuild.
    pub(crate) async fn ingest(
        &self,
        events: Vec<Event>,
        source: EventSource,
    ) -> Result<IngestReport> {
        let mut state = self.state.lock().await;
        let result = state.store.ingest(events, source)?;
        if state.status == TimelineStatus::Loading {
            state.status = TimelineStatus::Idle;
        }
        let generation = if result.changed() {
            self.apply_change(&mut state)
        } else {
            state.generation
        };
        Ok(IngestReport {
            added: result.added,
            duplicates: result.duplicates,
            promoted: result.promoted,
            generation,
        })
    }

    /// Re-resolves relations and schedules a rebuild. Caller holds the lock.
    fn apply_change(&self, state: &mut ConversationState) -> u64 {
        let snapshot = state.store.snapshot();
        state.resolved = Arc::new(resolver::resolve(&snapshot));
        state.generation += 1;
        let generation = state.generation;
        let _ = self.dirty.send(generation);
        generation
    }

    /// The latest published snapshot.
    pub(crate) fn current_snapshot(&self) -> TimelineSnapshot {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> TimelineSubscription {
        let updates = self.snapshot.subscribe();
        TimelineSubscription {
            conversation_id: self.conversation_id.clone(),
            current: self.snapshot.borrow().clone(),
            updates,
        }
    }

    /// Blocks until a snapshot covering `generation` is published. Returns
    /// it, or `None` if the timeline closed before one appeared.
    pub(crate) async fn wait_for_generation(&self, generation: u64) -> Option<TimelineSnapshot> {
        let mut receiver = self.snapshot.subscribe();
        match receiver
            .wait_for(|snapshot| snapshot.generation >= generation || self.is_closed())
            .await
        {
            Ok(snapshot) if snapshot.generation >= generation => Some(snapshot.clone()),
            _ => None,
        }
    }

    pub(crate) async fn set_filter(&self, filter: TimelineFilter) {
        let mut state = self.state.lock().await;
        if state.filter != filter {
            state.filter = filter;
            self.apply_change(&mut state);
        }
    }

    /// Wins the pagination guard, or returns `None` when a fill is already
    /// in flight for this conversation.
    pub(crate) async fn try_begin_pagination(
        &self,
        direction: PaginationDirection,
    ) -> Option<PaginationContext> {
        let mut state = self.state.lock().await;
        if state.status == TimelineStatus::Paginating {
            return None;
        }
        state.status = TimelineStatus::Paginating;
        let cursor = match direction {
            PaginationDirection::Backward => state.back_cursor.clone(),
            PaginationDirection::Forward => state.forward_cursor.clone(),
        };
        Some(PaginationContext {
            cursor,
            start_reached: state.start_reached,
        })
    }

    /// Merges a pagination response and releases the guard.
    pub(crate) async fn finish_pagination(
        &self,
        direction: PaginationDirection,
        events: Vec<Event>,
        next_cursor: Option<PaginationCursor>,
    ) -> Result<PaginationMerge> {
        let mut state = self.state.lock().await;
        state.status = TimelineStatus::Idle;
        let ingest = state.store.ingest(events, EventSource::Pagination)?;
        match direction {
            PaginationDirection::Backward => {
                state.start_reached = next_cursor.is_none();
                state.back_cursor = next_cursor;
            }
            PaginationDirection::Forward => {
                state.forward_cursor = next_cursor;
            }
        }
        let generation = if ingest.changed() {
            self.apply_change(&mut state)
        } else {
            state.generation
        };
        Ok(PaginationMerge {
            ingest,
            generation,
            start_reached: state.start_reached,
        })
    }

    /// Releases the guard without merging anything (offline, timeout,
    /// transport failure).
    pub(crate) async fn release_pagination(&self) {
        let mut state = self.state.lock().await;
        if state.status == TimelineStatus::Paginating {
            state.status = TimelineStatus::Idle;
        }
    }

    pub(crate) async fn start_reached(&self) -> bool {
        self.state.lock().await.start_reached
    }

    pub(crate) async fn statistics(&self) -> TimelineStatistics {
        let state = self.state.lock().await;
        TimelineStatistics {
            conversation_id: self.conversation_id.clone(),
            event_count: state.store.len(),
            item_count: self.snapshot.borrow().len(),
            pending_relations: state.resolved.pending().len(),
            generation: state.generation,
            status: state.status,
            start_reached: state.start_reached,
        }
    }

    pub(crate) fn mark_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Stops the rebuild worker and abandons any in-flight build. Pending
    /// generation waits resolve empty.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.worker.lock() {
            if let Some(worker) = slot.take() {
                worker.abort();
            }
        }
        // Wake parked generation waits so they observe the closed flag.
        self.snapshot.send_modify(|_| {});
        tracing::debug!(
            target: "tidemark::timeline",
            "Closed timeline for {}",
            self.conversation_id
        );
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Consumes dirty generations and publishes complete snapshots. At most one
/// build runs at a time; generations that arrive mid-build collapse into the
/// next iteration because the watch channel only keeps the latest value.
async fn rebuild_worker(
    handle: Arc<ConversationHandle>,
    mut dirty: watch::Receiver<u64>,
    profiles: Arc<ProfileDirectory>,
    view_config: ViewConfig,
    refresh_window: usize,
) {
    tracing::debug!(
        target: "tidemark::rebuild",
        "Rebuild worker started for {}",
        handle.conversation_id
    );

    loop {
        if dirty.changed().await.is_err() {
            break;
        }
        let generation = *dirty.borrow_and_update();
        if handle.is_closed() {
            break;
        }

        let (events, resolved, filter) = {
            let state = handle.state.lock().await;
            (
                state.store.snapshot(),
                state.resolved.clone(),
                state.filter,
            )
        };

        let items = view::build(
            &events,
            &resolved,
            &profiles,
            &handle.conversation_id,
            filter,
            &view_config,
        );

        // A close that raced the build wins; never publish afterwards.
        if handle.is_closed() {
            break;
        }

        let items = Arc::new(items);
        handle.snapshot.send_replace(TimelineSnapshot {
            generation,
            items: items.clone(),
        });
        tracing::debug!(
            target: "tidemark::rebuild",
            "Published generation {} for {} ({} items)",
            generation,
            handle.conversation_id,
            items.len()
        );

        refresh_recent_senders(&items, refresh_window, &profiles, &handle.conversation_id);
    }

    tracing::debug!(
        target: "tidemark::rebuild",
        "Rebuild worker stopped for {}",
        handle.conversation_id
    );
}

/// Requests profile refreshes for senders of the most recent items that
/// have no cached metadata yet. Never fetches eagerly for a whole
/// conversation.
fn refresh_recent_senders(
    items: &[DisplayItem],
    window: usize,
    profiles: &Arc<ProfileDirectory>,
    conversation_id: &ConversationId,
) {
    let mut seen = HashSet::new();
    for item in items.iter().rev().filter_map(|i| i.as_content()).take(window) {
        if item.has_identity_override {
            continue;
        }
        if !seen.insert(item.sender_id.clone()) {
            continue;
        }
        if profiles.get(&item.sender_id, Some(conversation_id)).is_none() {
            profiles.clone().request_refresh(
                item.sender_id.clone(),
                Some(conversation_id.clone()),
            );
        }
    }
}

/// All live conversation timelines, independent of each other. Lookups and
/// creation are lock-free across conversations.
pub(crate) struct ConversationRegistry {
    conversations: DashMap<ConversationId, Arc<ConversationHandle>>,
    profiles: Arc<ProfileDirectory>,
    view_config: ViewConfig,
    refresh_window: usize,
}

impl ConversationRegistry {
    pub(crate) fn new(
        profiles: Arc<ProfileDirectory>,
        view_config: ViewConfig,
        refresh_window: usize,
    ) -> Self {
        Self {
            conversations: DashMap::new(),
            profiles,
            view_config,
            refresh_window,
        }
    }

    pub(crate) fn get(&self, conversation_id: &ConversationId) -> Option<Arc<ConversationHandle>> {
        self.conversations
            .get(conversation_id)
            .map(|handle| handle.clone())
    }

    pub(crate) fn get_or_create(&self, conversation_id: &ConversationId) -> Arc<ConversationHandle> {
        self.conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| {
                tracing::debug!(
                    target: "tidemark::timeline",
                    "Creating timeline for {}",
                    conversation_id
                );
                ConversationHandle::spawn(
                    conversation_id.clone(),
                    self.profiles.clone(),
                    self.view_config.clone(),
                    self.refresh_window,
                )
            })
            .clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Drops every conversation the embedder has not marked open, aborting
    /// their workers. Returns how many were evicted.
    pub(crate) fn evict_closed(&self) -> usize {
        let mut evicted = 0;
        self.conversations.retain(|_, handle| {
            if handle.is_open() {
                true
            } else {
                handle.close();
                evicted += 1;
                false
            }
        });
        if evicted > 0 {
            tracing::debug!(
                target: "tidemark::timeline",
                "Evicted {} closed conversation(s)",
                evicted
            );
        }
        evicted
    }

    /// Closes everything, open or not.
    pub(crate) fn shutdown(&self) {
        for entry in self.conversations.iter() {
            entry.value().close();
        }
        self.conversations.clear();
    }
}
