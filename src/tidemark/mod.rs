use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{FixedOffset, Offset, Utc};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

pub mod error;
pub mod event_store;
pub mod events;
pub mod pagination;
pub mod profiles;
pub mod resolver;
pub mod timeline;
pub mod view;

#[cfg(test)]
mod tests;

use crate::init_tracing;
use crate::transport::{PaginationDirection, Transport};

pub use error::{Result, TidemarkError};
pub use events::{
    ConversationId, Event, EventBatch, EventId, EventKind, EventSource, MembershipChange,
    Payload, Relations, SenderOverride, StableKey, ThreadRelation, TransactionId, UserId,
};
pub use pagination::{MAX_PAGINATION_LIMIT, PaginationOutcome, PaginationStatus};
pub use profiles::{Profile, ProfileDirectory};
pub use resolver::{ReactionGroup, ReactionSummary};
pub use timeline::{
    IngestReport, TimelineStatistics, TimelineStatus, TimelineSubscription,
};
pub use view::{
    ContentItem, DisplayBody, DisplayItem, RestoredAnchor, TimelineFilter, TimelineSnapshot,
    ViewAnchor,
};

use pagination::PaginationRequest;
use timeline::ConversationRegistry;
use view::ViewConfig;

#[derive(Clone, Debug)]
pub struct TidemarkConfig {
    /// Directory for engine data
    pub data_dir: PathBuf,

    /// Directory for engine logs
    pub logs_dir: PathBuf,

    /// Offset used to assign events to calendar days for date dividers
    pub timezone_offset: FixedOffset,

    /// Upper bound on a single pagination round-trip
    pub pagination_timeout: Duration,

    /// Events requested per pagination fill when the caller does not say
    pub default_pagination_limit: usize,

    /// How many recent display items the rebuild worker scans for senders
    /// with missing profile metadata
    pub profile_refresh_window: usize,

    /// Minimum gap between refresh requests for the same profile
    pub profile_refresh_cooldown: Duration,
}

impl TidemarkConfig {
    pub fn new(data_dir: &Path, logs_dir: &Path) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };
        let formatted_data_dir = data_dir.join(env_suffix);
        let formatted_logs_dir = logs_dir.join(env_suffix);

        Self {
            data_dir: formatted_data_dir,
            logs_dir: formatted_logs_dir,
            timezone_offset: Utc.fix(),
            pagination_timeout: Duration::from_secs(10),
            default_pagination_limit: 20,
            profile_refresh_window: 20,
            profile_refresh_cooldown: Duration::from_secs(300),
        }
    }
}

/// The timeline reconciliation engine. Explicitly owned by the embedder;
/// construct one per logged-in session and share it behind an `Arc` if
/// multiple subsystems feed it.
pub struct Tidemark {
    pub config: TidemarkConfig,
    registry: Arc<ConversationRegistry>,
    profiles: Arc<ProfileDirectory>,
    transport: Arc<dyn Transport>,
    // `None` once shut down; dropping the sender is what closes the queue.
    event_sender: RwLock<Option<Sender<EventBatch>>>,
    shutdown_sender: Sender<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Tidemark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tidemark")
            .field("config", &self.config)
            .field("conversations", &self.registry.len())
            .field("profiles", &self.profiles.len())
            .field("transport", &"<REDACTED>")
            .finish()
    }
}

impl Tidemark {
    /// Initializes the engine: sets up the data and log directories,
    /// configures logging, and starts the ingest pump.
    ///
    /// # Arguments
    ///
    /// * `config` - A [`TidemarkConfig`] specifying directories and tuning.
    /// * `transport` - The embedder's protocol layer, used for pagination
    ///   and profile fetches.
    pub async fn new(config: TidemarkConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        if config.default_pagination_limit == 0
            || config.default_pagination_limit > MAX_PAGINATION_LIMIT
        {
            return Err(TidemarkError::Configuration(format!(
                "default_pagination_limit must be between 1 and {}",
                MAX_PAGINATION_LIMIT
            )));
        }

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", config.data_dir))
            .map_err(TidemarkError::from)?;
        std::fs::create_dir_all(&config.logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", config.logs_dir))
            .map_err(TidemarkError::from)?;

        // Only initialize tracing once
        init_tracing(&config.logs_dir);

        tracing::debug!(target: "tidemark::new", "Logging initialized in directory: {:?}", config.logs_dir);

        let profiles = Arc::new(ProfileDirectory::new(
            transport.clone(),
            config.profile_refresh_cooldown,
        ));
        let registry = Arc::new(ConversationRegistry::new(
            profiles.clone(),
            ViewConfig {
                timezone_offset: config.timezone_offset,
            },
            config.profile_refresh_window,
        ));

        let (event_sender, event_receiver) = mpsc::channel(500);
        let (shutdown_sender, shutdown_receiver) = mpsc::channel(1);

        let pump = tokio::spawn(Self::process_batches(
            registry.clone(),
            event_receiver,
            shutdown_receiver,
        ));

        tracing::debug!(target: "tidemark::new", "Timeline engine initialized");

        Ok(Self {
            config,
            registry,
            profiles,
            transport,
            event_sender: RwLock::new(Some(event_sender)),
            shutdown_sender,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Opens a conversation timeline and subscribes to its snapshots. Marks
    /// the conversation exempt from eviction until closed.
    ///
    /// Must be called from within the runtime.
    pub fn open_conversation(&self, conversation_id: &ConversationId) -> TimelineSubscription {
        let handle = self.registry.get_or_create(conversation_id);
        handle.mark_open(true);
        handle.subscribe()
    }

    /// Unmarks the conversation as open. Its state is kept until the next
    /// eviction pass, so reopening is cheap.
    pub fn close_conversation(&self, conversation_id: &ConversationId) {
        if let Some(handle) = self.registry.get(conversation_id) {
            handle.mark_open(false);
        }
    }

    /// Drops every conversation not currently open, aborting their rebuild
    /// workers. Returns how many were evicted. Intended as the embedder's
    /// memory-pressure hook.
    pub fn evict_closed(&self) -> usize {
        self.registry.evict_closed()
    }

    /// Ingests a batch synchronously and returns what changed. Creates the
    /// conversation's timeline if this is the first batch for it.
    ///
    /// Must be called from within the runtime.
    pub async fn ingest(
        &self,
        conversation_id: &ConversationId,
        events: Vec<Event>,
        source: EventSource,
    ) -> Result<IngestReport> {
        let handle = self.registry.get_or_create(conversation_id);
        handle.ingest(events, source).await
    }

    /// Queues a batch for the ingest pump. Backpressure applies when the
    /// queue is full; `Err(ShutDown)` after [`Tidemark::shutdown`].
    pub async fn queue_batch(&self, batch: EventBatch) -> Result<()> {
        let sender = self.event_sender.read().await;
        match sender.as_ref() {
            Some(sender) => sender
                .send(batch)
                .await
                .map_err(|_| TidemarkError::ShutDown),
            None => Err(TidemarkError::ShutDown),
        }
    }

    /// Runs one history fill for an open conversation. Transient failures
    /// (offline, timeout, transport error) come back as a
    /// [`PaginationOutcome`] status, never as `Err`.
    pub async fn request_pagination(
        &self,
        conversation_id: &ConversationId,
        direction: PaginationDirection,
        limit: Option<usize>,
        anchor: Option<ViewAnchor>,
    ) -> Result<PaginationOutcome> {
        let Some(handle) = self.registry.get(conversation_id) else {
            return Err(TidemarkError::ConversationNotOpen(conversation_id.clone()));
        };
        pagination::run(
            &handle,
            &self.transport,
            PaginationRequest {
                direction,
                limit: limit.unwrap_or(self.config.default_pagination_limit),
                anchor,
            },
            self.config.pagination_timeout,
        )
        .await
    }

    /// Switches a conversation between the flat view and main-timeline-only
    /// view. A change triggers a rebuild.
    pub async fn set_timeline_filter(
        &self,
        conversation_id: &ConversationId,
        filter: TimelineFilter,
    ) -> Result<()> {
        let Some(handle) = self.registry.get(conversation_id) else {
            return Err(TidemarkError::ConversationNotOpen(conversation_id.clone()));
        };
        handle.set_filter(filter).await;
        Ok(())
    }

    /// The latest published snapshot for a conversation.
    pub fn current_snapshot(&self, conversation_id: &ConversationId) -> Result<TimelineSnapshot> {
        match self.registry.get(conversation_id) {
            Some(handle) => Ok(handle.current_snapshot()),
            None => Err(TidemarkError::ConversationNotOpen(conversation_id.clone())),
        }
    }

    pub async fn timeline_statistics(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<TimelineStatistics> {
        match self.registry.get(conversation_id) {
            Some(handle) => Ok(handle.statistics().await),
            None => Err(TidemarkError::ConversationNotOpen(conversation_id.clone())),
        }
    }

    /// The participant profile cache shared by all conversations.
    pub fn profiles(&self) -> &Arc<ProfileDirectory> {
        &self.profiles
    }

    /// Stops the ingest pump (draining what is already queued), then closes
    /// every conversation timeline. Queueing afterwards fails with
    /// [`TidemarkError::ShutDown`]. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::debug!(target: "tidemark::shutdown", "Shutting down timeline engine");
        match self.shutdown_sender.send(()).await {
            Ok(_) => {}
            Err(_) => {} // Expected if the pump already shut down
        }
        // Dropping the queue sender ends the pump's drain. Conversations are
        // closed only after the pump exits; the lock serializes concurrent
        // shutdowns.
        drop(self.event_sender.write().await.take());
        let mut slot = self.pump.lock().await;
        if let Some(pump) = slot.take() {
            let _ = pump.await;
        }
        drop(slot);
        self.registry.shutdown();
        Ok(())
    }

    /// Ingest pump. Batches queued by the transport bindings are applied in
    /// arrival order; a shutdown signal drains the queue before exiting.
    async fn process_batches(
        registry: Arc<ConversationRegistry>,
        mut receiver: Receiver<EventBatch>,
        mut shutdown: Receiver<()>,
    ) {
        tracing::debug!(
            target: "tidemark::process_batches",
            "Starting ingest pump"
        );

        let mut shutting_down = false;

        loop {
            tokio::select! {
                Some(batch) = receiver.recv() => {
                    let handle = registry.get_or_create(&batch.conversation_id);
                    match handle.ingest(batch.events, batch.source).await {
                        Ok(report) => {
                            tracing::debug!(
                                target: "tidemark::process_batches",
                                "Ingested batch for {}: {} added, {} duplicate(s), {} promoted",
                                batch.conversation_id,
                                report.added,
                                report.duplicates,
                                report.promoted
                            );
                        }
                        Err(error) => {
                            tracing::warn!(
                                target: "tidemark::process_batches",
                                "Dropped batch for {}: {}",
                                batch.conversation_id,
                                error
                            );
                        }
                    }
                }
                Some(_) = shutdown.recv(), if !shutting_down => {
                    tracing::debug!(
                        target: "tidemark::process_batches",
                        "Received shutdown signal, draining ingest queue..."
                    );
                    shutting_down = true;
                }
                else => {
                    if shutting_down {
                        tracing::debug!(
                            target: "tidemark::process_batches",
                            "Queue drained, stopping ingest pump"
                        );
                    } else {
                        tracing::debug!(
                            target: "tidemark::process_batches",
                            "All channels closed, stopping ingest pump"
                        );
                    }
                    break;
                }
            }
        }
    }
}
