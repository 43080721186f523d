pub use crate::tidemark::{
    ContentItem, ConversationId, DisplayBody, DisplayItem, Event, EventBatch, EventId, EventKind,
    EventSource, IngestReport, MembershipChange, PaginationOutcome, PaginationStatus, Payload,
    Profile, ProfileDirectory, ReactionGroup, ReactionSummary, Relations, RestoredAnchor, Result,
    SenderOverride, StableKey, ThreadRelation, Tidemark, TidemarkConfig, TidemarkError,
    TimelineFilter, TimelineSnapshot, TimelineStatistics, TimelineStatus, TimelineSubscription,
    TransactionId, UserId, ViewAnchor,
};
pub use crate::transport::{
    PaginationBatch, PaginationCursor, PaginationDirection, ProfilePayload, Transport,
};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

use std::sync::{Mutex, OnceLock};

pub mod tidemark;
pub mod transport;

static TRACING_GUARDS: OnceLock<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

fn init_tracing(logs_dir: &std::path::Path) {
    TRACING_INIT.get_or_init(|| {
        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("tidemark")
            .filename_suffix("log")
            .build(logs_dir)
            .expect("Failed to create file appender");

        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .init();
    });
}
