//! History fills.
//!
//! One bounded transport round-trip per request, merged into the store
//! without disturbing what the consumer is currently looking at. Transient
//! failures (offline, timeout, transport error) never surface as `Err`;
//! they complete with a status flag and zero new events, and the engine
//! never retries on its own.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::tidemark::error::Result;
use crate::tidemark::events::ConversationId;
use crate::tidemark::timeline::ConversationHandle;
use crate::tidemark::view::{RestoredAnchor, TimelineSnapshot, ViewAnchor};
use crate::transport::{PaginationDirection, Transport};

/// Hard cap on a single fill, whatever the caller asks for.
pub const MAX_PAGINATION_LIMIT: usize = 100;

/// How a pagination request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationStatus {
    /// The fill ran to completion, possibly with zero new events.
    Completed,
    /// Another fill already held this conversation's guard. Not an error;
    /// the caller simply waits for the in-flight fill.
    AlreadyPaginating,
    /// No connectivity; nothing was requested.
    Offline,
    /// The transport call outlived the configured timeout.
    TimedOut,
    /// The transport call failed.
    Failed,
}

/// What one pagination request did.
#[derive(Debug, Clone, Serialize)]
pub struct PaginationOutcome {
    pub conversation_id: ConversationId,
    pub direction: PaginationDirection,
    pub status: PaginationStatus,
    /// Events actually added by the merge. Overlap with already-stored
    /// history is deduplicated and does not count.
    pub new_events: usize,
    /// True once the transport has reported the conversation start. Further
    /// backward requests complete without a transport call.
    pub reached_start: bool,
    /// Where the captured anchor landed in the rebuilt list. `None` when no
    /// anchor was supplied or the view did not change.
    pub restored_anchor: Option<RestoredAnchor>,
    /// Generation of the latest snapshot at completion.
    pub generation: u64,
}

pub(crate) struct PaginationRequest {
    pub(crate) direction: PaginationDirection,
    pub(crate) limit: usize,
    pub(crate) anchor: Option<ViewAnchor>,
}

/// Runs one fill against the conversation's pagination guard.
///
/// `Err` only on programming-contract violations from the merge (a
/// transport handing back events for another conversation); everything
/// transient is a `PaginationOutcome` status.
pub(crate) async fn run(
    handle: &Arc<ConversationHandle>,
    transport: &Arc<dyn Transport>,
    request: PaginationRequest,
    timeout: Duration,
) -> Result<PaginationOutcome> {
    let conversation_id = handle.conversation_id().clone();
    let direction = request.direction;
    let limit = request.limit.clamp(1, MAX_PAGINATION_LIMIT);

    if !transport.is_connected() {
        tracing::debug!(
            target: "tidemark::pagination",
            "Skipping pagination for {}: offline",
            conversation_id
        );
        return Ok(PaginationOutcome {
            conversation_id,
            direction,
            status: PaginationStatus::Offline,
            new_events: 0,
            reached_start: handle.start_reached().await,
            restored_anchor: None,
            generation: handle.current_snapshot().generation,
        });
    }

    let Some(context) = handle.try_begin_pagination(direction).await else {
        return Ok(PaginationOutcome {
            conversation_id,
            direction,
            status: PaginationStatus::AlreadyPaginating,
            new_events: 0,
            reached_start: handle.start_reached().await,
            restored_anchor: None,
            generation: handle.current_snapshot().generation,
        });
    };

    if direction == PaginationDirection::Backward && context.start_reached {
        handle.release_pagination().await;
        return Ok(PaginationOutcome {
            conversation_id,
            direction,
            status: PaginationStatus::Completed,
            new_events: 0,
            reached_start: true,
            restored_anchor: None,
            generation: handle.current_snapshot().generation,
        });
    }

    let fill = tokio::time::timeout(
        timeout,
        transport.paginate(&conversation_id, direction, context.cursor.as_ref(), limit),
    )
    .await;

    let batch = match fill {
        Err(_) => {
            handle.release_pagination().await;
            tracing::warn!(
                target: "tidemark::pagination",
                "Pagination for {} timed out after {:?}",
                conversation_id,
                timeout
            );
            return Ok(PaginationOutcome {
                conversation_id,
                direction,
                status: PaginationStatus::TimedOut,
                new_events: 0,
                reached_start: context.start_reached,
                restored_anchor: None,
                generation: handle.current_snapshot().generation,
            });
        }
        Ok(Err(error)) => {
            handle.release_pagination().await;
            tracing::warn!(
                target: "tidemark::pagination",
                "Pagination for {} failed: {}",
                conversation_id,
                error
            );
            return Ok(PaginationOutcome {
                conversation_id,
                direction,
                status: PaginationStatus::Failed,
                new_events: 0,
                reached_start: context.start_reached,
                restored_anchor: None,
                generation: handle.current_snapshot().generation,
            });
        }
        Ok(Ok(batch)) => batch,
    };

    let fetched = batch.events.len();
    let merge = handle
        .finish_pagination(direction, batch.events, batch.next_cursor)
        .await?;
    tracing::debug!(
        target: "tidemark::pagination",
        "Merged {} fetched event(s) into {}: {} new, {} duplicate(s)",
        fetched,
        conversation_id,
        merge.ingest.added,
        merge.ingest.duplicates
    );

    if !merge.ingest.changed() {
        // Pure overlap or exhaustion. Nothing was published, so any
        // captured anchor is still exactly where the consumer left it.
        return Ok(PaginationOutcome {
            conversation_id,
            direction,
            status: PaginationStatus::Completed,
            new_events: 0,
            reached_start: merge.start_reached,
            restored_anchor: None,
            generation: handle.current_snapshot().generation,
        });
    }

    // Resolves early, without a covering snapshot, if the timeline closes
    // mid-fill; the timeout bounds whatever remains.
    let snapshot = tokio::time::timeout(timeout, handle.wait_for_generation(merge.generation))
        .await
        .ok()
        .flatten();
    let restored_anchor = match (&snapshot, &request.anchor) {
        (Some(snapshot), Some(anchor)) => Some(restore_anchor(snapshot, anchor)),
        _ => None,
    };
    let generation = snapshot
        .map(|snapshot| snapshot.generation)
        .unwrap_or(merge.generation);

    Ok(PaginationOutcome {
        conversation_id,
        direction,
        status: PaginationStatus::Completed,
        new_events: merge.ingest.added,
        reached_start: merge.start_reached,
        restored_anchor,
        generation,
    })
}

/// Finds the anchored key in the rebuilt list. The offset is the
/// consumer's unit and passes through untouched; when the key is gone the
/// captured index is clamped into the new bounds instead.
fn restore_anchor(snapshot: &TimelineSnapshot, anchor: &ViewAnchor) -> RestoredAnchor {
    match snapshot.position_of(&anchor.key) {
        Some(index) => RestoredAnchor {
            index,
            offset: anchor.offset,
            exact: true,
        },
        None => RestoredAnchor {
            index: anchor.index.min(snapshot.len().saturating_sub(1)),
            offset: anchor.offset,
            exact: false,
        },
    }
}
