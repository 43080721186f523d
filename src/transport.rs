//! Boundary to the network layer.
//!
//! The engine never touches the wire itself. Everything it needs from the
//! network (history pages, connectivity, participant metadata) comes through
//! the [`Transport`] trait, injected at construction. Transport failures are
//! treated as transient by the callers: pagination reports them as flags on
//! the outcome and profile refreshes just log and move on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tidemark::error::Result;
use crate::tidemark::events::{ConversationId, Event, UserId};

/// Direction of a history fill relative to the visible timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationDirection {
    /// Toward the conversation start. The primary direction.
    Backward,
    /// Toward the live edge, for consumers that jumped into history.
    Forward,
}

/// Continuation token for a history fill. Opaque to the engine; only the
/// transport interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaginationCursor(String);

impl PaginationCursor {
    pub fn new(cursor: impl Into<String>) -> Self {
        Self(cursor.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PaginationCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One page of history returned by the transport.
#[derive(Debug, Clone)]
pub struct PaginationBatch {
    pub events: Vec<Event>,
    /// Cursor for the next page in the same direction. `None` means the
    /// conversation start (or the live edge, going forward) was reached.
    pub next_cursor: Option<PaginationCursor>,
}

/// Participant metadata as the transport fetched it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePayload {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Cheap connectivity check, consulted before any network work is
    /// queued.
    fn is_connected(&self) -> bool;

    /// Fetches one page of history for a conversation.
    async fn paginate(
        &self,
        conversation_id: &ConversationId,
        direction: PaginationDirection,
        cursor: Option<&PaginationCursor>,
        limit: usize,
    ) -> Result<PaginationBatch>;

    /// Fetches current metadata for one participant. A per-conversation
    /// profile may differ from the participant's global one.
    async fn fetch_profile(
        &self,
        user_id: &UserId,
        conversation_id: Option<&ConversationId>,
    ) -> Result<ProfilePayload>;
}
