//! Render-ready timeline types.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::tidemark::events::{EventId, EventKind, MembershipChange, StableKey, UserId};
use crate::tidemark::resolver::ReactionSummary;

/// Which events the materialized view includes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineFilter {
    /// Everything displayable, thread replies interleaved in the flat
    /// sequence.
    #[default]
    Flat,
    /// Thread replies suppressed; their roots still display.
    MainOnly,
}

/// Resolved content of a content item, after edits and redactions applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayBody {
    /// A message with its effective (possibly edited) text.
    Message { body: String },
    /// The event was removed; render a placeholder.
    Redacted { reason: Option<String> },
    Membership {
        change: MembershipChange,
        user_id: UserId,
    },
    NameChange { name: String },
    TopicChange { topic: String },
    AvatarChange { url: Option<String> },
    /// Recognized event whose content the client cannot interpret.
    Unsupported,
}

/// One renderable row of a conversation timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "item", rename_all = "snake_case")]
pub enum DisplayItem {
    DateDivider { date: NaiveDate, label: String },
    Content(Box<ContentItem>),
}

impl DisplayItem {
    /// Identity this row keeps across rebuilds.
    pub fn stable_key(&self) -> StableKey {
        match self {
            DisplayItem::DateDivider { date, .. } => StableKey::DateDivider(*date),
            DisplayItem::Content(item) => item.stable_key.clone(),
        }
    }

    pub fn as_content(&self) -> Option<&ContentItem> {
        match self {
            DisplayItem::Content(item) => Some(item),
            DisplayItem::DateDivider { .. } => None,
        }
    }
}

/// A rendered event. Recomputed wholesale on every rebuild; `stable_key` is
/// the only identity that survives, which is what external diffing keys on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub stable_key: StableKey,
    pub kind: EventKind,
    pub sender_id: UserId,
    /// Resolved at build time from the event's identity override or the
    /// profile directory, falling back to the raw user id.
    pub sender_name: String,
    pub sender_avatar: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub body: DisplayBody,
    #[serde(default, skip_serializing_if = "ReactionSummary::is_empty")]
    pub reactions: ReactionSummary,
    /// Explicit reply target, or the thread fallback reply for clients that
    /// render threads flat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_root: Option<EventId>,
    /// Same sender as the previous content item, no divider between, and no
    /// identity override on either side. Lets the renderer group runs.
    pub is_consecutive_with_previous: bool,
    pub has_identity_override: bool,
    pub is_local_echo: bool,
    pub is_edited: bool,
}

/// A complete, atomically published timeline. Consumers only ever observe
/// whole snapshots, never a half-rebuilt list.
#[derive(Debug, Clone)]
pub struct TimelineSnapshot {
    /// Monotonic per conversation, bumped on every publish. Consumers use it
    /// to detect that the view was rebuilt since they last anchored.
    pub generation: u64,
    pub items: Arc<Vec<DisplayItem>>,
}

impl TimelineSnapshot {
    pub fn empty() -> Self {
        Self {
            generation: 0,
            items: Arc::new(Vec::new()),
        }
    }

    /// Index of the item carrying `key`, if it is still in the list.
    pub fn position_of(&self, key: &StableKey) -> Option<usize> {
        self.items.iter().position(|item| &item.stable_key() == key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Scroll position captured by the consumer before a pagination request.
/// `offset` is in whatever unit the consumer measures (pixels, rows); the
/// engine passes it through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewAnchor {
    pub key: StableKey,
    /// Index of the anchored item when it was captured, used as the clamp
    /// fallback if the key disappears.
    pub index: usize,
    pub offset: f64,
}

/// Where the anchored item ended up after a merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoredAnchor {
    pub index: usize,
    pub offset: f64,
    /// False when the anchored key disappeared and the captured index was
    /// clamped into the new bounds instead.
    pub exact: bool,
}
