//! Output types of the relation resolution pass.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tidemark::events::{EventId, StableKey, UserId};

/// Content replacement produced by the winning edit of an event.
#[derive(Debug, Clone, PartialEq)]
pub struct EditContent {
    /// The edit event that won the competition.
    pub source: StableKey,
    /// Replacement body.
    pub body: String,
    pub edited_at: DateTime<Utc>,
}

/// Removal marker produced by the winning (earliest) redaction of an event.
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub source: StableKey,
    pub reason: Option<String>,
    pub redacted_at: DateTime<Utc>,
}

/// One reaction key on one target with its distinct senders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub key: String,
    pub count: usize,
    /// Distinct senders, ordered by when each sender first reacted.
    pub senders: Vec<UserId>,
}

/// All reactions on one target. Group order is deterministic: first reaction
/// timestamp, then key, so rebuilding from the same events always serializes
/// identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionSummary {
    pub groups: Vec<ReactionGroup>,
}

impl ReactionSummary {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn total_count(&self) -> usize {
        self.groups.iter().map(|g| g.count).sum()
    }
}

/// Which relation a pending entry is waiting to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Edit,
    Redaction,
    Reaction,
    ThreadRoot,
}

/// A relation whose target has not been observed yet. Nothing retries these
/// individually: the next full pass over the store picks them up as soon as
/// the target arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRelation {
    pub source: StableKey,
    pub target: EventId,
    pub kind: RelationKind,
}

/// Effective display state of every event in one conversation, computed by a
/// single full pass over the store.
#[derive(Debug, Clone, Default)]
pub struct ResolvedIndex {
    pub(crate) edits: HashMap<EventId, EditContent>,
    pub(crate) tombstones: HashMap<EventId, Tombstone>,
    pub(crate) reactions: HashMap<EventId, ReactionSummary>,
    /// Thread root -> member keys in display order.
    pub(crate) thread_children: HashMap<EventId, Vec<StableKey>>,
    pub(crate) pending: Vec<PendingRelation>,
}

impl ResolvedIndex {
    /// The winning replacement for an event, if any edit applied.
    pub fn edit_for(&self, id: &EventId) -> Option<&EditContent> {
        self.edits.get(id)
    }

    /// The winning removal marker for an event. A tombstone always takes
    /// precedence over any edit of the same target.
    pub fn tombstone_for(&self, id: &EventId) -> Option<&Tombstone> {
        self.tombstones.get(id)
    }

    pub fn reactions_for(&self, id: &EventId) -> Option<&ReactionSummary> {
        self.reactions.get(id)
    }

    /// Members of a thread in display order, if the root is known.
    pub fn thread_members(&self, root: &EventId) -> Option<&[StableKey]> {
        self.thread_children.get(root).map(|v| v.as_slice())
    }

    /// Relations still waiting for their target.
    pub fn pending(&self) -> &[PendingRelation] {
        &self.pending
    }
}
