//! Relation resolution.
//!
//! A full pass over one conversation's events computes every event's
//! effective display state: replaced by which edit, removed by which
//! redaction, which reactions stand, which thread each reply belongs to.
//! Because the pass always covers the whole store, a relation whose target
//! was unknown last time resolves by itself on the first pass after the
//! target arrives; no retry state is tracked between passes.

mod reactions;
mod types;

pub use types::{
    EditContent, PendingRelation, ReactionGroup, ReactionSummary, RelationKind, ResolvedIndex,
    Tombstone,
};

use std::collections::HashSet;

use reactions::ReactionAccumulator;

use crate::tidemark::events::{Event, EventId, EventKind, Payload};

/// Resolves relations across `events`, which must already be in display
/// order (the event store's `ordered_events` / `snapshot` output).
pub fn resolve(events: &[Event]) -> ResolvedIndex {
    let known: HashSet<&EventId> = events.iter().filter_map(|e| e.id.as_ref()).collect();

    let mut index = ResolvedIndex::default();
    apply_redactions(events, &known, &mut index);
    apply_edits(events, &known, &mut index);
    apply_reactions(events, &known, &mut index);
    apply_threads(events, &known, &mut index);

    if !index.pending.is_empty() {
        tracing::debug!(
            target: "tidemark::resolver",
            "{} relation(s) waiting for their target",
            index.pending.len()
        );
    }

    index
}

/// Pass 1: redactions. The earliest redaction of a target wins; later
/// redactions of the same target are tolerated no-ops. Redactions apply to
/// any target kind, including reaction events (retraction) and edit events
/// (removing an edit from the competition). Redacting a redaction changes
/// nothing: the tombstone it produced stands.
fn apply_redactions(events: &[Event], known: &HashSet<&EventId>, index: &mut ResolvedIndex) {
    for event in events {
        let Payload::Redaction { target, reason } = &event.payload else {
            continue;
        };
        let Some(source) = event.stable_key() else {
            continue;
        };
        if !known.contains(target) {
            index.pending.push(PendingRelation {
                source,
                target: target.clone(),
                kind: RelationKind::Redaction,
            });
            continue;
        }
        // Events arrive in display order, so the first insert per target is
        // the earliest redaction.
        index
            .tombstones
            .entry(target.clone())
            .or_insert_with(|| Tombstone {
                source,
                reason: reason.clone(),
                redacted_at: event.timestamp,
            });
    }
}

/// Pass 2: edits. Candidates are message events carrying a replace
/// relation; a candidate that is itself tombstoned never competes. Walking
/// in display order makes the last surviving candidate the latest edit, so
/// it wins (identical timestamps fall back to the identity tie-break the
/// ordering already applied).
fn apply_edits(events: &[Event], known: &HashSet<&EventId>, index: &mut ResolvedIndex) {
    for event in events {
        let Some(target) = event.relations.replaces.as_ref() else {
            continue;
        };
        let Payload::Message { body } = &event.payload else {
            continue;
        };
        let Some(source) = event.stable_key() else {
            continue;
        };
        if is_tombstoned(index, event) {
            continue;
        }
        if !known.contains(target) {
            index.pending.push(PendingRelation {
                source,
                target: target.clone(),
                kind: RelationKind::Edit,
            });
            continue;
        }
        index.edits.insert(
            target.clone(),
            EditContent {
                source,
                body: body.clone(),
                edited_at: event.timestamp,
            },
        );
    }
}

/// Pass 3: reactions. Tombstoned reaction events are skipped, which is what
/// makes a retraction decrement the aggregate.
fn apply_reactions(events: &[Event], known: &HashSet<&EventId>, index: &mut ResolvedIndex) {
    let mut accum = ReactionAccumulator::default();
    for event in events {
        let Payload::Reaction { target, key } = &event.payload else {
            continue;
        };
        if is_tombstoned(index, event) {
            continue;
        }
        let Some(source) = event.stable_key() else {
            continue;
        };
        if !known.contains(target) {
            index.pending.push(PendingRelation {
                source,
                target: target.clone(),
                kind: RelationKind::Reaction,
            });
            continue;
        }
        accum.record(
            target,
            key,
            &event.sender_id,
            event.timestamp,
            source.tie_break(),
        );
    }
    index.reactions = accum.finish();
}

/// Pass 4: thread membership. Relation events and edits never count as
/// thread members (they are not displayable). A reply whose root is unknown
/// still displays in the flat sequence; it just cannot be grouped under a
/// root until the root arrives.
fn apply_threads(events: &[Event], known: &HashSet<&EventId>, index: &mut ResolvedIndex) {
    for event in events {
        let Some(thread) = event.relations.thread.as_ref() else {
            continue;
        };
        if matches!(event.kind(), EventKind::Reaction | EventKind::Redaction)
            || event.relations.replaces.is_some()
        {
            continue;
        }
        let Some(source) = event.stable_key() else {
            continue;
        };
        if !known.contains(&thread.root) {
            index.pending.push(PendingRelation {
                source,
                target: thread.root.clone(),
                kind: RelationKind::ThreadRoot,
            });
            continue;
        }
        index
            .thread_children
            .entry(thread.root.clone())
            .or_default()
            .push(source);
    }
}

fn is_tombstoned(index: &ResolvedIndex, event: &Event) -> bool {
    event
        .id
        .as_ref()
        .is_some_and(|id| index.tombstones.contains_key(id))
}
