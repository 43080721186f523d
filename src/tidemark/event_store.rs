//! Append-only, deduplicated event set for a single conversation.
//!
//! The store accepts events from any source in any order and keeps exactly
//! one copy per identity. It never reorders anything internally; display
//! order is computed at read time so merging a pagination batch can never
//! corrupt previously observed order.

use std::collections::HashMap;

use serde::Serialize;

use crate::tidemark::error::{Result, TidemarkError};
use crate::tidemark::events::{
    ConversationId, Event, EventId, EventSource, StableKey, TransactionId,
};

/// What a single ingest call did to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestResult {
    /// Events stored for the first time.
    pub added: usize,
    /// Events dropped because their identity was already present.
    pub duplicates: usize,
    /// Local echoes whose identity migrated to a confirmed event id.
    pub promoted: usize,
}

impl IngestResult {
    /// True when the stored set changed and the view must be recomputed.
    pub fn changed(&self) -> bool {
        self.added > 0 || self.promoted > 0
    }
}

pub struct EventStore {
    conversation_id: ConversationId,
    events: HashMap<StableKey, Event>,
    /// Transaction ids already unified with a confirmed event. A late replay
    /// of the original echo must stay a no-op, so these are retained for the
    /// lifetime of the store.
    promotions: HashMap<TransactionId, EventId>,
}

impl EventStore {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            events: HashMap::new(),
            promotions: HashMap::new(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, key: &StableKey) -> Option<&Event> {
        self.events.get(key)
    }

    /// The confirmed identity a transaction id was promoted to, if any.
    pub fn promoted_event_id(&self, txn_id: &TransactionId) -> Option<&EventId> {
        self.promotions.get(txn_id)
    }

    /// Merges a batch into the store. Arrival order carries no meaning:
    /// ingesting the same events in any permutation, from any mix of
    /// sources, leaves the store in the same state.
    ///
    /// A confirmed event carrying the transaction id of a held local echo
    /// replaces that echo in place (identity migration, not duplication).
    /// Events for another conversation or without a usable identity (both
    /// ids missing, or either present but blank) are contract violations
    /// and fail the whole call before anything is stored.
    pub fn ingest(&mut self, events: Vec<Event>, source: EventSource) -> Result<IngestResult> {
        for event in &events {
            if event.conversation_id != self.conversation_id {
                return Err(TidemarkError::ConversationMismatch {
                    expected: self.conversation_id.clone(),
                    actual: event.conversation_id.clone(),
                });
            }
            let id_blank = event.id.as_ref().is_some_and(|id| id.as_str().is_empty());
            let txn_blank = event
                .txn_id
                .as_ref()
                .is_some_and(|txn| txn.as_str().is_empty());
            if (event.id.is_none() && event.txn_id.is_none()) || id_blank || txn_blank {
                return Err(TidemarkError::EventWithoutIdentity);
            }
        }

        let mut result = IngestResult::default();
        for event in events {
            if let Some(id) = event.id.clone() {
                self.ingest_confirmed(id, event, &mut result);
            } else if let Some(txn_id) = event.txn_id.clone() {
                self.ingest_echo(txn_id, event, &mut result);
            }
        }

        tracing::debug!(
            target: "tidemark::event_store",
            "Ingested batch for {} from {:?}: {} added, {} duplicates, {} promoted ({} total)",
            self.conversation_id,
            source,
            result.added,
            result.duplicates,
            result.promoted,
            self.events.len()
        );

        Ok(result)
    }

    fn ingest_confirmed(&mut self, id: EventId, event: Event, result: &mut IngestResult) {
        let key = StableKey::Event(id.clone());
        if self.events.contains_key(&key) {
            result.duplicates += 1;
            return;
        }

        if let Some(txn_id) = event.txn_id.clone() {
            let echo_key = StableKey::Transaction(txn_id.clone());
            let replaced_echo = self.events.remove(&echo_key).is_some();
            self.promotions.insert(txn_id, id);
            self.events.insert(key, event);
            if replaced_echo {
                result.promoted += 1;
            } else {
                // The confirmation arrived before (or instead of) the echo.
                // The promotion record still makes a late echo replay a no-op.
                result.added += 1;
            }
            return;
        }

        self.events.insert(key, event);
        result.added += 1;
    }

    fn ingest_echo(&mut self, txn_id: TransactionId, event: Event, result: &mut IngestResult) {
        if self.promotions.contains_key(&txn_id) {
            result.duplicates += 1;
            return;
        }
        let key = StableKey::Transaction(txn_id);
        if self.events.contains_key(&key) {
            result.duplicates += 1;
            return;
        }
        self.events.insert(key, event);
        result.added += 1;
    }

    /// All events in display order: timestamp first, identity string as the
    /// deterministic tie-break. Every stored event has a unique identity, so
    /// the order is total.
    pub fn ordered_events(&self) -> Vec<&Event> {
        let mut events: Vec<&Event> = self.events.values().collect();
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| sort_token(a).cmp(sort_token(b)))
        });
        events
    }

    /// Owned copy of the ordered events, for handing to the rebuild worker
    /// without holding the conversation lock.
    pub fn snapshot(&self) -> Vec<Event> {
        self.ordered_events().into_iter().cloned().collect()
    }
}

/// Tie-break token for events sharing a timestamp. Stored events always have
/// an identity, so the empty fallback never orders anything in practice.
fn sort_token(event: &Event) -> &str {
    if let Some(id) = &event.id {
        id.as_str()
    } else if let Some(txn_id) = &event.txn_id {
        txn_id.as_str()
    } else {
        ""
    }
}
