//! Core protocol event model.
//!
//! Events arrive from the transport already decrypted and are parsed into a
//! typed payload exactly once, at ingest. Everything downstream (the event
//! store, the relation resolver, the view builder) works from these types and
//! never re-inspects raw protocol JSON.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a conversation (room, group, DM) across the whole engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned event identifier, unique within a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-assigned identifier for a locally created event that has not been
/// acknowledged by the server yet. The confirmed counterpart arrives carrying
/// the same transaction id, which is how the two identities are unified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh transaction id for a new local echo.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity a display item keeps across rebuilds, used by the embedder to
/// diff one published timeline against the next.
///
/// A local echo starts life keyed by its transaction id and migrates to its
/// event id when the confirmation arrives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StableKey {
    Event(EventId),
    Transaction(TransactionId),
    DateDivider(NaiveDate),
}

impl StableKey {
    /// Lexicographic tie-break token for events sharing a timestamp.
    pub fn tie_break(&self) -> &str {
        match self {
            StableKey::Event(id) => id.as_str(),
            StableKey::Transaction(txn) => txn.as_str(),
            StableKey::DateDivider(_) => "",
        }
    }
}

impl std::fmt::Display for StableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StableKey::Event(id) => write!(f, "{}", id),
            StableKey::Transaction(txn) => write!(f, "{}", txn),
            StableKey::DateDivider(date) => write!(f, "divider:{}", date),
        }
    }
}

/// Which path a batch of events took into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// The first fetch when a conversation is opened.
    Initial,
    /// Pushed over the live connection while the conversation is open.
    Live,
    /// Returned by an explicit pagination request.
    Pagination,
}

/// Event kind as the view builder classifies it. Derived from the payload,
/// never trusted from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    MembershipChange,
    NameChange,
    TopicChange,
    AvatarChange,
    Reaction,
    Redaction,
    Unsupported,
}

/// What happened to a member in a membership-change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipChange {
    Joined,
    Left,
    Invited,
    Kicked,
    Banned,
}

/// Typed event content. Malformed or partial wire content is parsed to
/// [`Payload::Unsupported`] at the boundary; it degrades to an empty-body
/// placeholder downstream instead of failing ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Message {
        body: String,
    },
    MembershipChange {
        change: MembershipChange,
        user_id: UserId,
    },
    NameChange {
        name: String,
    },
    TopicChange {
        topic: String,
    },
    AvatarChange {
        url: Option<String>,
    },
    Reaction {
        target: EventId,
        key: String,
    },
    Redaction {
        target: EventId,
        reason: Option<String>,
    },
    Unsupported,
}

impl Payload {
    pub fn kind(&self) -> EventKind {
        match self {
            Payload::Message { .. } => EventKind::Message,
            Payload::MembershipChange { .. } => EventKind::MembershipChange,
            Payload::NameChange { .. } => EventKind::NameChange,
            Payload::TopicChange { .. } => EventKind::TopicChange,
            Payload::AvatarChange { .. } => EventKind::AvatarChange,
            Payload::Reaction { .. } => EventKind::Reaction,
            Payload::Redaction { .. } => EventKind::Redaction,
            Payload::Unsupported => EventKind::Unsupported,
        }
    }
}

/// Thread relation carried by an event: the thread root plus the reply
/// target older clients should fall back to when they cannot render threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRelation {
    pub root: EventId,
    pub fallback_reply: Option<EventId>,
}

/// References an event makes to other events in the same conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relations {
    /// Target of an edit. An event carrying this replaces the target's
    /// content and is itself never displayed standalone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<EventId>,

    /// Thread this event replies into, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadRelation>,

    /// Explicit reply target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<EventId>,
}

/// A sender displaying under a different identity for a single event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderOverride {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// A single protocol event, immutable once ingested.
///
/// At least one of `id` and `txn_id` is always present: a confirmed event
/// carries `id` (and `txn_id` too when it confirms a local echo), an
/// unacknowledged local echo carries only `txn_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Server (or local, for echoes) origin timestamp. Drives display order;
    /// carries no causality guarantee.
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
    #[serde(default)]
    pub relations: Relations,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_override: Option<SenderOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<TransactionId>,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// The key this event is stored and displayed under. The server identity
    /// wins as soon as it exists.
    pub fn stable_key(&self) -> Option<StableKey> {
        if let Some(id) = &self.id {
            Some(StableKey::Event(id.clone()))
        } else {
            self.txn_id.clone().map(StableKey::Transaction)
        }
    }

    /// True while this event only exists locally.
    pub fn is_local_echo(&self) -> bool {
        self.id.is_none()
    }
}

/// A batch of events queued for ingestion, tagged with where it came from.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub conversation_id: ConversationId,
    pub source: EventSource,
    pub events: Vec<Event>,
}
