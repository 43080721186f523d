use thiserror::Error;

use crate::tidemark::events::ConversationId;

pub type Result<T> = core::result::Result<T, TidemarkError>;

/// Contract violations and infrastructure failures.
///
/// Transient conditions (offline transport, pagination timeouts) are not
/// errors; they travel inside [`crate::tidemark::pagination::PaginationOutcome`]
/// so callers keep a usable timeline either way. Data inconsistencies between
/// events never surface here at all, the resolver always reduces them to a
/// defined display state.
#[derive(Error, Debug)]
pub enum TidemarkError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Event carries no usable event id or transaction id")]
    EventWithoutIdentity,

    #[error("Event for conversation {actual} ingested into conversation {expected}")]
    ConversationMismatch {
        expected: ConversationId,
        actual: ConversationId,
    },

    #[error("Conversation {0} is not open")]
    ConversationNotOpen(ConversationId),

    #[error("Engine is shut down")]
    ShutDown,

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<Box<dyn std::error::Error + Send + Sync>> for TidemarkError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        TidemarkError::Other(anyhow::anyhow!(err.to_string()))
    }
}
