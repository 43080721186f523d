//! Participant profile directory.
//!
//! A best-effort cache of display metadata (name, avatar) consulted while
//! building timelines. Lookups never block. Refreshes are fire-and-forget
//! network fetches with last-write-wins insertion; nothing waits on them,
//! whichever rebuild runs next simply reads the fresher cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::tidemark::events::{ConversationId, UserId};
use crate::transport::Transport;

/// Cached display metadata for one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProfileKey {
    user_id: UserId,
    /// `None` is the participant's global profile, `Some` a per-conversation
    /// override.
    scope: Option<ConversationId>,
}

pub struct ProfileDirectory {
    transport: Arc<dyn Transport>,
    entries: DashMap<ProfileKey, Profile>,
    /// When a refresh for a key last started. Doubles as the in-flight
    /// guard: another request inside the cooldown window is dropped.
    attempts: DashMap<ProfileKey, Instant>,
    cooldown: Duration,
}

impl ProfileDirectory {
    pub fn new(transport: Arc<dyn Transport>, cooldown: Duration) -> Self {
        Self {
            transport,
            entries: DashMap::new(),
            attempts: DashMap::new(),
            cooldown,
        }
    }

    /// Non-blocking lookup. The conversation-scoped profile wins over the
    /// participant's global one.
    pub fn get(
        &self,
        user_id: &UserId,
        conversation_id: Option<&ConversationId>,
    ) -> Option<Profile> {
        if let Some(conversation_id) = conversation_id {
            let scoped = ProfileKey {
                user_id: user_id.clone(),
                scope: Some(conversation_id.clone()),
            };
            if let Some(profile) = self.entries.get(&scoped) {
                return Some(profile.clone());
            }
        }
        let global = ProfileKey {
            user_id: user_id.clone(),
            scope: None,
        };
        self.entries.get(&global).map(|profile| profile.clone())
    }

    /// Inserts metadata. Whichever write carries the newest `updated_at`
    /// wins; an older concurrent write is dropped.
    pub fn insert(&self, profile: Profile, scope: Option<ConversationId>) {
        let key = ProfileKey {
            user_id: profile.user_id.clone(),
            scope,
        };
        match self.entries.entry(key) {
            Entry::Occupied(mut existing) => {
                if profile.updated_at >= existing.get().updated_at {
                    existing.insert(profile);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(profile);
            }
        }
    }

    /// Queues a background refresh unless one started within the cooldown
    /// window. Fire-and-forget: failures are logged and dropped, and no
    /// completion is signalled. Must be called from within the runtime.
    pub fn request_refresh(
        self: Arc<Self>,
        user_id: UserId,
        conversation_id: Option<ConversationId>,
    ) {
        let key = ProfileKey {
            user_id: user_id.clone(),
            scope: conversation_id.clone(),
        };
        let now = Instant::now();
        let should_spawn = match self.attempts.entry(key) {
            Entry::Occupied(mut attempt) => {
                if now.duration_since(*attempt.get()) >= self.cooldown {
                    attempt.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        };
        if !should_spawn {
            return;
        }

        tokio::spawn(async move {
            tracing::debug!(
                target: "tidemark::profiles",
                "Refreshing profile for {} (scope: {:?})",
                user_id,
                conversation_id
            );
            match self
                .transport
                .fetch_profile(&user_id, conversation_id.as_ref())
                .await
            {
                Ok(payload) => {
                    self.insert(
                        Profile {
                            user_id,
                            display_name: payload.display_name,
                            avatar_url: payload.avatar_url,
                            updated_at: Utc::now(),
                        },
                        conversation_id,
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        target: "tidemark::profiles",
                        "Profile refresh failed for {}: {}",
                        user_id,
                        e
                    );
                }
            }
        });
    }

    /// Drops every cached profile and refresh record.
    pub fn clear(&self) {
        self.entries.clear();
        self.attempts.clear();
        tracing::debug!(target: "tidemark::profiles", "Profile directory cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ProfileDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileDirectory")
            .field("entries", &self.entries.len())
            .field("cooldown", &self.cooldown)
            .field("transport", &"<REDACTED>")
            .finish()
    }
}
