//! Reaction aggregation.
//!
//! Reactions group by (target, key) and count distinct senders. A sender
//! repeating the same key on the same target counts once. Retracted
//! reactions never reach the accumulator (the caller checks tombstones), so
//! a retraction decrements simply by being absent from the next pass.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::types::{ReactionGroup, ReactionSummary};
use crate::tidemark::events::{EventId, UserId};

#[derive(Default)]
pub(super) struct ReactionAccumulator {
    per_target: HashMap<EventId, Vec<GroupAccum>>,
}

struct GroupAccum {
    key: String,
    /// Earliest (timestamp, identity) seen for the group, for deterministic
    /// group ordering.
    first_reaction: (DateTime<Utc>, String),
    senders: Vec<SenderEntry>,
    seen: HashSet<UserId>,
}

struct SenderEntry {
    user_id: UserId,
    at: DateTime<Utc>,
    token: String,
}

impl ReactionAccumulator {
    /// Records one valid reaction event. `token` is the reacting event's
    /// identity string, used only to break timestamp ties deterministically.
    pub(super) fn record(
        &mut self,
        target: &EventId,
        key: &str,
        sender: &UserId,
        at: DateTime<Utc>,
        token: &str,
    ) {
        let groups = self.per_target.entry(target.clone()).or_default();
        let pos = match groups.iter().position(|g| g.key == key) {
            Some(pos) => pos,
            None => {
                groups.push(GroupAccum {
                    key: key.to_string(),
                    first_reaction: (at, token.to_string()),
                    senders: Vec::new(),
                    seen: HashSet::new(),
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[pos];

        if is_earlier(at, token, &group.first_reaction) {
            group.first_reaction = (at, token.to_string());
        }

        if group.seen.insert(sender.clone()) {
            group.senders.push(SenderEntry {
                user_id: sender.clone(),
                at,
                token: token.to_string(),
            });
        } else if let Some(entry) = group.senders.iter_mut().find(|e| &e.user_id == sender) {
            // Repeat reaction with the same key counts once; keep the
            // sender's earliest occurrence for ordering.
            if is_earlier(at, token, &(entry.at, entry.token.clone())) {
                entry.at = at;
                entry.token = token.to_string();
            }
        }
    }

    /// Finalizes the aggregation with deterministic ordering: groups by
    /// first-reaction instant then key, senders by when each first reacted.
    pub(super) fn finish(self) -> HashMap<EventId, ReactionSummary> {
        self.per_target
            .into_iter()
            .map(|(target, mut groups)| {
                groups.sort_by(|a, b| {
                    a.first_reaction
                        .0
                        .cmp(&b.first_reaction.0)
                        .then_with(|| a.first_reaction.1.cmp(&b.first_reaction.1))
                        .then_with(|| a.key.cmp(&b.key))
                });
                let summary = ReactionSummary {
                    groups: groups
                        .into_iter()
                        .map(|mut g| {
                            g.senders.sort_by(|a, b| {
                                a.at.cmp(&b.at).then_with(|| a.token.cmp(&b.token))
                            });
                            ReactionGroup {
                                key: g.key,
                                count: g.senders.len(),
                                senders: g.senders.into_iter().map(|e| e.user_id).collect(),
                            }
                        })
                        .collect(),
                };
                (target, summary)
            })
            .collect()
    }
}

fn is_earlier(at: DateTime<Utc>, token: &str, current: &(DateTime<Utc>, String)) -> bool {
    at < current.0 || (at == current.0 && token < current.1.as_str())
}
