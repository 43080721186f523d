//! Materialized view construction.
//!
//! Turns one conversation's resolved events into the flat, render-ready
//! sequence the embedder displays: content items in display order,
//! interleaved with date dividers, each item carrying everything the
//! renderer needs. Builds run against an immutable snapshot, off the ingest
//! path, and replace the previous list wholesale; nothing is patched in
//! place.

mod types;

pub use types::{
    ContentItem, DisplayBody, DisplayItem, RestoredAnchor, TimelineFilter, TimelineSnapshot,
    ViewAnchor,
};

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};

use crate::tidemark::events::{ConversationId, Event, EventKind, Payload, UserId};
use crate::tidemark::profiles::ProfileDirectory;
use crate::tidemark::resolver::ResolvedIndex;

/// Controls date bucketing.
#[derive(Debug, Clone)]
pub struct ViewConfig {
    /// Offset used to assign events to calendar days. Fixed rather than the
    /// live device timezone so identical inputs always produce identical
    /// output.
    pub timezone_offset: FixedOffset,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            timezone_offset: Utc.fix(),
        }
    }
}

/// Builds the display sequence for one conversation from an immutable
/// snapshot of its events (in display order) and their resolved relations.
///
/// Given the same events, index and profile state, the output is identical
/// down to the byte regardless of how the events originally arrived.
pub fn build(
    events: &[Event],
    index: &ResolvedIndex,
    profiles: &ProfileDirectory,
    conversation_id: &ConversationId,
    filter: TimelineFilter,
    config: &ViewConfig,
) -> Vec<DisplayItem> {
    let mut items: Vec<DisplayItem> = Vec::new();
    let mut last_date: Option<NaiveDate> = None;
    let mut prev_sender: Option<&UserId> = None;
    let mut prev_overridden = false;

    for event in events {
        if !is_displayable(event, filter) {
            continue;
        }
        let Some(stable_key) = event.stable_key() else {
            continue;
        };

        let date = local_date(event.timestamp, config);
        let starts_new_day = last_date != Some(date);
        if starts_new_day {
            items.push(DisplayItem::DateDivider {
                date,
                label: divider_label(date),
            });
            last_date = Some(date);
        }

        let overridden = event.sender_override.is_some();
        let is_consecutive_with_previous = !starts_new_day
            && prev_sender == Some(&event.sender_id)
            && !overridden
            && !prev_overridden;

        let (body, is_edited) = effective_body(event, index);
        let (sender_name, sender_avatar) = resolve_sender(event, profiles, conversation_id);
        let reactions = event
            .id
            .as_ref()
            .and_then(|id| index.reactions_for(id))
            .cloned()
            .unwrap_or_default();
        let reply_to = event.relations.in_reply_to.clone().or_else(|| {
            event
                .relations
                .thread
                .as_ref()
                .and_then(|t| t.fallback_reply.clone())
        });
        let thread_root = event.relations.thread.as_ref().map(|t| t.root.clone());

        items.push(DisplayItem::Content(Box::new(ContentItem {
            stable_key,
            kind: event.kind(),
            sender_id: event.sender_id.clone(),
            sender_name,
            sender_avatar,
            timestamp: event.timestamp,
            body,
            reactions,
            reply_to,
            thread_root,
            is_consecutive_with_previous,
            has_identity_override: overridden,
            is_local_echo: event.is_local_echo(),
            is_edited,
        })));

        prev_sender = Some(&event.sender_id);
        prev_overridden = overridden;
    }

    items
}

/// Relation events and edits never display standalone; `MainOnly` also
/// drops thread replies. Tombstoned events stay displayable, they render as
/// a placeholder instead of disappearing.
fn is_displayable(event: &Event, filter: TimelineFilter) -> bool {
    if matches!(event.kind(), EventKind::Reaction | EventKind::Redaction) {
        return false;
    }
    if event.relations.replaces.is_some() {
        return false;
    }
    if filter == TimelineFilter::MainOnly && event.relations.thread.is_some() {
        return false;
    }
    true
}

fn local_date(timestamp: DateTime<Utc>, config: &ViewConfig) -> NaiveDate {
    timestamp.with_timezone(&config.timezone_offset).date_naive()
}

fn divider_label(date: NaiveDate) -> String {
    date.format("%B %-d, %Y").to_string()
}

/// The content a row actually renders: a tombstone beats everything, then
/// the winning edit, then the original payload.
fn effective_body(event: &Event, index: &ResolvedIndex) -> (DisplayBody, bool) {
    if let Some(tombstone) = event.id.as_ref().and_then(|id| index.tombstone_for(id)) {
        return (
            DisplayBody::Redacted {
                reason: tombstone.reason.clone(),
            },
            false,
        );
    }

    match &event.payload {
        Payload::Message { body } => {
            match event.id.as_ref().and_then(|id| index.edit_for(id)) {
                Some(edit) => (
                    DisplayBody::Message {
                        body: edit.body.clone(),
                    },
                    true,
                ),
                None => (
                    DisplayBody::Message { body: body.clone() },
                    false,
                ),
            }
        }
        Payload::MembershipChange { change, user_id } => (
            DisplayBody::Membership {
                change: *change,
                user_id: user_id.clone(),
            },
            false,
        ),
        Payload::NameChange { name } => (DisplayBody::NameChange { name: name.clone() }, false),
        Payload::TopicChange { topic } => (
            DisplayBody::TopicChange {
                topic: topic.clone(),
            },
            false,
        ),
        Payload::AvatarChange { url } => (DisplayBody::AvatarChange { url: url.clone() }, false),
        // Filtered out before this point.
        Payload::Reaction { .. } | Payload::Redaction { .. } => (DisplayBody::Unsupported, false),
        Payload::Unsupported => (DisplayBody::Unsupported, false),
    }
}

/// Identity override on the event wins, then the profile directory, then
/// the raw user id as the last resort.
fn resolve_sender(
    event: &Event,
    profiles: &ProfileDirectory,
    conversation_id: &ConversationId,
) -> (String, Option<String>) {
    if let Some(sender_override) = &event.sender_override {
        return (
            sender_override.display_name.clone(),
            sender_override.avatar_url.clone(),
        );
    }
    match profiles.get(&event.sender_id, Some(conversation_id)) {
        Some(profile) => {
            let name = profile
                .display_name
                .unwrap_or_else(|| event.sender_id.as_str().to_string());
            (name, profile.avatar_url)
        }
        None => (event.sender_id.as_str().to_string(), None),
    }
}
