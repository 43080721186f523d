//! End-to-end tests for the reconciliation pipeline.
//!
//! These exercise the engine facade the way an embedder would: ingest from
//! several sources, subscribe to snapshots, paginate, and read the result,
//! without reaching into component internals.

#[cfg(test)]
mod integration_tests {
    use super::super::*;
    use crate::tidemark::test_utils::*;
    use crate::transport::{
        PaginationBatch, PaginationCursor, PaginationDirection, ProfilePayload,
    };
    use chrono::{TimeZone, Utc};

    fn conv(name: &str) -> ConversationId {
        ConversationId::new(name)
    }

    fn msg_in(conversation: &ConversationId, id: &str, sender: &str, at_secs: i64, body: &str) -> Event {
        Event {
            id: Some(EventId::new(id)),
            conversation_id: conversation.clone(),
            sender_id: UserId::new(sender),
            timestamp: Utc.timestamp_opt(at_secs, 0).unwrap(),
            payload: Payload::Message {
                body: body.to_string(),
            },
            relations: Relations::default(),
            sender_override: None,
            txn_id: None,
        }
    }

    fn edit_in(
        conversation: &ConversationId,
        id: &str,
        sender: &str,
        at_secs: i64,
        target: &str,
        body: &str,
    ) -> Event {
        let mut event = msg_in(conversation, id, sender, at_secs, body);
        event.relations.replaces = Some(EventId::new(target));
        event
    }

    fn reaction_in(
        conversation: &ConversationId,
        id: &str,
        sender: &str,
        at_secs: i64,
        target: &str,
        key: &str,
    ) -> Event {
        Event {
            payload: Payload::Reaction {
                target: EventId::new(target),
                key: key.to_string(),
            },
            ..msg_in(conversation, id, sender, at_secs, "")
        }
    }

    fn redaction_in(
        conversation: &ConversationId,
        id: &str,
        sender: &str,
        at_secs: i64,
        target: &str,
    ) -> Event {
        Event {
            payload: Payload::Redaction {
                target: EventId::new(target),
                reason: None,
            },
            ..msg_in(conversation, id, sender, at_secs, "")
        }
    }

    async fn snapshot_covering(
        subscription: &mut TimelineSubscription,
        generation: u64,
    ) -> TimelineSnapshot {
        let snapshot = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            subscription
                .updates
                .wait_for(|snapshot| snapshot.generation >= generation),
        )
        .await
        .expect("rebuild timed out")
        .expect("publisher dropped");
        snapshot.clone()
    }

    fn rendered(snapshot: &TimelineSnapshot) -> String {
        serde_json::to_string(&*snapshot.items).expect("items serialize")
    }

    #[tokio::test]
    async fn test_initialization_creates_directories() {
        let (engine, _transport, _data_temp, _logs_temp) = create_test_engine().await;
        assert!(engine.config.data_dir.exists());
        assert!(engine.config.logs_dir.exists());
    }

    #[test]
    fn test_config_appends_environment_suffix() {
        let data = std::path::Path::new("/tmp/tidemark-data");
        let logs = std::path::Path::new("/tmp/tidemark-logs");
        let config = TidemarkConfig::new(data, logs);

        // Tests build with debug assertions.
        assert!(config.data_dir.ends_with("dev"));
        assert!(config.logs_dir.ends_with("dev"));
        assert!(config.data_dir.starts_with(data));
        assert!(config.logs_dir.starts_with(logs));
    }

    #[tokio::test]
    async fn test_out_of_range_pagination_limit_is_rejected() {
        let (mut config, _data_temp, _logs_temp) = create_test_config();
        config.default_pagination_limit = 0;

        let transport = std::sync::Arc::new(crate::transport::mock::MockTransport::new());
        let result = Tidemark::new(config, transport).await;
        assert!(matches!(result, Err(TidemarkError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_debug_output_redacts_transport() {
        let (engine, _transport, _data_temp, _logs_temp) = create_test_engine().await;
        let debug = format!("{:?}", engine);
        assert!(debug.contains("Tidemark"));
        assert!(debug.contains("<REDACTED>"));
    }

    #[tokio::test]
    async fn test_reingesting_a_batch_changes_nothing() {
        let (engine, _transport, _data_temp, _logs_temp) = create_test_engine().await;
        let conversation = conv("idempotent");
        let mut subscription = engine.open_conversation(&conversation);

        let batch = vec![
            msg_in(&conversation, "m1", "@alice", 1000, "first"),
            msg_in(&conversation, "m2", "@alice", 1060, "second"),
        ];

        let report = engine
            .ingest(&conversation, batch.clone(), EventSource::Initial)
            .await
            .unwrap();
        let first = snapshot_covering(&mut subscription, report.generation).await;

        for _ in 0..3 {
            let report = engine
                .ingest(&conversation, batch.clone(), EventSource::Live)
                .await
                .unwrap();
            assert_eq!(report.added, 0);
            assert_eq!(report.duplicates, 2);
            assert_eq!(report.generation, first.generation);
        }

        let after = engine.current_snapshot(&conversation).unwrap();
        assert_eq!(rendered(&first), rendered(&after));
    }

    #[tokio::test]
    async fn test_ingest_order_does_not_change_the_rendered_timeline() {
        let conversation = conv("deterministic");
        let initial = vec![
            msg_in(&conversation, "m2", "@alice", 2000, "second"),
            msg_in(&conversation, "m3", "@bob", 3000, "third"),
        ];
        let live = vec![
            msg_in(&conversation, "m4", "@bob", 4000, "fourth"),
            edit_in(&conversation, "m2-edit", "@alice", 4500, "m2", "second, fixed"),
        ];
        let paged = vec![
            msg_in(&conversation, "m1", "@alice", 1000, "first"),
            reaction_in(&conversation, "r1", "@bob", 3500, "m3", "👍"),
        ];

        let (engine_a, _ta, _da, _la) = create_test_engine().await;
        let mut sub_a = engine_a.open_conversation(&conversation);
        engine_a
            .ingest(&conversation, initial.clone(), EventSource::Initial)
            .await
            .unwrap();
        engine_a
            .ingest(&conversation, live.clone(), EventSource::Live)
            .await
            .unwrap();
        let report_a = engine_a
            .ingest(&conversation, paged.clone(), EventSource::Pagination)
            .await
            .unwrap();
        let snapshot_a = snapshot_covering(&mut sub_a, report_a.generation).await;

        let (engine_b, _tb, _db, _lb) = create_test_engine().await;
        let mut sub_b = engine_b.open_conversation(&conversation);
        engine_b
            .ingest(&conversation, paged, EventSource::Pagination)
            .await
            .unwrap();
        engine_b
            .ingest(&conversation, live, EventSource::Live)
            .await
            .unwrap();
        let report_b = engine_b
            .ingest(&conversation, initial, EventSource::Initial)
            .await
            .unwrap();
        let snapshot_b = snapshot_covering(&mut sub_b, report_b.generation).await;

        assert_eq!(rendered(&snapshot_a), rendered(&snapshot_b));
    }

    #[tokio::test]
    async fn test_latest_edit_displays_and_redaction_beats_it() {
        let (engine, _transport, _data_temp, _logs_temp) = create_test_engine().await;
        let conversation = conv("edits");
        let mut subscription = engine.open_conversation(&conversation);

        let report = engine
            .ingest(
                &conversation,
                vec![
                    msg_in(&conversation, "e1", "@alice", 1000, "original"),
                    edit_in(&conversation, "a", "@alice", 1010, "e1", "first edit"),
                    edit_in(&conversation, "b", "@alice", 1020, "e1", "second edit"),
                ],
                EventSource::Initial,
            )
            .await
            .unwrap();
        let snapshot = snapshot_covering(&mut subscription, report.generation).await;

        let contents: Vec<_> = snapshot
            .items
            .iter()
            .filter_map(|item| item.as_content())
            .collect();
        assert_eq!(contents.len(), 1);
        assert_eq!(
            contents[0].body,
            DisplayBody::Message {
                body: "second edit".to_string()
            }
        );
        assert!(contents[0].is_edited);

        let report = engine
            .ingest(
                &conversation,
                vec![redaction_in(&conversation, "r", "@alice", 2000, "e1")],
                EventSource::Live,
            )
            .await
            .unwrap();
        let snapshot = snapshot_covering(&mut subscription, report.generation).await;
        let content = snapshot.items[1].as_content().unwrap();
        assert!(matches!(content.body, DisplayBody::Redacted { .. }));
    }

    #[tokio::test]
    async fn test_reactions_aggregate_across_distinct_senders() {
        let (engine, _transport, _data_temp, _logs_temp) = create_test_engine().await;
        let conversation = conv("reactions");
        let mut subscription = engine.open_conversation(&conversation);

        let report = engine
            .ingest(
                &conversation,
                vec![
                    msg_in(&conversation, "e1", "@alice", 1000, "react to me"),
                    reaction_in(&conversation, "r1", "@alice", 1010, "e1", "👍"),
                    reaction_in(&conversation, "r2", "@bob", 1020, "e1", "👍"),
                    reaction_in(&conversation, "r3", "@carol", 1030, "e1", "👍"),
                    // Same sender again, same key: no effect on the count.
                    reaction_in(&conversation, "r4", "@alice", 1040, "e1", "👍"),
                ],
                EventSource::Initial,
            )
            .await
            .unwrap();
        let snapshot = snapshot_covering(&mut subscription, report.generation).await;

        let content = snapshot.items[1].as_content().unwrap();
        assert_eq!(content.reactions.groups.len(), 1);
        assert_eq!(content.reactions.groups[0].key, "👍");
        assert_eq!(content.reactions.groups[0].count, 3);
    }

    #[tokio::test]
    async fn test_same_day_grouping_scenario() {
        let (engine, _transport, _data_temp, _logs_temp) = create_test_engine().await;
        let conversation = conv("grouping");
        let mut subscription = engine.open_conversation(&conversation);

        let report = engine
            .ingest(
                &conversation,
                vec![
                    msg_in(&conversation, "m1", "@alice", 1000, "one"),
                    msg_in(&conversation, "m2", "@alice", 1000, "two"),
                    msg_in(&conversation, "m3", "@bob", 2000, "three"),
                ],
                EventSource::Initial,
            )
            .await
            .unwrap();
        let snapshot = snapshot_covering(&mut subscription, report.generation).await;

        assert_eq!(snapshot.len(), 4);
        assert!(matches!(snapshot.items[0], DisplayItem::DateDivider { .. }));
        assert!(!snapshot.items[1].as_content().unwrap().is_consecutive_with_previous);
        assert!(snapshot.items[2].as_content().unwrap().is_consecutive_with_previous);
        assert!(!snapshot.items[3].as_content().unwrap().is_consecutive_with_previous);
    }

    #[tokio::test]
    async fn test_local_echo_confirms_into_one_item() {
        let (engine, _transport, _data_temp, _logs_temp) = create_test_engine().await;
        let conversation = conv("echo");
        let mut subscription = engine.open_conversation(&conversation);

        let txn = TransactionId::new("txn-42");
        let mut echo = msg_in(&conversation, "ignored", "@me", 1000, "optimistic");
        echo.id = None;
        echo.txn_id = Some(txn.clone());

        let report = engine
            .ingest(&conversation, vec![echo], EventSource::Live)
            .await
            .unwrap();
        let snapshot = snapshot_covering(&mut subscription, report.generation).await;
        let content = snapshot.items[1].as_content().unwrap();
        assert!(content.is_local_echo);
        assert_eq!(content.stable_key, StableKey::Transaction(txn.clone()));

        let mut confirmed = msg_in(&conversation, "server-1", "@me", 1000, "optimistic");
        confirmed.txn_id = Some(txn);
        let report = engine
            .ingest(&conversation, vec![confirmed], EventSource::Live)
            .await
            .unwrap();
        assert_eq!(report.promoted, 1);

        let snapshot = snapshot_covering(&mut subscription, report.generation).await;
        let contents: Vec<_> = snapshot
            .items
            .iter()
            .filter_map(|item| item.as_content())
            .collect();
        assert_eq!(contents.len(), 1);
        assert!(!contents[0].is_local_echo);
        assert_eq!(
            contents[0].stable_key,
            StableKey::Event(EventId::new("server-1"))
        );
    }

    #[tokio::test]
    async fn test_pagination_through_the_facade() {
        let (engine, transport, _data_temp, _logs_temp) = create_test_engine().await;
        let conversation = conv("paging");
        let mut subscription = engine.open_conversation(&conversation);

        let report = engine
            .ingest(
                &conversation,
                vec![msg_in(&conversation, "recent", "@alice", 5000, "latest")],
                EventSource::Initial,
            )
            .await
            .unwrap();
        snapshot_covering(&mut subscription, report.generation).await;

        transport.push_page(PaginationBatch {
            events: vec![msg_in(&conversation, "older", "@alice", 1000, "history")],
            next_cursor: Some(PaginationCursor::new("more")),
        });

        let outcome = engine
            .request_pagination(&conversation, PaginationDirection::Backward, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.status, PaginationStatus::Completed);
        assert_eq!(outcome.new_events, 1);
        assert!(!outcome.reached_start);

        let snapshot = snapshot_covering(&mut subscription, outcome.generation).await;
        let bodies: Vec<_> = snapshot
            .items
            .iter()
            .filter_map(|item| item.as_content())
            .map(|content| content.body.clone())
            .collect();
        assert_eq!(
            bodies,
            vec![
                DisplayBody::Message {
                    body: "history".to_string()
                },
                DisplayBody::Message {
                    body: "latest".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_pagination_for_unknown_conversation_is_an_error() {
        let (engine, _transport, _data_temp, _logs_temp) = create_test_engine().await;
        let result = engine
            .request_pagination(
                &conv("never-opened"),
                PaginationDirection::Backward,
                None,
                None,
            )
            .await;
        assert!(matches!(result, Err(TidemarkError::ConversationNotOpen(_))));
    }

    #[tokio::test]
    async fn test_eviction_during_pagination_does_not_strand_the_request() {
        let (engine, transport, _data_temp, _logs_temp) = create_test_engine().await;
        let conversation = conv("evicted-mid-fill");
        let mut subscription = engine.open_conversation(&conversation);

        let report = engine
            .ingest(
                &conversation,
                vec![msg_in(&conversation, "e1", "@alice", 5000, "recent")],
                EventSource::Initial,
            )
            .await
            .unwrap();
        snapshot_covering(&mut subscription, report.generation).await;

        transport.set_paginate_delay(std::time::Duration::from_millis(300));
        transport.push_page(PaginationBatch {
            events: vec![msg_in(&conversation, "e0", "@alice", 1000, "old")],
            next_cursor: None,
        });

        // Evict while the transport call is still in flight. The request
        // must resolve anyway; its worker is gone, so no snapshot covering
        // the merge will ever be published.
        let fill = async {
            tokio::time::timeout(
                std::time::Duration::from_secs(5),
                engine.request_pagination(&conversation, PaginationDirection::Backward, None, None),
            )
            .await
        };
        let evict = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            engine.close_conversation(&conversation);
            assert_eq!(engine.evict_closed(), 1);
        };
        let (outcome, ()) = tokio::join!(fill, evict);

        let outcome = outcome
            .expect("pagination must resolve after eviction")
            .unwrap();
        assert_eq!(outcome.status, PaginationStatus::Completed);
        assert_eq!(outcome.new_events, 1);
        assert!(outcome.restored_anchor.is_none());
    }

    #[tokio::test]
    async fn test_rebuild_worker_requests_missing_profiles() {
        let (engine, transport, _data_temp, _logs_temp) = create_test_engine().await;
        let conversation = conv("profiles");
        let mut subscription = engine.open_conversation(&conversation);

        transport.set_profile(
            UserId::new("@bob"),
            ProfilePayload {
                display_name: Some("Bob".to_string()),
                avatar_url: None,
            },
        );

        let report = engine
            .ingest(
                &conversation,
                vec![msg_in(&conversation, "m1", "@bob", 1000, "hello")],
                EventSource::Live,
            )
            .await
            .unwrap();
        snapshot_covering(&mut subscription, report.generation).await;

        // The worker fires the refresh after publishing; give it a moment.
        let mut resolved = None;
        for _ in 0..100 {
            if let Some(profile) = engine
                .profiles()
                .get(&UserId::new("@bob"), Some(&conversation))
            {
                resolved = Some(profile);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let profile = resolved.expect("profile refresh never landed");
        assert_eq!(profile.display_name.as_deref(), Some("Bob"));
        assert!(transport.profile_fetches() >= 1);

        // The next structural change renders with the refreshed name.
        let report = engine
            .ingest(
                &conversation,
                vec![msg_in(&conversation, "m2", "@bob", 1060, "again")],
                EventSource::Live,
            )
            .await
            .unwrap();
        let snapshot = snapshot_covering(&mut subscription, report.generation).await;
        assert_eq!(snapshot.items[2].as_content().unwrap().sender_name, "Bob");
    }

    #[tokio::test]
    async fn test_queued_batches_flow_through_the_pump() {
        let (engine, _transport, _data_temp, _logs_temp) = create_test_engine().await;
        let conversation = conv("queued");
        engine.open_conversation(&conversation);

        engine
            .queue_batch(EventBatch {
                conversation_id: conversation.clone(),
                source: EventSource::Live,
                events: vec![msg_in(&conversation, "m1", "@alice", 1000, "pumped")],
            })
            .await
            .unwrap();

        let mut seen = false;
        for _ in 0..100 {
            let stats = engine.timeline_statistics(&conversation).await.unwrap();
            if stats.event_count == 1 {
                seen = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(seen, "queued batch never reached the store");
    }

    #[tokio::test]
    async fn test_threaded_conversation_filtering() {
        let (engine, _transport, _data_temp, _logs_temp) = create_test_engine().await;
        let conversation = conv("threads");
        let mut subscription = engine.open_conversation(&conversation);

        let mut reply = msg_in(&conversation, "t1", "@bob", 2000, "thread reply");
        reply.relations.thread = Some(ThreadRelation {
            root: EventId::new("root"),
            fallback_reply: Some(EventId::new("root")),
        });

        let report = engine
            .ingest(
                &conversation,
                vec![msg_in(&conversation, "root", "@alice", 1000, "root"), reply],
                EventSource::Initial,
            )
            .await
            .unwrap();
        let snapshot = snapshot_covering(&mut subscription, report.generation).await;
        assert_eq!(
            snapshot.items.iter().filter(|i| i.as_content().is_some()).count(),
            2
        );

        engine
            .set_timeline_filter(&conversation, TimelineFilter::MainOnly)
            .await
            .unwrap();
        let snapshot = snapshot_covering(&mut subscription, report.generation + 1).await;
        assert_eq!(
            snapshot.items.iter().filter(|i| i.as_content().is_some()).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_close_then_evict_forgets_the_conversation() {
        let (engine, _transport, _data_temp, _logs_temp) = create_test_engine().await;
        let conversation = conv("evicted");
        engine.open_conversation(&conversation);
        engine
            .ingest(
                &conversation,
                vec![msg_in(&conversation, "m1", "@alice", 1000, "hi")],
                EventSource::Live,
            )
            .await
            .unwrap();

        // Open conversations survive eviction.
        assert_eq!(engine.evict_closed(), 0);
        assert!(engine.timeline_statistics(&conversation).await.is_ok());

        engine.close_conversation(&conversation);
        assert_eq!(engine.evict_closed(), 1);
        assert!(matches!(
            engine.timeline_statistics(&conversation).await,
            Err(TidemarkError::ConversationNotOpen(_))
        ));

        // Reopening starts a fresh timeline.
        let subscription = engine.open_conversation(&conversation);
        assert_eq!(subscription.current.len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (engine, _transport, _data_temp, _logs_temp) = create_test_engine().await;

        let result = engine.shutdown().await;
        assert!(result.is_ok());

        let result = engine.shutdown().await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_queue_batch_after_shutdown_fails_fast() {
        let (engine, _transport, _data_temp, _logs_temp) = create_test_engine().await;
        let conversation = conv("late-batch");

        engine.shutdown().await.unwrap();

        let result = engine
            .queue_batch(EventBatch {
                conversation_id: conversation.clone(),
                source: EventSource::Live,
                events: vec![msg_in(&conversation, "m1", "@alice", 1000, "late")],
            })
            .await;
        assert!(matches!(result, Err(TidemarkError::ShutDown)));

        // The rejected batch created no timeline behind the embedder's back.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(matches!(
            engine.timeline_statistics(&conversation).await,
            Err(TidemarkError::ConversationNotOpen(_))
        ));
    }
}
