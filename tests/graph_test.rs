mod helpers;

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use helpers::{plain_engine, MockAi, ScriptedChat};
use rhizome::ai::{AiError, Capability};
use rhizome::memory::relations::{DiscoverOptions, NewRelationship};
use rhizome::memory::types::{NewMemory, RelationshipType};
use rhizome::{MemoryError, Rhizome};

const SIMILAR_REPLY: &str = "TYPE: similar\nCONFIDENCE: 0.8\nREASONING: both describe the same fruit bowl";

async fn remember(engine: &Rhizome, content: &str) -> String {
    engine
        .store()
        .store(NewMemory::new(content))
        .await
        .unwrap()
        .memory
        .id
}

/// Memories sharing four of five words, so every pair clears the
/// similarity threshold.
async fn fruit_cluster(engine: &Rhizome, extras: &[&str]) -> Vec<String> {
    let mut ids = Vec::new();
    for extra in extras {
        ids.push(remember(engine, &format!("apple banana cherry date {extra}")).await);
    }
    ids
}

#[tokio::test]
async fn duplicate_create_updates_existing_edge() {
    let engine = plain_engine();
    let a = remember(&engine, "design doc").await;
    let b = remember(&engine, "implementation notes").await;

    let first = engine
        .graph()
        .create(NewRelationship::new(&a, &b, RelationshipType::References).strength(0.4))
        .await
        .unwrap();
    assert!(!first.existed);

    let second = engine
        .graph()
        .create(
            NewRelationship::new(&a, &b, RelationshipType::References)
                .strength(0.9)
                .context("cited twice"),
        )
        .await
        .unwrap();
    assert!(second.existed);
    assert_eq!(second.relationship.id, first.relationship.id);
    assert_eq!(second.relationship.strength, 0.9);
    assert_eq!(second.relationship.context.as_deref(), Some("cited twice"));

    // A different type is a different edge.
    engine
        .graph()
        .create(NewRelationship::new(&a, &b, RelationshipType::Expands))
        .await
        .unwrap();
    assert_eq!(engine.graph().for_memory(&a).await.unwrap().len(), 2);
}

#[tokio::test]
async fn create_rejects_bad_edges() {
    let engine = plain_engine();
    let a = remember(&engine, "lonely").await;

    let err = engine
        .graph()
        .create(NewRelationship::new(&a, &a, RelationshipType::Similar))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));

    let err = engine
        .graph()
        .create(NewRelationship::new(&a, "missing", RelationshipType::Similar))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::NotFound { kind: "memory", .. }));

    let b = remember(&engine, "other").await;
    let err = engine
        .graph()
        .create(NewRelationship::new(&a, &b, RelationshipType::Similar).strength(1.2))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
}

#[tokio::test]
async fn traverse_respects_depth() {
    let engine = plain_engine();
    let chain = [
        remember(&engine, "one").await,
        remember(&engine, "two").await,
        remember(&engine, "three").await,
        remember(&engine, "four").await,
    ];
    for pair in chain.windows(2) {
        engine
            .graph()
            .create(NewRelationship::new(&pair[0], &pair[1], RelationshipType::Causes))
            .await
            .unwrap();
    }

    let only_root = engine.graph().traverse(&chain[0], Some(0)).await.unwrap();
    assert_eq!(only_root.nodes.len(), 1);
    assert!(only_root.edges.is_empty());

    let near = engine.graph().traverse(&chain[0], Some(1)).await.unwrap();
    assert_eq!(near.nodes.len(), 2);
    assert_eq!(near.edges.len(), 1);

    // Edges are walked in both directions.
    let from_middle = engine.graph().traverse(&chain[2], Some(1)).await.unwrap();
    assert_eq!(from_middle.nodes.len(), 3);

    let full = engine.graph().traverse(&chain[0], None).await.unwrap();
    assert_eq!(full.nodes.len(), 3, "default depth is two hops");
    let last = full.nodes.iter().map(|n| n.distance).max().unwrap();
    assert_eq!(last, 2);

    let everything = engine.graph().traverse(&chain[0], Some(50)).await.unwrap();
    assert_eq!(everything.nodes.len(), 4);
    assert_eq!(everything.edges.len(), 3);
}

#[tokio::test]
async fn related_filters_and_remove_deletes() {
    let engine = plain_engine();
    let a = remember(&engine, "hub").await;
    let b = remember(&engine, "strong spoke").await;
    let c = remember(&engine, "weak spoke").await;
    let strong = engine
        .graph()
        .create(NewRelationship::new(&a, &b, RelationshipType::Enables).strength(0.9))
        .await
        .unwrap()
        .relationship;
    engine
        .graph()
        .create(NewRelationship::new(&c, &a, RelationshipType::Contradicts).strength(0.2))
        .await
        .unwrap();

    let related = engine.graph().related(&a, None, None, None).await.unwrap();
    assert_eq!(related.len(), 2);
    assert_eq!(related[0].memory.id, b);

    let enables = engine
        .graph()
        .related(&a, Some(RelationshipType::Enables), None, None)
        .await
        .unwrap();
    assert_eq!(enables.len(), 1);

    let strong_only = engine.graph().related(&a, None, Some(0.5), None).await.unwrap();
    assert_eq!(strong_only.len(), 1);
    assert_eq!(strong_only[0].memory.id, b);

    engine.graph().remove(&strong.id).await.unwrap();
    let err = engine.graph().remove(&strong.id).await.unwrap_err();
    assert!(matches!(err, MemoryError::NotFound { kind: "relationship", .. }));
    assert_eq!(engine.graph().related(&a, None, None, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn discover_persists_bounded_suggestions() {
    let mocks = MockAi::new().with_chat(
        ScriptedChat::always(SIMILAR_REPLY).with_delay(Duration::from_millis(40)),
    );
    let engine = mocks.engine();
    fruit_cluster(&engine, &["one", "two", "three", "four", "five", "six"]).await;
    remember(&engine, "quarterly zebra migration census").await;

    let result = engine
        .graph()
        .discover(
            DiscoverOptions {
                limit: 50,
                persist: true,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(result.degraded.is_none());
    assert!(!result.cancelled);
    assert_eq!(result.pairs_considered, 15, "every cluster pair, nothing else");
    assert_eq!(result.suggestions.len(), 15);

    let chat = mocks.chat.as_ref().unwrap();
    assert_eq!(chat.calls(), 15);
    assert!(chat.max_in_flight() <= 5, "bounded by discovery workers");
    assert!(chat.max_in_flight() > 1, "classifications overlap");

    for s in &result.suggestions {
        assert_eq!(s.relationship_type, RelationshipType::Similar);
        assert_eq!(s.confidence, 0.8);
        assert!(s.similarity >= 0.6);
        let id = s.relationship_id.as_deref().expect("persisted");
        let edges = engine.graph().for_memory(&s.source_id).await.unwrap();
        let edge = edges.iter().find(|e| e.id == id).unwrap();
        assert!(edge.auto_generated);
        assert_eq!(edge.strength, 0.8);
    }

    // Connected pairs are not offered again.
    let again = engine
        .graph()
        .discover(DiscoverOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.pairs_considered, 0);
    assert!(again.suggestions.is_empty());
}

#[tokio::test]
async fn discover_stops_at_limit_without_persisting() {
    let mocks = MockAi::new().with_chat(ScriptedChat::always(SIMILAR_REPLY));
    let engine = mocks.engine();
    let ids = fruit_cluster(&engine, &["one", "two", "three", "four", "five"]).await;

    let result = engine
        .graph()
        .discover(
            DiscoverOptions {
                limit: 3,
                persist: false,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.suggestions.len(), 3);
    assert!(result.suggestions.iter().all(|s| s.relationship_id.is_none()));
    for id in &ids {
        assert!(engine.graph().for_memory(id).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn failed_classifications_are_skipped() {
    let chat = ScriptedChat::new(|prompt| {
        if prompt.contains("fig") {
            Err(AiError::Backend {
                capability: Capability::Chat,
                message: "model crashed".into(),
            })
        } else if prompt.contains("grape") {
            Ok("TYPE: none".into())
        } else {
            Ok(SIMILAR_REPLY.into())
        }
    });
    let mocks = MockAi::new().with_chat(chat);
    let engine = mocks.engine();
    fruit_cluster(&engine, &["kiwi", "lime", "fig", "grape"]).await;

    let result = engine
        .graph()
        .discover(DiscoverOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.pairs_considered, 6);
    // Only kiwi/lime avoids both the failing and the declining memory.
    assert_eq!(result.suggestions.len(), 1);
    assert!(!result.cancelled);
}

#[tokio::test]
async fn discover_without_chat_is_degraded() {
    let mocks = MockAi::new();
    let engine = mocks.engine();
    fruit_cluster(&engine, &["one", "two"]).await;

    let result = engine
        .graph()
        .discover(DiscoverOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.degraded.is_some());
    assert!(result.suggestions.is_empty());

    let err = engine
        .graph()
        .discover(
            DiscoverOptions {
                limit: 0,
                persist: false,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
}

#[tokio::test]
async fn cancellation_returns_promptly() {
    let mocks = MockAi::new().with_chat(
        ScriptedChat::always(SIMILAR_REPLY).with_delay(Duration::from_secs(5)),
    );
    let engine = mocks.engine();
    fruit_cluster(&engine, &["one", "two", "three", "four"]).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = engine
        .graph()
        .discover(DiscoverOptions::default(), &cancel)
        .await
        .unwrap();
    assert!(result.cancelled);
    assert!(result.suggestions.is_empty());
    assert!(started.elapsed() < Duration::from_secs(1));
}
