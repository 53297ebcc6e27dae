mod helpers;

use std::sync::{Arc, Mutex};

use helpers::{plain_engine, MockAi, ScriptedChat};
use rhizome::ai::{AiError, Capability};
use rhizome::memory::catalog::{AutoCategorizeOptions, NewCategory};
use rhizome::memory::types::NewMemory;
use rhizome::{MemoryError, Rhizome};

async fn remember(engine: &Rhizome, memory: NewMemory) -> String {
    engine.store().store(memory).await.unwrap().memory.id
}

#[tokio::test]
async fn categories_file_memories_with_confidence() {
    let engine = plain_engine();
    let store = engine.store();

    let tech = store
        .create_category(NewCategory::new(" technology ").description("software and hardware"))
        .await
        .unwrap();
    assert_eq!(tech.name, "technology");
    assert_eq!(tech.confidence_threshold, 0.7);
    assert!(!tech.auto_generated);

    let databases = store
        .create_category(NewCategory::new("databases").parent(&tech.id).confidence_threshold(0.5))
        .await
        .unwrap();
    assert_eq!(databases.parent_id.as_deref(), Some(tech.id.as_str()));

    let err = store
        .create_category(NewCategory::new("Technology"))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)), "names are unique regardless of case");
    let err = store
        .create_category(NewCategory::new("orphan").parent("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::NotFound { kind: "category", .. }));

    let names: Vec<_> = store.categories().await.unwrap().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["databases", "technology"]);

    let id = remember(&engine, NewMemory::new("WAL mode lets readers run beside the writer")).await;
    store.categorize(&id, &tech.id, 0.6, None).await.unwrap();
    store
        .categorize(&id, &databases.id, 0.8, Some("mentions WAL".into()))
        .await
        .unwrap();
    // Same pair again replaces the earlier assignment.
    store.categorize(&id, &tech.id, 0.3, Some("  ".into())).await.unwrap();

    let filed = store.memory_categories(&id).await.unwrap();
    assert_eq!(filed.len(), 2);
    assert_eq!(filed[0].category.id, databases.id);
    assert_eq!(filed[0].reasoning.as_deref(), Some("mentions WAL"));
    assert_eq!(filed[1].confidence, 0.3);
    assert!(filed[1].reasoning.is_none());

    let err = store.categorize(&id, &tech.id, 1.5, None).await.unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
    let err = store.categorize(&id, "missing", 0.5, None).await.unwrap_err();
    assert!(matches!(err, MemoryError::NotFound { kind: "category", .. }));
    let err = store.categorize("missing", &tech.id, 0.5, None).await.unwrap_err();
    assert!(matches!(err, MemoryError::NotFound { kind: "memory", .. }));

    store.delete(&id).await.unwrap();
    let err = store.memory_categories(&id).await.unwrap_err();
    assert!(matches!(err, MemoryError::NotFound { kind: "memory", .. }));
    assert_eq!(store.categories().await.unwrap().len(), 2, "categories outlive their memories");
}

#[tokio::test]
async fn chat_suggestion_creates_then_reuses_category() {
    let prompts = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&prompts);
    let chat = ScriptedChat::new(move |prompt| {
        seen.lock().unwrap().push(prompt.to_string());
        Ok("CATEGORY: Databases\nCONFIDENCE: 0.9\nREASONING: storage engine internals".into())
    });
    let mocks = MockAi::new().with_chat(chat);
    let engine = mocks.engine();
    let store = engine.store();

    let first = remember(&engine, NewMemory::new("WAL mode lets readers run beside the writer")).await;
    let result = store
        .auto_categorize(&first, AutoCategorizeOptions::default())
        .await
        .unwrap();
    assert!(result.degraded.is_none());
    assert!(result.created_category);
    assert_eq!(result.suggested.as_deref(), Some("Databases"));
    let filed = result.categorization.expect("stored");
    assert!(filed.category.auto_generated);
    assert_eq!(filed.confidence, 0.9);
    assert_eq!(filed.reasoning.as_deref(), Some("storage engine internals"));

    let second = remember(&engine, NewMemory::new("checkpoint the log before backups")).await;
    let result = store
        .auto_categorize(&second, AutoCategorizeOptions::default())
        .await
        .unwrap();
    assert!(!result.created_category);
    assert_eq!(result.categorization.unwrap().category.id, filed.category.id);
    assert_eq!(store.categories().await.unwrap().len(), 1);

    let prompts = prompts.lock().unwrap();
    assert!(prompts[0].contains("(none yet)"));
    assert!(prompts[1].contains("- Databases"), "known categories are offered");
}

#[tokio::test]
async fn weak_or_unknown_suggestions_are_not_stored() {
    let mocks = MockAi::new().with_chat(ScriptedChat::always("CATEGORY: ops\nCONFIDENCE: 0.4"));
    let engine = mocks.engine();
    let store = engine.store();
    let id = remember(&engine, NewMemory::new("rotate the on-call schedule")).await;

    let result = store
        .auto_categorize(&id, AutoCategorizeOptions::default())
        .await
        .unwrap();
    assert!(result.categorization.is_none());
    assert_eq!(result.suggested.as_deref(), Some("ops"));
    assert_eq!(result.confidence, Some(0.4));
    assert!(store.categories().await.unwrap().is_empty());

    let no_create = AutoCategorizeOptions {
        auto_create: false,
        min_confidence: Some(0.2),
    };
    let result = store.auto_categorize(&id, no_create).await.unwrap();
    assert!(result.categorization.is_none());
    assert!(store.categories().await.unwrap().is_empty());

    let lenient = AutoCategorizeOptions {
        min_confidence: Some(0.3),
        ..AutoCategorizeOptions::default()
    };
    let result = store.auto_categorize(&id, lenient).await.unwrap();
    assert!(result.created_category);
    assert_eq!(store.memory_categories(&id).await.unwrap().len(), 1);

    let invalid = AutoCategorizeOptions {
        min_confidence: Some(2.0),
        ..AutoCategorizeOptions::default()
    };
    let err = store.auto_categorize(&id, invalid).await.unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
}

#[tokio::test]
async fn categorization_degrades_without_chat() {
    let engine = plain_engine();
    let id = remember(&engine, NewMemory::new("no model to ask")).await;
    let result = engine
        .store()
        .auto_categorize(&id, AutoCategorizeOptions::default())
        .await
        .unwrap();
    assert!(result.degraded.is_some());
    assert!(result.categorization.is_none());

    let failing = ScriptedChat::new(|_| {
        Err(AiError::Backend {
            capability: Capability::Chat,
            message: "model crashed".into(),
        })
    });
    let mocks = MockAi::new().with_chat(failing);
    let engine = mocks.engine();
    let id = remember(&engine, NewMemory::new("the model will fail")).await;
    let result = engine
        .store()
        .auto_categorize(&id, AutoCategorizeOptions::default())
        .await
        .unwrap();
    assert_eq!(
        result.degraded.as_deref(),
        Some("chat request failed; memory not categorized")
    );
    assert!(engine.store().categories().await.unwrap().is_empty());
}

#[tokio::test]
async fn domains_report_registered_and_used_names() {
    let engine = plain_engine();
    let store = engine.store();

    remember(&engine, NewMemory::new("alpha ops note").domain("ops").session("s1").importance(4)).await;
    remember(&engine, NewMemory::new("beta ops note").domain("ops").session("s2").importance(8)).await;
    let long = format!(
        "{}\n\n{}",
        "Survey design notes for the field study. ".repeat(25).trim_end(),
        "Sampling frames and response weights. ".repeat(25).trim_end()
    );
    let stored = store
        .store(NewMemory::new(long).domain("research").session("s1"))
        .await
        .unwrap();
    assert!(stored.chunk_count > 0);

    let registered = store
        .register_domain(" planning ", Some("quarterly plans".into()))
        .await
        .unwrap();
    assert_eq!(registered.name, "planning");
    assert!(registered.registered);
    assert_eq!(registered.stats.memories, 0);

    let ops = store.register_domain("ops", None).await.unwrap();
    assert!(ops.registered);
    assert_eq!(ops.stats.memories, 2);
    let ops = store
        .register_domain("ops", Some("operations".into()))
        .await
        .unwrap();
    assert_eq!(ops.description.as_deref(), Some("operations"));

    let domains = store.domains().await.unwrap();
    let names: Vec<_> = domains.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["ops", "planning", "research"]);

    let research = &domains[2];
    assert!(!research.registered);
    assert_eq!(research.stats.memories, 1, "chunks are not counted");

    let stats = store.domain_stats("ops").await.unwrap();
    assert_eq!(stats.memories, 2);
    assert_eq!(stats.sessions, 2);
    assert!((stats.average_importance - 6.0).abs() < 1e-9);
    assert!(stats.last_activity.is_some());

    let err = store.domain_stats("finance").await.unwrap_err();
    assert!(matches!(err, MemoryError::NotFound { kind: "domain", .. }));
    let err = store.register_domain("   ", None).await.unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
}
