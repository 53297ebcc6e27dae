mod helpers;

use helpers::{plain_engine, test_config};
use rhizome::db;
use rhizome::memory::relations::NewRelationship;
use rhizome::memory::search::SearchOptions;
use rhizome::memory::types::{ListOptions, ListOrder, MemoryFilter, NewMemory, RelationshipType};
use rhizome::{Rhizome, RhizomeConfig};

fn on_disk_config(dir: &std::path::Path) -> RhizomeConfig {
    let mut config = test_config();
    config.storage.db_path = dir.join("data").join("memory.db").display().to_string();
    config.storage.reader_connections = 2;
    config.embedding.enabled = false;
    config.vector.enabled = false;
    config.chat.enabled = false;
    config
}

#[tokio::test]
async fn memories_survive_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let config = on_disk_config(tmp.path());

    let (a, b) = {
        let engine = Rhizome::open(config.clone()).unwrap();
        let a = engine
            .store()
            .store(NewMemory::new("WAL mode lets readers run beside the writer").tags(["sqlite"]))
            .await
            .unwrap()
            .memory
            .id;
        let b = engine
            .store()
            .store(NewMemory::new("checkpoint the log before backups"))
            .await
            .unwrap()
            .memory
            .id;
        engine
            .graph()
            .create(NewRelationship::new(&b, &a, RelationshipType::References))
            .await
            .unwrap();
        (a, b)
    };

    let engine = Rhizome::open(config).unwrap();
    let memory = engine.store().get(&a).await.unwrap();
    assert_eq!(memory.tags, vec!["sqlite"]);

    let response = engine
        .search()
        .search(SearchOptions::keyword("readers writer"))
        .await
        .unwrap();
    assert_eq!(response.results[0].memory.id, a);

    let edges = engine.graph().for_memory(&a).await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].source_id, b);

    let status = engine.status().await;
    assert!(!status.embedding.enabled);
    assert!(!status.chat.available);
}

#[tokio::test]
async fn health_report_counts_rows_and_audit_entries() {
    let tmp = tempfile::tempdir().unwrap();
    let config = on_disk_config(tmp.path());
    let engine = Rhizome::open(config.clone()).unwrap();

    let id = engine
        .store()
        .store(NewMemory::new("audited"))
        .await
        .unwrap()
        .memory
        .id;
    engine.store().delete(&id).await.unwrap();

    let conn = db::open_database(config.resolved_db_path()).unwrap();
    let report = db::check_database_health(&conn).unwrap();
    assert!(report.integrity_ok);
    assert_eq!(report.schema_version, db::migrations::CURRENT_SCHEMA_VERSION);
    assert_eq!(report.memory_count, 0);
    assert_eq!(report.log_count, 2, "create and delete are both logged");
}

#[tokio::test]
async fn stats_and_sessions_reflect_contents() {
    let engine = plain_engine();
    engine
        .store()
        .store(NewMemory::new("first in alpha").session("alpha").domain("ops"))
        .await
        .unwrap();
    engine
        .store()
        .store(NewMemory::new("second in alpha").session("alpha"))
        .await
        .unwrap();
    engine
        .store()
        .store(NewMemory::new("only in beta").session("beta").domain("research"))
        .await
        .unwrap();

    let stats = engine.store().stats().await.unwrap();
    assert_eq!(stats.memories, 3);
    assert_eq!(stats.roots, 3);
    assert_eq!(stats.chunks, 0);
    assert_eq!(stats.sessions, 2);
    assert_eq!(stats.domains, 2);
    assert!(stats.oldest <= stats.newest);

    let sessions = engine.store().sessions().await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].session_id, "beta", "most recent activity first");
    let alpha = sessions.iter().find(|s| s.session_id == "alpha").unwrap();
    assert_eq!(alpha.memories, 2);
}

#[tokio::test]
async fn list_orders_and_filters() {
    let engine = plain_engine();
    for (content, importance) in [("low", 2), ("high", 9), ("middle", 5)] {
        engine
            .store()
            .store(NewMemory::new(content).importance(importance))
            .await
            .unwrap();
    }

    let newest = engine.store().list(ListOptions::default()).await.unwrap();
    let contents: Vec<_> = newest.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["middle", "high", "low"]);

    let by_importance = engine
        .store()
        .list(ListOptions {
            order: ListOrder::Importance,
            ..ListOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(by_importance[0].content, "high");

    let important = engine
        .store()
        .list(ListOptions {
            filter: MemoryFilter {
                min_importance: Some(5),
                ..MemoryFilter::default()
            },
            ..ListOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(important.len(), 2);

    let paged = engine
        .store()
        .list(ListOptions {
            limit: Some(1),
            offset: 1,
            ..ListOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(paged.len(), 1);
    assert_eq!(paged[0].content, "high");
}
