//! `doctor`: database diagnostics plus a live probe of each AI capability.

use anyhow::{Context, Result};

use rhizome::ai::{AiServices, CapabilityStatus};
use rhizome::db;
use rhizome::RhizomeConfig;

pub async fn doctor(config: &RhizomeConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    println!("Rhizome Health Report");
    println!("=====================");
    println!();

    if db_path.exists() {
        let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
        let conn = db::open_database(&db_path).context("failed to open database (may be corrupt)")?;
        let report = db::check_database_health(&conn).context("failed to run health check")?;

        println!("Database:          {}", db_path.display());
        println!("File size:         {}", format_bytes(file_size));
        println!("Schema version:    {}", report.schema_version);
        println!();
        println!("Embedding model:");
        println!(
            "  Stored:          {}",
            report.embedding_model.as_deref().unwrap_or("(not set)")
        );
        println!("  Configured:      {}", config.embedding.model);
        if let Some(stored) = &report.embedding_model {
            if stored != &config.embedding.model {
                println!("  WARNING: model mismatch; stored vectors were built with another model.");
            }
        }
        println!();
        println!("Row counts:");
        println!("  Memories:        {}", report.memory_count);
        println!("  Relationships:   {}", report.relationship_count);
        println!("  Audit log:       {}", report.log_count);
        println!();
        if report.integrity_ok {
            println!("Integrity check:   PASSED");
        } else {
            println!("Integrity check:   FAILED ({})", report.integrity_details);
        }
    } else {
        println!("Database:          not found at {}", db_path.display());
        println!("                   (created on first write)");
    }

    println!();
    println!("AI capabilities:");
    let ai = AiServices::from_config(config);
    let status = ai.refresh_status().await;
    print_capability("Embedding", &status.embedding);
    print_capability("Vector store", &status.vector_store);
    print_capability("Chat", &status.chat);
    let cache = status.embedding_cache;
    println!(
        "  {:<16} {} of {} entries ({} hits, {} misses)",
        "Embedding cache:", cache.entries, cache.capacity, cache.hits, cache.misses
    );
    println!();
    if status.embedding.available && status.vector_store.available {
        println!("Search modes:      keyword, tags, date range, semantic, hybrid");
    } else {
        println!("Search modes:      keyword, tags, date range (semantic and hybrid fall back to keyword)");
    }

    Ok(())
}

fn print_capability(name: &str, status: &CapabilityStatus) {
    let state = match (status.enabled, status.available) {
        (false, _) => "disabled".to_string(),
        (true, true) => "available".to_string(),
        (true, false) => "unavailable".to_string(),
    };
    let model = status
        .model
        .as_deref()
        .map(|m| format!(" ({m})"))
        .unwrap_or_default();
    println!("  {:<16} {state}{model}", format!("{name}:"));
    if let Some(error) = &status.error {
        println!("  {:<16} {error}", "");
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
