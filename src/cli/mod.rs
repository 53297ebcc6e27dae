pub mod doctor;
pub mod search;

use anyhow::{Context, Result};

use rhizome::{Rhizome, RhizomeConfig};

/// Number of sessions listed by `stats`.
const RECENT_SESSIONS: usize = 10;

/// Open the engine for a one-shot command.
pub fn open(config: &RhizomeConfig) -> Result<Rhizome> {
    Rhizome::open(config.clone()).with_context(|| {
        format!(
            "failed to open database at {}",
            config.resolved_db_path().display()
        )
    })
}

/// Display memory statistics in the terminal.
pub async fn stats(config: &RhizomeConfig, json: bool) -> Result<()> {
    let engine = open(config)?;
    let stats = engine.store().stats().await.context("failed to read stats")?;
    let sessions = engine
        .store()
        .sessions()
        .await
        .context("failed to list sessions")?;
    let domains = engine
        .store()
        .domains()
        .await
        .context("failed to list domains")?;

    if json {
        let body = serde_json::json!({ "stats": stats, "sessions": sessions, "domains": domains });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("Memory Statistics");
    println!("{}", "=".repeat(40));
    println!("  Memories:            {}", stats.memories);
    println!("  Roots:               {}", stats.roots);
    println!("  Chunks:              {}", stats.chunks);
    println!("  Embedded:            {}", stats.embedded);
    println!(
        "  Relationships:       {} ({} discovered)",
        stats.relationships, stats.auto_relationships
    );
    println!("  Sessions:            {}", stats.sessions);
    println!("  Domains:             {}", stats.domains);
    if let Some(oldest) = stats.oldest {
        println!("  Oldest memory:       {oldest}");
    }
    if let Some(newest) = stats.newest {
        println!("  Newest memory:       {newest}");
    }

    if !sessions.is_empty() {
        println!();
        println!("Recent sessions:");
        for s in sessions.iter().take(RECENT_SESSIONS) {
            let last = s
                .last_activity
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".into());
            println!("  {:<28} {:>6}  {}", s.session_id, s.memories, last);
        }
    }

    if !domains.is_empty() {
        println!();
        println!("Domains:");
        for d in &domains {
            let marker = if d.registered { "" } else { " (unregistered)" };
            println!(
                "  {:<28} {:>6}  avg importance {:.1}{marker}",
                d.name, d.stats.memories, d.stats.average_importance
            );
        }
    }

    Ok(())
}
