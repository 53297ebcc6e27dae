use anyhow::{Context, Result};
use clap::Args;

use rhizome::memory::search::{SearchOptions, SearchType};
use rhizome::memory::types::MemoryFilter;
use rhizome::RhizomeConfig;

const PREVIEW_CHARS: usize = 120;

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Text to search for. Omit to list recent memories.
    pub query: Option<String>,
    /// keyword, semantic, hybrid, tags, or date_range
    #[arg(long = "type", short = 't')]
    pub search_type: Option<String>,
    /// Restrict to memories carrying this tag (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,
    #[arg(long)]
    pub session: Option<String>,
    #[arg(long)]
    pub domain: Option<String>,
    #[arg(long, short = 'n')]
    pub limit: Option<usize>,
    #[arg(long, default_value_t = 0.0)]
    pub min_relevance: f64,
    /// Print JSON instead of a list
    #[arg(long)]
    pub json: bool,
}

/// Run a search from the terminal.
pub async fn search(config: &RhizomeConfig, args: SearchArgs) -> Result<()> {
    let search_type = args
        .search_type
        .as_deref()
        .map(str::parse::<SearchType>)
        .transpose()?;

    let options = SearchOptions {
        query: args.query,
        search_type,
        filter: MemoryFilter {
            session_id: args.session,
            domain: args.domain,
            tags: args.tags,
            ..MemoryFilter::default()
        },
        limit: args.limit,
        min_relevance: args.min_relevance,
    };

    let engine = super::open(config)?;
    let response = engine
        .search()
        .search(options)
        .await
        .context("search failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    if let Some(reason) = &response.degraded {
        eprintln!("note: {reason}");
    }
    if response.results.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!(
        "Found {} result(s) via {:?} search\n",
        response.results.len(),
        response.strategy
    );
    for (i, hit) in response.results.iter().enumerate() {
        let m = &hit.memory;
        println!(
            "  {}. {} (relevance: {:.3}, importance: {}, {:?})",
            i + 1,
            m.id,
            hit.relevance,
            m.importance,
            hit.match_type,
        );
        if !m.tags.is_empty() {
            println!("     tags: {}", m.tags.join(", "));
        }
        println!("     {}", preview(&m.content));
        println!();
    }

    Ok(())
}

/// First line of `content`, cut on a char boundary.
fn preview(content: &str) -> String {
    let line = content.lines().next().unwrap_or_default();
    if line.chars().count() > PREVIEW_CHARS {
        let cut: String = line.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}
