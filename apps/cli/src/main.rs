//! siteindexer CLI: keep a search index in sync with a website's sitemap.
//!
//! Crawls new and changed pages, removes stale content, and provisions the
//! search data source, indexes, skillset and indexer over the result.

mod commands;
mod schedule;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
