//! # Wiki knowledge base CLI (`wkb`)
//!
//! ## Usage
//!
//! ```bash
//! wkb --config ./config/wkb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `wkb init` | Create the SQLite database and schema |
//! | `wkb crawl <SPACE\|all>` | Incrementally ingest one space, or every configured space |
//! | `wkb status` | Show each space's watermark and document count |
//! | `wkb ask --session S "<text>"` | Answer one conversational turn |
//! | `wkb serve` | Start the HTTP agent server |
//!
//! Logs go to stderr (`--log-level`, `RUST_LOG`, `--log-json`); command
//! output goes to stdout.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use wiki_kb::app::AppContext;
use wiki_kb::config;
use wiki_kb::crawler::CrawlOptions;
use wiki_kb::migrate;
use wiki_kb::server;

/// Keeps a searchable knowledge base in sync with a wiki and answers
/// questions with cited documents.
#[derive(Parser)]
#[command(name = "wkb", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/wkb.toml")]
    config: PathBuf,

    /// Default log level when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest pages changed since the last successful crawl.
    Crawl {
        /// Space key, or `all` for every configured space.
        space: String,

        /// Ignore the stored watermark and re-list every page.
        #[arg(long)]
        reset: bool,
    },

    /// Show sync status for every configured space.
    Status,

    /// Answer one question in a conversation.
    Ask {
        /// Conversation session identifier.
        #[arg(long)]
        session: String,

        /// The user's message.
        text: String,
    },

    /// Start the HTTP agent server on `[server].bind`.
    Serve,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Crawl { space, reset } => {
            let ctx = AppContext::open(&cfg).await?;
            let spaces = if space == "all" {
                ctx.spaces()
            } else if cfg.space(&space).is_some() {
                vec![space]
            } else {
                bail!("Unknown space '{}'. Configured: {}", space, ctx.spaces().join(", "));
            };

            let crawler = ctx.crawler().await.context("Failed to set up crawler")?;
            let results = crawler.run_many(spaces, CrawlOptions { reset }).await;

            let mut failed = 0;
            for (space, result) in results {
                match result {
                    Ok(report) if report.skipped => {
                        println!("{}: skipped (another crawl is in progress)", space);
                    }
                    Ok(report) => {
                        println!(
                            "{}: scanned {}, updated {}, unchanged {}, deleted {}, images {}, failed {}",
                            space,
                            report.pages_scanned,
                            report.pages_updated,
                            report.pages_unchanged,
                            report.pages_deleted,
                            report.images_relocated,
                            report.pages_failed
                        );
                        for err in &report.errors {
                            println!("  page {} [{}]: {}", err.page_id, err.kind, err.message);
                        }
                        if report.pages_failed > 0 {
                            failed += 1;
                        }
                    }
                    Err(e) => {
                        println!("{}: error [{}]: {}", space, e.kind(), e);
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{} space(s) did not crawl cleanly", failed);
            }
        }
        Commands::Status => {
            let ctx = AppContext::open(&cfg).await?;
            for s in ctx.status().await? {
                let last = s
                    .last_crawl_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                let label = if s.name.is_empty() {
                    s.space.clone()
                } else {
                    format!("{} ({})", s.space, s.name)
                };
                println!(
                    "{}: last crawl {}, {} documents, {} pages pending",
                    label, last, s.documents, s.pending_pages
                );
            }
        }
        Commands::Ask { session, text } => {
            let ctx = AppContext::open(&cfg).await?;
            let agent = ctx.agent().await.context("Failed to set up agent")?;
            match agent.handle_turn(&session, &text).await {
                Ok(answer) => println!("{}", answer.markup),
                Err(e) => {
                    println!("{}", serde_json::json!({ "error": e }));
                    bail!("turn failed");
                }
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
