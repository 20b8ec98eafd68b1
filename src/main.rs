//! # Chat Agent CLI (`chat-agent`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chat-agent serve` | Start the web UI |
//! | `chat-agent chat <file.pdf>` | Converse with a PDF in the terminal |
//! | `chat-agent analytics` | Print the saved usage numbers |
//!
//! ## Examples
//!
//! ```bash
//! ANALYTICS_PASSWORD=change-me chat-agent serve --config ./config/chat-agent.toml
//! OPENAI_API_KEY=sk-... ANALYTICS_PASSWORD=change-me chat-agent chat ./paper.pdf
//! chat-agent analytics
//! ```

use anyhow::Context;
use chat_agent::analytics::{read_snapshot, Analytics};
use chat_agent::backend::{ChatBackend, OpenAIBackend};
use chat_agent::config::{self, Config};
use chat_agent::server;
use chat_agent::session::{Session, SessionController};
use chat_agent::upload::UploadedDocument;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Chat Agent: upload a PDF and chat with it.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "chat-agent",
    about = "Chat Agent: upload a PDF and chat with it through a hosted chat-completion API",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/chat-agent.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the web UI.
    ///
    /// Binds to `[server].bind`. Analytics are resumed from
    /// `[analytics].path` and saved on Ctrl-C; saving requires the
    /// analytics password in the environment.
    Serve,

    /// Converse with a PDF in the terminal.
    ///
    /// Type a question per line. `/upload <path>` switches to another
    /// document (the conversation restarts), `/quit` exits.
    Chat {
        /// The PDF to load.
        pdf: PathBuf,

        /// OpenAI API key. Falls back to `OPENAI_API_KEY`.
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Print the saved analytics snapshot.
    Analytics,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Chat { pdf, api_key } => {
            let api_key = api_key.or_else(|| std::env::var("OPENAI_API_KEY").ok());
            run_chat(&cfg, &pdf, api_key.as_deref()).await?;
        }
        Commands::Analytics => {
            print_analytics(&cfg)?;
        }
    }

    Ok(())
}

async fn run_chat(cfg: &Config, pdf: &Path, api_key: Option<&str>) -> anyhow::Result<()> {
    let config = Arc::new(cfg.clone());
    let analytics = Arc::new(Analytics::start(&config.analytics.path));
    let backend: Arc<dyn ChatBackend> = Arc::new(OpenAIBackend::new(config.clone())?);
    let controller = SessionController::new(backend, config.uploads.clone(), analytics.clone());
    let mut session = Session::new();

    controller.validate_credential(&mut session, api_key)?;
    load_document(&controller, &mut session, pdf).await?;

    println!("Ask a question. /upload <path> to switch documents, /quit to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Some(path) = line.strip_prefix("/upload ") {
            if let Err(e) = load_document(&controller, &mut session, Path::new(path.trim())).await {
                println!("warning: {:#}", e);
            }
            continue;
        }

        match controller.send_message(&mut session, line).await {
            Ok(reply) => println!("\nassistant: {}\n", reply),
            Err(e) => println!("warning: {}", e),
        }
    }

    controller.close(&mut session);
    analytics
        .stop(&config.analytics.path, &config.analytics.password_env)
        .context("Failed to save analytics")?;
    Ok(())
}

async fn load_document(
    controller: &SessionController,
    session: &mut Session,
    path: &Path,
) -> anyhow::Result<()> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string());

    let handle = controller
        .ingest_document(session, UploadedDocument::new(name, bytes))
        .await?;
    println!(
        "Loaded {} ({} chunks, index {}).",
        handle.document_name, handle.chunk_count, handle.index_name
    );
    Ok(())
}

fn print_analytics(cfg: &Config) -> anyhow::Result<()> {
    let snap = read_snapshot(&cfg.analytics.path)?;
    let since = snap
        .start_time
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string());

    println!("analytics since {}", since);
    println!("  pageviews: {}", snap.total_pageviews);
    println!("  script runs: {}", snap.total_script_runs);
    println!("  time: {:.0}s", snap.total_time_seconds);
    for (widget, count) in &snap.widgets {
        println!("  {}: {}", widget, count);
    }
    for (day, counts) in snap.per_day.iter().rev().take(7) {
        println!(
            "  {}  pageviews {}  runs {}",
            day, counts.pageviews, counts.script_runs
        );
    }
    Ok(())
}
