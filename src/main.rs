//! Moxie Relay - streaming chat relay
//!
//! Relays chat messages to an OpenAI-compatible completion API and streams
//! the reply back as plain text. The `chat` subcommand is a terminal client
//! that renders those replies incrementally.

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod client;
mod config;
mod conversation;
mod core;
mod providers;
mod routes;

use crate::client::{ChatClient, ChatSession, RequestMode, TerminalViewport};
use crate::config::Config;
use crate::core::{Relay, TranscriptStore};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
}

#[derive(Parser)]
#[command(name = "moxie-relay", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP relay (default)
    Serve,
    /// Chat with a running relay from the terminal
    Chat(ChatArgs),
}

#[derive(Args)]
struct ChatArgs {
    /// Base URL of the relay
    #[arg(long, env = "MOXIE_RELAY_URL", default_value = "http://127.0.0.1:3000")]
    relay: String,
    /// Send the whole conversation with every message
    #[arg(long)]
    history: bool,
    /// Ask for complete replies instead of streams (with --history)
    #[arg(long, requires = "history")]
    no_stream: bool,
    /// Model to request (with --history)
    #[arg(long, requires = "history")]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            init_tracing("moxie_relay=debug,tower_http=debug");
            serve().await
        }
        Command::Chat(args) => {
            init_tracing("moxie_relay=warn");
            chat(args).await
        }
    }
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn serve() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let transcripts = match config.data_dir {
        Some(ref dir) => {
            let store = TranscriptStore::new(&dir.join("transcripts.db")).await?;
            tracing::info!("🗂️ Recording transcripts under {}", dir.display());
            Some(Arc::new(store))
        }
        None => None,
    };

    let state = AppState {
        relay: Arc::new(Relay::new(&config, transcripts)?),
    };

    let app = Router::new()
        .merge(routes::router(&config.static_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = bind(&config).await?;
    tracing::info!("🔥 Moxie relay running at http://{}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Bind the configured port, moving up one port at a time while it is taken
async fn bind(config: &Config) -> anyhow::Result<TcpListener> {
    let mut last_err = None;

    for offset in 0..config.port_attempts {
        let Some(port) = config.port.checked_add(offset) else {
            break;
        };
        let addr: SocketAddr = format!("{}:{}", config.host, port).parse()?;

        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!("Port {} is in use, trying the next one", port);
                last_err = Some(e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(anyhow::anyhow!(
        "no free port in {}..{} ({})",
        config.port,
        config.port.saturating_add(config.port_attempts),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

async fn chat(args: ChatArgs) -> anyhow::Result<()> {
    let mode = if args.history {
        RequestMode::History {
            stream: !args.no_stream,
        }
    } else {
        RequestMode::Message
    };

    let client = ChatClient::new(&args.relay)?;
    eprintln!("Chatting via {} (Ctrl-C stops a reply, /quit exits)", client.endpoint());
    let mut viewport = TerminalViewport::new(std::io::stdout());
    if std::io::stdin().is_terminal() {
        viewport = viewport.without_user_echo();
    }
    let mut session = ChatSession::new(client, viewport, mode);
    if let Some(model) = args.model {
        session = session.with_model(model);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim() == "/quit" {
            break;
        }

        let interrupted = tokio::select! {
            result = session.send(&line) => {
                if let Err(e) = result {
                    eprintln!("[{}]", e);
                }
                false
            }
            _ = tokio::signal::ctrl_c() => true,
        };
        if interrupted {
            session.abort();
        }
    }

    Ok(())
}
