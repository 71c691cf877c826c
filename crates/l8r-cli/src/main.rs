mod logging;
mod redaction;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use l8r_agents::{ChatMessage, ChatOptions, ToolRegistry, TurnRequest};
use l8r_common::SessionId;
use l8r_config::{AppConfig, ConfigLoader};
use l8r_db::AccountStore;
use l8r_gateway::GatewayServer;
use l8r_gateway::bootstrap;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Parser)]
#[command(name = "l8r", version, about = "l8r Buy Now Pay Later customer service assistant")]
struct Cli {
    /// Config file (defaults to ~/.l8r/config.yml)
    #[arg(long, global = true, env = "L8R_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Reset the database to the demo account
    Seed,
    /// Ask one question and print the answer
    Ask {
        message: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// Print the tool catalog
    Tools,
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let loader = match path {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    loader
        .load()
        .with_context(|| format!("failed to load config from {}", loader.path().display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_json);
    let mut config = load_config(cli.config)?;

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let state = bootstrap::build_state(config).context("failed to start runtime")?;
            GatewayServer::new(state).run().await?;
        }
        Command::Seed => {
            let path = bootstrap::db_path(&config);
            config.database.seed_if_empty = false;
            let mut store = bootstrap::open_store(&config)?;
            store.seed_demo().context("failed to seed demo data")?;
            info!("demo account reset in {}", path.display());
            println!("Seeded demo account into {}", path.display());
        }
        Command::Ask { message, session } => {
            let state = bootstrap::build_state(config).context("failed to start runtime")?;
            let turn = state
                .runtime
                .chat(TurnRequest {
                    messages: vec![ChatMessage::user(message)],
                    session_id: session.map(SessionId::from_string),
                    parent_span_id: None,
                    options: ChatOptions::default(),
                })
                .await?;
            for call in &turn.outcome.tool_invocations {
                eprintln!("[tool] {} {}", call.name, call.arguments);
            }
            info!(span = %turn.span_id, rounds = turn.outcome.rounds, "turn complete");
            println!("{}", turn.outcome.content);
        }
        Command::Tools => {
            let store = AccountStore::in_memory()?;
            let registry = ToolRegistry::account_tools(Arc::new(Mutex::new(store)))?;
            for def in registry.definitions() {
                let schema = serde_json::to_string(&def.input_schema)?;
                println!("{:<24} {}\n{:<24} {schema}", def.name, def.description, "");
            }
        }
    }

    Ok(())
}
