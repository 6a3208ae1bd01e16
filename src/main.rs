use clap::{Parser, Subcommand};
use simbridge::app::App;
use simbridge::errors::ToolError;
use simbridge::mcp::server::McpServer;
use simbridge::services::config::BridgeConfig;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "simbridge", version, about = "iOS simulator bridge over SSH")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve MCP over stdio (default).
    Serve,
    /// Check and reconcile the idb toolchain on the target host.
    Setup {
        /// Host to reconcile instead of the configured target.
        #[arg(long)]
        host: Option<String>,
        #[arg(long = "user")]
        username: Option<String>,
        /// Report the plan without changing anything.
        #[arg(long)]
        dry_run: bool,
        /// Apply the plan without asking.
        #[arg(long = "yes")]
        auto_confirm: bool,
    },
}

async fn run(cli: Cli) -> Result<(), ToolError> {
    let config = BridgeConfig::from_env()?;
    let app = Arc::new(App::initialize(config)?);

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => McpServer::new(app.clone()).run_stdio().await,
        Command::Setup {
            host,
            username,
            dry_run,
            auto_confirm,
        } => app
            .setup
            .reconcile(host.as_deref(), username.as_deref(), dry_run, auto_confirm)
            .await
            .map(|text| println!("{}", text)),
    };

    app.shutdown().await;
    result
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(err) = run(Cli::parse()).await {
        eprintln!("simbridge: {}", err);
        if let Some(hint) = &err.hint {
            eprintln!("hint: {}", hint);
        }
        std::process::exit(1);
    }
}
