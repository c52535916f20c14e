mod commands;
mod server;

use clap::{Parser, Subcommand};
use tracing::error;

use shared::error::CommonError;

pub const CLI_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "mcpgw", version = CLI_VERSION, about = "MCP gateway and registry")]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway (default).
    Serve,
    /// Print the reverse-proxy config fragment for the current records.
    GenerateConfig,
}

/// Exit codes: 0 clean, 2 configuration, 3 state corruption at boot,
/// 4 fatal runtime error.
fn exit_code_for(e: &CommonError) -> i32 {
    match e {
        CommonError::Config { .. } => 2,
        CommonError::Corruption { .. } => 3,
        _ => 4,
    }
}

#[tokio::main]
async fn main() {
    shared::env::load_optional_env_files();
    if let Err(e) = shared::logging::configure_logging() {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(4);
    }

    let cli = Cli::parse();
    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => commands::cmd_serve().await,
        Commands::GenerateConfig => commands::cmd_generate_config().await,
    };

    if let Err(e) = result {
        error!("fatal: {e:?}");
        std::process::exit(exit_code_for(&e));
    }
}
