//! Process entrypoint: CLI argument parsing, configuration loading, and
//! wiring of the persistence pool, transports, and background workers.

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "bo", about = "Multi-tenant conversational assistant")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to a `.env` file. Defaults to `~/.bo/.env`.
    #[arg(long, global = true)]
    env_file: Option<std::path::PathBuf>,

    /// Path to a `config.toml` file. Defaults to `~/.bo/config.toml`.
    #[arg(long, global = true)]
    config_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the assistant: transports, scheduler, and router pipeline.
    Start,
    /// Apply database migrations and exit.
    Migrate,
    /// Load and validate configuration, printing a summary, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env_path = cli.env_file.unwrap_or_else(bo::config::default_env_path);
    let config_path = cli
        .config_file
        .unwrap_or_else(bo::config::default_config_path);
    let config = bo::config::load_config(&env_path, &config_path)?;

    match cli.command.unwrap_or(Command::Start) {
        Command::CheckConfig => {
            println!("database_url = {}", config.database_url);
            println!("default_tz = {}", config.default_tz);
            println!(
                "telegram configured = {}",
                config.telegram_bot_token.is_some()
            );
            println!(
                "anthropic configured = {}",
                config.anthropic_api_key.is_some()
            );
            Ok(())
        }
        Command::Migrate => {
            let _guard = bo::logging::init_cli();
            bo::db::connect(&config.database_url).await?;
            tracing::info!("migrations applied");
            Ok(())
        }
        Command::Start => {
            let _guard = bo::logging::init_production(&config.logs_dir)?;
            tracing::info!("bo starting up");
            bo::run(config).await
        }
    }
}
