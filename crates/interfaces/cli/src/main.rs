mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use wayfinder_config::AppConfig;

#[derive(Debug, Parser)]
#[command(
    name = "wayfinder",
    version,
    about = "Answer location questions with a local model and a maps tool"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Answer one location query (Ctrl-C cancels it).
    Ask {
        #[arg(required = true, trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// List models installed in the inference daemon.
    Models,
    /// Make sure a model is installed, downloading it if needed.
    Pull {
        /// Defaults to the configured model.
        model: Option<String>,
    },
    /// Probe the daemon and open a tool session, printing the tools.
    Check,
    /// Write a default configuration file to the config path.
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Ask { query } => commands::run_ask(&config, &query.join(" ")).await?,
        Commands::Models => commands::run_models(&config).await?,
        Commands::Pull { model } => {
            let model = model.unwrap_or_else(|| config.llm.model.clone());
            commands::run_pull(&config, &model).await?;
        }
        Commands::Check => commands::run_check(&config).await?,
        Commands::InitConfig => {
            if cli.config.exists() {
                anyhow::bail!("{} already exists", cli.config.display());
            }
            AppConfig::default().save_to(&cli.config)?;
            println!("configuration written to {}", cli.config.display());
        }
    }

    Ok(())
}
