use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use authgate::transport;
use authgate::config::ConfigOverrides;

#[derive(Parser)]
#[command(name = "authgate")]
#[command(author, version, about = "authgate - OAuth2 sign-in for command line tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Credential file to use instead of the configured one
    #[arg(long, global = true, value_name = "PATH")]
    credentials: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in through the browser, reusing a valid stored credential
    Login {
        /// Scope to request (repeatable; defaults to the configured scopes)
        #[arg(short, long = "scope", value_name = "SCOPE")]
        scopes: Vec<String>,
    },

    /// Print a valid access token to stdout
    Token {
        /// Scope to request (repeatable; defaults to the configured scopes)
        #[arg(short, long = "scope", value_name = "SCOPE")]
        scopes: Vec<String>,
    },

    /// Refresh the stored credential now
    Refresh,

    /// Show the stored credential
    Status,

    /// Remove the stored credential
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "authgate=debug"
    } else {
        "authgate=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let overrides = ConfigOverrides {
        config_path: cli.config,
        credentials_path: cli.credentials,
    };

    match cli.command {
        Commands::Login { scopes } => transport::cli::run_login(&overrides, scopes).await?,
        Commands::Token { scopes } => transport::cli::run_token(&overrides, scopes).await?,
        Commands::Refresh => transport::cli::run_refresh(&overrides).await?,
        Commands::Status => transport::cli::run_status(&overrides).await?,
        Commands::Logout => transport::cli::run_logout(&overrides).await?,
    }

    Ok(())
}
