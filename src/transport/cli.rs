//! CLI command handlers

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use colored::Colorize;

use crate::auth::{AuthManager, Credential, CredentialStore, FileCredentialStore};
use crate::config::{Config, ConfigOverrides};

fn load_config(overrides: &ConfigOverrides) -> Result<Config> {
    Config::load(overrides).context("Failed to load configuration")
}

fn build_manager(config: &Config, scopes: Vec<String>) -> Result<AuthManager> {
    let manager = AuthManager::new(config, scopes)?;
    manager.set_status_observer(|message| tracing::info!("{}", message));
    Ok(manager)
}

/// Run the login flow, reusing a still valid credential
pub async fn run_login(overrides: &ConfigOverrides, scopes: Vec<String>) -> Result<()> {
    let config = load_config(overrides)?;
    let manager = build_manager(&config, scopes)?;

    println!("{}", "=== authgate Login ===".bold().cyan());
    println!();
    println!(
        "{} {}",
        "Requested scopes:".bold(),
        manager.scopes().join(" ")
    );
    println!();

    let credential = manager.get_authenticated_credential().await?;

    println!("✅ {}", "Authenticated".green());
    print_summary(&credential);
    Ok(())
}

/// Print the access token alone, for use in scripts
pub async fn run_token(overrides: &ConfigOverrides, scopes: Vec<String>) -> Result<()> {
    let config = load_config(overrides)?;
    let manager = build_manager(&config, scopes)?;

    let credential = manager.get_authenticated_credential().await?;
    println!("{}", credential.access_token);
    Ok(())
}

/// Force a refresh of the stored credential
pub async fn run_refresh(overrides: &ConfigOverrides) -> Result<()> {
    let config = load_config(overrides)?;
    let manager = build_manager(&config, Vec::new())?;

    if !manager.initialize().await? {
        anyhow::bail!("No stored credential for the configured scopes. Run: authgate login");
    }

    let credential = manager.refresh_token().await?;
    println!("✅ {}", "Token refreshed".green());
    print_summary(&credential);
    Ok(())
}

/// Describe the stored credential without touching the network
pub async fn run_status(overrides: &ConfigOverrides) -> Result<()> {
    let config = load_config(overrides)?;
    let store = FileCredentialStore::from_path_or_default(
        config.storage.credentials_path.as_deref(),
    )?;

    println!("{}", "=== authgate Status ===".bold().cyan());
    println!();
    println!("  Store:       {}", store.path().display());

    match store.load().await? {
        Some(credential) => {
            let state = if credential.millis_until_expiry() > 0 {
                "✅ Authenticated".green()
            } else {
                "⚠️  Expired".yellow()
            };
            println!("  Status:      {}", state);
            print_summary(&credential);

            let granted = credential.granted_scopes();
            let missing: Vec<&str> = config
                .oauth
                .scopes
                .iter()
                .map(String::as_str)
                .filter(|scope| !granted.contains(scope))
                .collect();
            if !missing.is_empty() {
                println!(
                    "  {} {}",
                    "Missing default scopes:".yellow(),
                    missing.join(" ")
                );
            }
        }
        None => {
            println!("  Status:      {}", "❌ Not authenticated".red());
            println!();
            println!("Authenticate with: authgate login");
        }
    }

    Ok(())
}

/// Remove the stored credential
pub async fn run_logout(overrides: &ConfigOverrides) -> Result<()> {
    let config = load_config(overrides)?;
    let manager = AuthManager::new(&config, Vec::new())?;

    manager.clear_auth().await?;
    println!("✅ Logged out");
    Ok(())
}

fn print_summary(credential: &Credential) {
    println!("  Expires:     {}", format_expiry(credential.expiry_date));
    println!(
        "  Scopes:      {}",
        credential.scope.as_deref().unwrap_or("(none recorded)")
    );
    let refresh = if credential.has_refresh_token() {
        "yes".green()
    } else {
        "no".yellow()
    };
    println!("  Refreshable: {}", refresh);
}

fn format_expiry(expiry_ms: i64) -> String {
    Local
        .timestamp_millis_opt(expiry_ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{} (epoch ms)", expiry_ms))
}
