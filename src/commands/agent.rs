use anyhow::{Context, Result};
use std::io::BufRead;
use std::path::Path;

use crate::agent;
use crate::auth;
use crate::config::AgentConfig;
use crate::kiosk::{AllowedAppsFile, BackupJournal};
use crate::platform;
use crate::state::{AgentState, StateFileJournal};

use super::utils::{format_duration, init_logging, print_sudo_message};

fn require_admin() {
    if let Err(e) = platform::common::ensure_admin_privileges() {
        eprintln!("Insufficient privileges: {:#}", e);
        print_sudo_message();
        std::process::exit(1);
    }
}

/// Write the agent configuration
pub fn setup(config_path: &Path, host: String, port: u16, force: bool, verbose: bool) -> Result<()> {
    init_logging(verbose, &Default::default())?;
    require_admin();

    println!("Kiosk Session Agent - Setup");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    let mut config = if config_path.exists() && !force {
        let existing = AgentConfig::load(config_path)?;
        println!(
            "Existing configuration points at {}:{}; updating the controller address.",
            existing.connection.host, existing.connection.port
        );
        existing
    } else {
        AgentConfig::default()
    };

    config.connection.host = host;
    config.connection.port = port;
    config.validate().context("Invalid configuration")?;

    config.save(config_path)?;
    println!("✓ Configuration saved to: {}", config_path.display());

    let apps_path = config.kiosk.apps_path()?;
    if !apps_path.exists() {
        AllowedAppsFile::load(&apps_path)?.save(&apps_path)?;
        println!("✓ Default allowed applications written to: {}", apps_path.display());
    }

    println!();
    println!("Next steps:");
    println!("  1. Set the admin override password:");
    println!("     kiosk-agent hash-password --save");
    println!("  2. Start the agent:");
    println!("     kiosk-agent start");

    Ok(())
}

/// Run the agent in the foreground
pub fn start(config_path: &Path, verbose: bool) -> Result<()> {
    let config = AgentConfig::load(config_path)
        .context("Failed to load agent configuration. Run 'kiosk-agent setup' first.")?;
    init_logging(verbose, &config.logging)?;

    if config.kiosk.require_admin {
        require_admin();
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(agent::run_agent_daemon(config, config_path))
}

/// Show configuration and persisted state
pub fn status(config_path: &Path, verbose: bool) -> Result<()> {
    init_logging(verbose, &Default::default())?;
    println!("Kiosk Agent Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = AgentConfig::load(config_path)
        .context("Agent not configured. Run 'kiosk-agent setup' first.")?;

    println!(
        "Controller:     {}:{}",
        config.connection.host, config.connection.port
    );
    println!(
        "Reconnect:      {} attempts, {}s doubling to {}s",
        config.connection.max_reconnect_attempts,
        config.connection.base_reconnect_delay,
        config.connection.max_reconnect_delay
    );
    println!("Sweep interval: {} seconds", config.kiosk.sweep_interval);
    println!(
        "Lockdown keys:  {}",
        config
            .kiosk
            .policy_keys
            .iter()
            .map(|key| key.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "Admin override: {}",
        if auth::AdminGate::new(config.admin.password_hash.clone()).is_configured() {
            "configured"
        } else {
            "not configured"
        }
    );

    let apps_path = config.kiosk.apps_path()?;
    let apps = AllowedAppsFile::load(&apps_path)?;
    println!(
        "Allowed apps:   {} ({})",
        apps.allowed_apps.len(),
        apps_path.display()
    );

    println!();
    match AgentState::load(&config.kiosk.state_path()?)? {
        Some(state) => {
            println!("Machine ID:     {}", state.machine_id);
            if let Some(at) = state.last_kiosk_transition {
                println!(
                    "Last lockdown change: {} ({} ago)",
                    at.format("%Y-%m-%d %H:%M:%S %Z"),
                    format_duration(chrono::Utc::now() - at)
                );
            }
            if state.policy_backup.is_some() {
                println!("Lockdown backup: PENDING (agent running, or run 'kiosk-agent restore-policy')");
            } else {
                println!("Lockdown backup: none");
            }
        }
        None => println!("Status: Not yet run (no state file)"),
    }

    Ok(())
}

/// Restore lockdown settings recorded by a run that never lifted them
pub fn restore_policy(config_path: &Path, verbose: bool) -> Result<()> {
    let config = AgentConfig::load_or_default(config_path)?;
    init_logging(verbose, &config.logging)?;
    require_admin();

    let journal = StateFileJournal::new(config.kiosk.state_path()?);
    let Some(backup) = journal.pending()? else {
        println!("Nothing to restore");
        return Ok(());
    };

    let store = platform::native_policy_store(&platform::common::data_dir()?)?;
    let failures = backup.restore_all(store.as_ref());
    if !failures.is_empty() {
        for failure in &failures {
            eprintln!("✗ {}: {}", failure.key(), failure);
        }
        anyhow::bail!("{} lockdown settings could not be restored", failures.len());
    }

    journal.clear()?;
    for key in backup.keys() {
        println!("✓ Restored {}", key);
    }
    Ok(())
}

/// Read a password from stdin and print its hash
pub fn hash_password(config_path: &Path, save: bool, verbose: bool) -> Result<()> {
    init_logging(verbose, &Default::default())?;

    eprintln!("Enter the admin override password:");
    let mut password = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut password)
        .context("Failed to read password")?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    let hash = auth::hash_password(password)?;

    if save {
        require_admin();
        let mut config = AgentConfig::load_or_default(config_path)?;
        config.admin.password_hash = Some(hash);
        config.save(config_path)?;
        println!("✓ Admin password saved to: {}", config_path.display());
    } else {
        println!("{}", hash);
    }
    Ok(())
}
