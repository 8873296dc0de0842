use anyhow::Result;
use std::path::Path;

use crate::config::AgentConfig;
use crate::kiosk::{AllowedApp, AllowedAppsFile};

use super::utils::init_logging;

fn apps_path(config_path: &Path) -> Result<std::path::PathBuf> {
    AgentConfig::load_or_default(config_path)?.kiosk.apps_path()
}

/// List allowed applications
pub fn list(config_path: &Path, verbose: bool) -> Result<()> {
    init_logging(verbose, &Default::default())?;
    let path = apps_path(config_path)?;
    let file = AllowedAppsFile::load(&path)?;

    println!("Allowed applications ({})", path.display());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if file.allowed_apps.is_empty() {
        println!("(none)");
    }
    for app in file.allowed_apps.values() {
        let autostart = if app.autostart { "  [autostart]" } else { "" };
        println!("{}{}", app.name, autostart);
        println!("    {}", app.path);
        if !app.args.is_empty() {
            println!("    args: {}", app.args.join(" "));
        }
    }
    Ok(())
}

/// Add or replace an allowed application
pub fn add(
    config_path: &Path,
    name: String,
    path: String,
    args: Vec<String>,
    autostart: bool,
    verbose: bool,
) -> Result<()> {
    init_logging(verbose, &Default::default())?;
    if name.trim().is_empty() {
        anyhow::bail!("Application name cannot be empty");
    }

    let apps_path = apps_path(config_path)?;
    let mut file = AllowedAppsFile::load(&apps_path)?;

    let mut app = AllowedApp::new(name.trim(), path).with_args(args);
    app.autostart = autostart;
    let label = app.name.clone();

    match file.insert(app) {
        Some(_) => println!("✓ Updated {}", label),
        None => println!("✓ Added {}", label),
    }
    file.save(&apps_path)?;
    println!("Restart the agent to apply the change.");
    Ok(())
}

/// Remove an allowed application
pub fn remove(config_path: &Path, name: String, verbose: bool) -> Result<()> {
    init_logging(verbose, &Default::default())?;
    let apps_path = apps_path(config_path)?;
    let mut file = AllowedAppsFile::load(&apps_path)?;

    let Some(removed) = file.remove(&name) else {
        anyhow::bail!("'{}' is not an allowed application", name);
    };
    file.save(&apps_path)?;
    println!("✓ Removed {}", removed.name);
    Ok(())
}
