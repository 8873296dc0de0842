use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Kiosk Session Agent
///
/// Locks a shared computer into kiosk mode for paid, time-boxed sessions
/// issued by a remote controller.
#[derive(Parser, Debug)]
#[command(name = "kiosk-agent")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the agent configuration file (defaults to the system location)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write the agent configuration
    Setup {
        /// Controller host name or address
        #[arg(long)]
        host: String,

        /// Controller port
        #[arg(long, default_value = "5000")]
        port: u16,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
    /// Run the agent in the foreground until interrupted
    Start,
    /// Show configuration and persisted state
    Status,
    /// Manage the allowed applications
    Apps {
        #[command(subcommand)]
        command: AppsCommands,
    },
    /// Restore lockdown settings left behind by an interrupted run
    RestorePolicy,
    /// Hash an admin override password
    HashPassword {
        /// Store the hash in the agent configuration
        #[arg(long)]
        save: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum AppsCommands {
    /// List allowed applications
    List,
    /// Add or replace an allowed application
    Add {
        /// Process name, e.g. chrome.exe
        name: String,

        /// Executable path; %VAR% and one * component are expanded at launch
        path: String,

        /// Launch arguments
        #[arg(last = true)]
        args: Vec<String>,

        /// Start the application when kiosk mode is enabled
        #[arg(long)]
        autostart: bool,
    },
    /// Remove an allowed application
    Remove {
        name: String,
    },
}
