use anyhow::Result;
use clap::Parser;

use kiosk_agent::cli::{AppsCommands, Args, Commands};
use kiosk_agent::commands::{agent, apps, utils};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config_path = utils::resolve_config_path(args.config)?;
    let verbose = args.verbose;

    match args.command {
        Commands::Setup { host, port, force } => agent::setup(&config_path, host, port, force, verbose),
        Commands::Start => agent::start(&config_path, verbose),
        Commands::Status => agent::status(&config_path, verbose),
        Commands::Apps { command } => match command {
            AppsCommands::List => apps::list(&config_path, verbose),
            AppsCommands::Add {
                name,
                path,
                args,
                autostart,
            } => apps::add(&config_path, name, path, args, autostart, verbose),
            AppsCommands::Remove { name } => apps::remove(&config_path, name, verbose),
        },
        Commands::RestorePolicy => agent::restore_policy(&config_path, verbose),
        Commands::HashPassword { save } => agent::hash_password(&config_path, save, verbose),
    }
}
