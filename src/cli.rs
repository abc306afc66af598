// CLI module - command-line argument parsing and handlers
//
// Provides a configuration subcommand plus a handful of overrides that
// beat both the config file and the environment:
// - config --show: Display effective configuration
// - config --reset: Regenerate config file with defaults
// - config --path: Show config file path

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Logtrail - RFC5424 syslog collector and query service
#[derive(Parser)]
#[command(name = "logtrail")]
#[command(version = VERSION)]
#[command(about = "RFC5424 syslog collector and query service", long_about = None)]
pub struct Cli {
    /// Override the syslog TCP bind address
    #[arg(long)]
    pub tcp_bind: Option<SocketAddr>,

    /// Override the HTTP gateway bind address
    #[arg(long)]
    pub http_bind: Option<SocketAddr>,

    /// Override the database file path
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Reset config file to defaults
        #[arg(long)]
        reset: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Overrides that the run path applies over the loaded config.
pub struct Overrides {
    tcp_bind: Option<SocketAddr>,
    http_bind: Option<SocketAddr>,
    db_path: Option<PathBuf>,
}

impl Overrides {
    pub fn apply(self, config: &mut Config) {
        if let Some(tcp_bind) = self.tcp_bind {
            config.tcp_bind = tcp_bind;
        }
        if let Some(http_bind) = self.http_bind {
            config.http_bind = http_bind;
        }
        if let Some(db_path) = self.db_path {
            config.db_path = db_path;
        }
    }
}

/// Handle CLI commands. Returns None if a command was handled (exit
/// after), otherwise the overrides for the run path.
pub fn handle_cli() -> Option<Overrides> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { show, reset, path }) => {
            if path {
                handle_config_path();
            } else if show {
                handle_config_show();
            } else if reset {
                handle_config_reset();
            } else {
                // No flag provided, show usage
                println!("Usage: logtrail config [--show|--reset|--path]");
                println!();
                println!("Options:");
                println!("  --show    Display effective configuration");
                println!("  --reset   Reset config file to defaults");
                println!("  --path    Show config file path");
            }
            None
        }
        None => Some(Overrides {
            tcp_bind: cli.tcp_bind,
            http_bind: cli.http_bind,
            db_path: cli.db_path,
        }),
    }
}

fn handle_config_path() {
    match Config::config_path() {
        Some(path) => println!("{}", path.display()),
        None => eprintln!("Could not determine config path"),
    }
}

fn handle_config_show() {
    // Effective = file + env + defaults, exactly what the server would run with
    print!("{}", Config::from_env().to_toml());
}

fn handle_config_reset() {
    let Some(path) = Config::config_path() else {
        eprintln!("Could not determine config path");
        return;
    };
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("Failed to create {}: {}", parent.display(), e);
            return;
        }
    }
    match std::fs::write(&path, Config::default().to_toml()) {
        Ok(()) => println!("Config reset to defaults: {}", path.display()),
        Err(e) => eprintln!("Failed to write {}: {}", path.display(), e),
    }
}
