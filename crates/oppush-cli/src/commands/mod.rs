//! CLI command definitions and handlers.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Load configuration with graceful fallback to defaults.
///
/// A missing file gives the defaults. A file that cannot be parsed is
/// reported and the defaults are used instead.
pub fn load_config() -> oppush_core::config::Config {
    oppush_core::config::Config::load().unwrap_or_else(|e| {
        tracing::warn!("Ignoring configuration file: {}", e);
        oppush_core::config::Config::default()
    })
}

pub mod config;
pub mod send;

/// OpPush - push files to nearby devices over OBEX object push
#[derive(Parser)]
#[command(name = "oppush")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Send files to a device
    Send(SendArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// Device address (IP or IP:PORT for OBEX over TCP)
    pub address: String,

    /// Files to send, in order
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Content type to announce instead of guessing from the extension
    #[arg(short = 't', long = "type", value_name = "MIME")]
    pub content_type: Option<String>,

    /// Name to announce (single file only)
    #[arg(short, long)]
    pub name: Option<String>,

    /// OBEX TCP port when the address carries none
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,

    /// Print a JSON summary of the results
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Write a configuration file with the defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
