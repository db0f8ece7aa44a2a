//! CLI surface (spec §6.3): `--config`, `--dry-run`, `--version`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "edgebot", version, about = "Edge-side telemetry collector and shipper")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, env = "EDGEBOT_CONFIG")]
    pub config: PathBuf,

    /// Parse config, construct components, start nothing, then exit.
    #[arg(long)]
    pub dry_run: bool,
}

/// Process exit codes (§6.3).
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const FATAL: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const SIGINT: i32 = 130;
}
