//! CLI argument definitions using clap derive macros.

use clap::Parser;
use std::path::PathBuf;

/// Orca session worker
///
/// Reads `{"subject_id": "..."}` requests as JSON lines on stdin, runs one
/// session per request and writes one JSON line per result on stdout.
#[derive(Parser, Debug)]
#[command(name = "orca-server")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config.toml (default: $ORCA_DIR/config.toml)
    #[arg(long, env = "ORCA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the SQLite session store (default: $ORCA_DIR/orca.db)
    #[arg(long, env = "ORCA_DATABASE")]
    pub database: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Run a single session for this subject, then drain and exit
    #[arg(long, value_name = "SUBJECT_ID")]
    pub once: Option<String>,
}
