use std::path::PathBuf;

use clap::Parser;

/// CLI for the authoritative document server.
#[derive(Debug, Clone, Parser)]
#[command(name = "supersync-server", about = "Authoritative sync server for supersync documents")]
pub struct Cli {
    /// Listen address for HTTP/WS endpoints [default: 127.0.0.1:4237, or
    /// the `mainPort` from config.json]
    #[arg(long, env = "SUPERSYNC_ADDR")]
    pub listen_addr: Option<String>,

    /// Directory holding config.json and the stored documents
    #[arg(long, env = "SUPERSYNC_DATA_DIR", default_value = ".supersync")]
    pub data_dir: PathBuf,

    /// Password every client must present. Overrides config.json.
    #[arg(long, env = "SUPERSYNC_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Keep documents in memory only; nothing is read from or written to disk
    #[arg(long)]
    pub in_memory: bool,

    /// Enable debug logging
    #[arg(long, short)]
    pub verbose: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate limiting options
    // ─────────────────────────────────────────────────────────────────────────

    /// Enable rate limiting for mutation requests.
    #[arg(long, env = "SUPERSYNC_RATE_LIMIT", default_value = "true", action = clap::ArgAction::Set)]
    pub rate_limit: bool,

    /// Maximum burst of mutations per user.
    #[arg(long, env = "SUPERSYNC_RATE_BURST", default_value = "30")]
    pub rate_burst: u32,

    /// Sustained mutations per second per user.
    #[arg(long, env = "SUPERSYNC_RATE_PER_SEC", default_value = "10.0")]
    pub rate_per_sec: f64,
}
