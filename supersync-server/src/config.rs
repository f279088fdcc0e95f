use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use supersync_core::{check_violation, format_violation, Rule};

use crate::auth::AuthConfig;
use crate::cli::Cli;
use crate::ratelimit::RateLimitConfig;

pub const DEFAULT_PORT: u16 = 4237;
pub const CONFIG_FILE: &str = "config.json";

/// Shape of `config.json`. Build settings are accepted but unused here.
fn file_rule() -> Rule {
    Rule::hash([
        ("mainPort", Rule::integer().min(1.0).max(65535.0).optional()),
        ("port", Rule::integer().min(1.0).max(65535.0).optional()),
        ("buildPort", Rule::integer().min(1.0).max(65535.0).optional()),
        ("password", Rule::string().optional()),
        ("sessionSecret", Rule::string().optional()),
        ("maxRecentBuilds", Rule::integer().min(1.0).optional()),
    ])
}

/// Optional settings read from `<data-dir>/config.json`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    pub main_port: Option<u16>,
    /// Older name for `mainPort`, used when that is absent
    pub port: Option<u16>,
    pub password: Option<String>,
}

impl FileConfig {
    pub fn parse(value: &Value) -> Result<Self> {
        if let Some(violation) = check_violation(value, &file_rule(), true) {
            return Err(anyhow!("Invalid {}: {}", CONFIG_FILE, format_violation(&violation)));
        }
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Read the file if it exists; a missing file means defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err).with_context(|| format!("read {:?}", path)),
        };
        let value: Value =
            serde_json::from_str(&text).with_context(|| format!("parse {:?}", path))?;
        Self::parse(&value)
    }
}

/// Runtime configuration derived from CLI/env and config.json.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// `None` when documents live in memory only
    pub data_dir: Option<PathBuf>,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
}

impl ServerConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        if !cli.rate_per_sec.is_finite() || cli.rate_per_sec < 0.0 {
            bail!(
                "--rate-per-sec must be a non-negative number, got {}",
                cli.rate_per_sec
            );
        }

        let data_dir = if cli.in_memory {
            None
        } else if cli.data_dir.is_relative() {
            Some(std::env::current_dir()?.join(&cli.data_dir))
        } else {
            Some(cli.data_dir.clone())
        };

        let file = match &data_dir {
            Some(dir) => FileConfig::load(dir)?,
            None => FileConfig::default(),
        };
        Ok(Self::merge(cli, file, data_dir))
    }

    /// CLI flags win over file values.
    fn merge(cli: &Cli, file: FileConfig, data_dir: Option<PathBuf>) -> Self {
        let listen_addr = cli.listen_addr.clone().unwrap_or_else(|| {
            let port = file.main_port.or(file.port).unwrap_or(DEFAULT_PORT);
            format!("127.0.0.1:{}", port)
        });

        let auth = AuthConfig {
            password: cli.password.clone().or(file.password),
        };

        let rate_limit = RateLimitConfig {
            burst: cli.rate_burst,
            refill_rate: cli.rate_per_sec,
            enabled: cli.rate_limit,
        };

        Self {
            listen_addr,
            data_dir,
            auth,
            rate_limit,
        }
    }
}
