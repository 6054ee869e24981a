// Runtime configuration, read from environment variables. Every setting has
// a default, so a bare invocation behaves like the classic script: `tmp/`
// as scratch space and `token.json`/`credentials.json` in the working
// directory.

use crate::filter::NameFilter;
use crate::migrate::MigrationConfig;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_WORKDIR: &str = "DRIVEPACK_WORKDIR";
pub const ENV_TOKEN_FILE: &str = "DRIVEPACK_TOKEN_FILE";
pub const ENV_CLIENT_SECRET_FILE: &str = "DRIVEPACK_CLIENT_SECRET_FILE";
pub const ENV_PAGE_SIZE: &str = "DRIVEPACK_PAGE_SIZE";
pub const ENV_CONTINUE_ON_ERROR: &str = "DRIVEPACK_CONTINUE_ON_ERROR";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "DRIVEPACK_HTTP_TIMEOUT_SECS";
pub const ENV_NAME_ANY_OF: &str = "DRIVEPACK_NAME_ANY_OF";
pub const ENV_NAME_MARKER: &str = "DRIVEPACK_NAME_MARKER";
pub const ENV_NAME_EXCLUDED: &str = "DRIVEPACK_NAME_EXCLUDED";

#[derive(Debug, Clone)]
pub struct Config {
    pub token_file: PathBuf,
    pub client_secret_file: PathBuf,
    pub http_timeout: Option<Duration>,
    pub migration: MigrationConfig,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = MigrationConfig::default();
        let default_filter = NameFilter::default();

        let page_size = match get(ENV_PAGE_SIZE) {
            Some(v) => {
                let n: u32 = v.trim().parse().with_context(|| {
                    format!("{} must be a positive integer, got {:?}", ENV_PAGE_SIZE, v)
                })?;
                if n == 0 {
                    bail!("{} must be greater than zero", ENV_PAGE_SIZE);
                }
                n
            }
            None => defaults.page_size,
        };

        let continue_on_error = match get(ENV_CONTINUE_ON_ERROR) {
            Some(v) => parse_bool(&v)
                .with_context(|| format!("invalid {} value {:?}", ENV_CONTINUE_ON_ERROR, v))?,
            None => defaults.continue_on_error,
        };

        let http_timeout = match get(ENV_HTTP_TIMEOUT_SECS) {
            Some(v) => {
                let secs: u64 = v.trim().parse().with_context(|| {
                    format!("{} must be a number of seconds, got {:?}", ENV_HTTP_TIMEOUT_SECS, v)
                })?;
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        let any_of = match get(ENV_NAME_ANY_OF) {
            Some(v) => v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => default_filter.any_of,
        };
        if any_of.is_empty() {
            bail!("{} must list at least one name fragment", ENV_NAME_ANY_OF);
        }

        let filter = NameFilter {
            any_of,
            marker: get(ENV_NAME_MARKER).unwrap_or(default_filter.marker),
            excluded: get(ENV_NAME_EXCLUDED).unwrap_or(default_filter.excluded),
        };

        Ok(Config {
            token_file: get(ENV_TOKEN_FILE)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("token.json")),
            client_secret_file: get(ENV_CLIENT_SECRET_FILE)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("credentials.json")),
            http_timeout,
            migration: MigrationConfig {
                workdir: get(ENV_WORKDIR).map(PathBuf::from).unwrap_or(defaults.workdir),
                filter,
                page_size,
                continue_on_error,
            },
        })
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected true or false, got {:?}", other),
    }
}
