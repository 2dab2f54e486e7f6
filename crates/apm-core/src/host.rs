//! Host and deployed revision reported with error events

use crate::config::{Config, ConfigKey};
use std::sync::OnceLock;

/// Environment variable set by Heroku to the deployed commit
pub const HEROKU_SLUG_COMMIT: &str = "HEROKU_SLUG_COMMIT";

static OS_HOSTNAME: OnceLock<String> = OnceLock::new();

/// Configured hostname, else the OS hostname
pub fn detect_hostname(config: &Config) -> String {
    config
        .get_as::<String>(ConfigKey::Hostname)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| os_hostname().to_string())
}

fn os_hostname() -> &'static str {
    OS_HOSTNAME.get_or_init(|| {
        hostname::get()
            .map(|h: std::ffi::OsString| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    })
}

/// Configured revision sha, else `HEROKU_SLUG_COMMIT`, else empty
pub fn detect_revision_sha(config: &Config) -> String {
    revision_sha_from(config, |name| std::env::var(name).ok())
}

fn revision_sha_from<F>(config: &Config, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    config
        .get_as::<String>(ConfigKey::RevisionSha)
        .filter(|sha| !sha.is_empty())
        .or_else(|| lookup(HEROKU_SLUG_COMMIT))
        .unwrap_or_default()
}
