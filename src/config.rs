use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Runtime settings, read from `ROOMLEDGER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub hostel: String,
    pub metrics_port: Option<u16>,
    /// `None` when auditing is switched off (interval 0).
    pub audit_interval: Option<Duration>,
    pub coalesce_window: Duration,
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            hostel: "main".into(),
            metrics_port: None,
            audit_interval: Some(Duration::from_secs(30)),
            coalesce_window: Duration::from_millis(50),
            compact_threshold: 1000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take the default; unparsable
    /// values take the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let audit_secs: u64 = parse_or(&lookup, "ROOMLEDGER_AUDIT_INTERVAL_SECS", 30);
        Self {
            data_dir: lookup("ROOMLEDGER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            hostel: lookup("ROOMLEDGER_HOSTEL")
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(defaults.hostel),
            metrics_port: lookup("ROOMLEDGER_METRICS_PORT").and_then(|raw| match raw.trim().parse() {
                Ok(port) => Some(port),
                Err(e) => {
                    warn!("invalid ROOMLEDGER_METRICS_PORT={raw:?} ({e}), metrics disabled");
                    None
                }
            }),
            audit_interval: (audit_secs > 0).then(|| Duration::from_secs(audit_secs)),
            coalesce_window: Duration::from_millis(parse_or(&lookup, "ROOMLEDGER_COALESCE_MS", 50)),
            compact_threshold: parse_or(&lookup, "ROOMLEDGER_COMPACT_THRESHOLD", defaults.compact_threshold),
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("roomledger.journal")
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    raw.trim().parse().unwrap_or_else(|e| {
        warn!("invalid {key}={raw:?} ({e}), using default {default}");
        default
    })
}
