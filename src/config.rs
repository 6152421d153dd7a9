//! Server-level configuration and dynamic defaulting.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory name appended to the chosen root for all persistent state.
pub const STORE_DIR_NAME: &str = "jetstream";

/// Default disk budget when none is configured: 1 TiB.
pub const MAX_STORE_DEFAULT: i64 = 1024 * 1024 * 1024 * 1024;

/// Memory budget fallback when total system memory cannot be determined:
/// 256 MiB.
pub const MAX_MEMORY_DEFAULT: i64 = 1024 * 1024 * 256;

/// Server-wide resource configuration. `max_memory` and `max_store` are in
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JetStreamConfig {
    pub max_memory: i64,
    pub max_store: i64,
    pub store_dir: PathBuf,
}

impl JetStreamConfig {
    /// Builds a dynamic configuration: 75% of system memory, the default
    /// disk budget, and a repeatable temp-based storage directory unless a
    /// root was supplied.
    pub fn dynamic(store_root: Option<&Path>) -> Self {
        let store_dir = match store_root {
            Some(root) => root.join(STORE_DIR_NAME),
            None => std::env::temp_dir().join(STORE_DIR_NAME),
        };
        let max_memory = match total_system_memory() {
            Some(total) if total > 0 => total / 4 * 3,
            _ => MAX_MEMORY_DEFAULT,
        };
        Self {
            max_memory,
            max_store: MAX_STORE_DEFAULT,
            store_dir,
        }
    }

    /// Applies defaulting rules to a caller-supplied configuration: both
    /// budgets must be positive or the whole config is rebuilt dynamically;
    /// an empty `store_dir` falls back to the temp-based default.
    pub(crate) fn normalize(config: Option<JetStreamConfig>) -> Self {
        let mut cfg = match config {
            Some(c) if c.max_memory > 0 && c.max_store > 0 => c,
            Some(c) => {
                let root = (!c.store_dir.as_os_str().is_empty()).then_some(c.store_dir);
                return Self::dynamic(root.as_deref());
            }
            None => return Self::dynamic(None),
        };
        if cfg.store_dir.as_os_str().is_empty() {
            cfg.store_dir = std::env::temp_dir().join(STORE_DIR_NAME);
        }
        cfg
    }
}

/// Total physical memory in bytes, if it can be determined.
fn total_system_memory() -> Option<i64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_total(&meminfo)
}

fn parse_mem_total(meminfo: &str) -> Option<i64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: i64 = line
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())?;
    Some(kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_defaults() {
        let cfg = JetStreamConfig::dynamic(None);
        assert_eq!(cfg.max_store, MAX_STORE_DEFAULT);
        assert!(cfg.max_memory > 0);
        assert!(cfg.store_dir.ends_with(STORE_DIR_NAME));
    }

    #[test]
    fn dynamic_respects_store_root() {
        let cfg = JetStreamConfig::dynamic(Some(Path::new("/data")));
        assert_eq!(cfg.store_dir, PathBuf::from("/data/jetstream"));
    }

    #[test]
    fn normalize_keeps_explicit_budgets() {
        let cfg = JetStreamConfig::normalize(Some(JetStreamConfig {
            max_memory: 1024,
            max_store: 2048,
            store_dir: PathBuf::from("/state"),
        }));
        assert_eq!(cfg.max_memory, 1024);
        assert_eq!(cfg.max_store, 2048);
        assert_eq!(cfg.store_dir, PathBuf::from("/state"));
    }

    #[test]
    fn normalize_rebuilds_on_nonpositive_budget() {
        let cfg = JetStreamConfig::normalize(Some(JetStreamConfig {
            max_memory: 0,
            max_store: 2048,
            store_dir: PathBuf::from("/state"),
        }));
        assert_eq!(cfg.max_store, MAX_STORE_DEFAULT);
        assert_eq!(cfg.store_dir, PathBuf::from("/state/jetstream"));
    }

    #[test]
    fn mem_total_parsing() {
        let sample = "MemTotal:        8168332 kB\nMemFree:  100 kB\n";
        assert_eq!(parse_mem_total(sample), Some(8168332 * 1024));
        assert_eq!(parse_mem_total("garbage"), None);
    }
}
