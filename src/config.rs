//! Engine Configuration
//!
//! Settings shared by every process that touches a ledger: where the ledger
//! and authored files live, how hard to retry on push conflicts, and how
//! agent bead ids are prefixed per scope.
//!
//! # Example YAML
//!
//! ```yaml
//! ledger_path: .molegate/ledger.json
//! formula_dir: formulas
//! plugin_dir: plugins
//! conflict_retries: 8
//! default_prefix: gt
//! prefixes:
//!   gastown: gt
//!   beads: bd
//! stale_after: 30m
//! conditions_path: .molegate/conditions.yaml
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable overriding the engine home directory.
pub const HOME_ENV: &str = "MOLEGATE_HOME";

/// File the built-in gate poller reads external condition states from.
pub const CONDITIONS_FILE: &str = "conditions.yaml";

/// Engine home directory: `$MOLEGATE_HOME`, else `./.molegate`.
pub static MOLEGATE_HOME: Lazy<PathBuf> = Lazy::new(|| match std::env::var_os(HOME_ENV) {
    Some(dir) if !dir.is_empty() => PathBuf::from(dir),
    _ => PathBuf::from(".molegate"),
});

/// Top-level engine configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// JSON file backing the file ledger
    pub ledger_path: PathBuf,

    /// Directory searched for `*.formula.yaml`
    pub formula_dir: PathBuf,

    /// Directory searched for plugin specs
    pub plugin_dir: PathBuf,

    /// Pull/reapply attempts before a push conflict is given up on
    pub conflict_retries: usize,

    /// Bead id prefix for scopes missing from `prefixes`
    pub default_prefix: String,

    /// Scope name -> bead id prefix
    pub prefixes: BTreeMap<String, String>,

    /// In-progress steps older than this with no open gate count as stalled
    #[serde(with = "compact_duration")]
    pub stale_after: Duration,

    /// Upper bound on plugins executing concurrently within one tick
    pub max_parallel_plugins: usize,

    /// YAML map of external condition states read by the gate poller
    pub conditions_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let home = MOLEGATE_HOME.clone();
        Self {
            ledger_path: home.join("ledger.json"),
            formula_dir: home.join("formulas"),
            plugin_dir: home.join("plugins"),
            conflict_retries: 8,
            default_prefix: "gt".to_string(),
            prefixes: BTreeMap::new(),
            stale_after: Duration::from_secs(30 * 60),
            max_parallel_plugins: num_cpus::get(),
            conditions_path: home.join(CONDITIONS_FILE),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file; missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    /// Loads `config.yaml` from the home directory if present.
    pub fn load_or_default() -> Result<Self> {
        let path = MOLEGATE_HOME.join("config.yaml");
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.conflict_retries == 0 {
            return Err(Error::Config("conflict_retries must be at least 1".to_string()));
        }
        if self.default_prefix.trim().is_empty() {
            return Err(Error::Config("default_prefix must not be empty".to_string()));
        }
        if self.max_parallel_plugins == 0 {
            return Err(Error::Config("max_parallel_plugins must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Bead id prefix for a scope.
    pub fn prefix_for(&self, scope: &str) -> &str {
        self.prefixes
            .get(scope)
            .map(String::as_str)
            .unwrap_or(&self.default_prefix)
    }
}

/// Parses compact durations such as `45s`, `5m`, `1h30m` or `2d`.
///
/// A bare number is read as seconds.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total_ms: u64 = 0;
    let mut digits = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(format!("invalid duration '{}'", text));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{}'", text))?;
        digits.clear();

        let unit_ms = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1
            }
            's' => 1_000,
            'm' => 60_000,
            'h' => 3_600_000,
            'd' => 86_400_000,
            _ => return Err(format!("unknown unit '{}' in duration '{}'", c, text)),
        };
        total_ms = value
            .checked_mul(unit_ms)
            .and_then(|v| total_ms.checked_add(v))
            .ok_or_else(|| format!("duration '{}' overflows", text))?;
    }

    if !digits.is_empty() {
        return Err(format!("duration '{}' is missing a unit after {}", text, digits));
    }
    Ok(Duration::from_millis(total_ms))
}

/// Formats a duration in the largest whole units, e.g. `1h30m`.
///
/// Durations are millisecond-granular. A sub-millisecond remainder rounds
/// up, so a non-zero duration never formats as `0s`.
pub fn format_duration(duration: Duration) -> String {
    let mut ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if duration.subsec_nanos() % 1_000_000 != 0 {
        ms = ms.saturating_add(1);
    }
    if ms == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit, size) in [("d", 86_400_000), ("h", 3_600_000), ("m", 60_000), ("s", 1_000), ("ms", 1)] {
        if ms >= size {
            out.push_str(&format!("{}{}", ms / size, unit));
            ms %= size;
        }
    }
    out
}

/// Serde adapter for compact duration strings.
pub mod compact_duration {
    use std::time::Duration;

    use serde::de::{self, Deserializer};
    use serde::{Deserialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = serde_yaml::Value::deserialize(deserializer)?;
        match raw {
            serde_yaml::Value::String(s) => super::parse_duration(&s).map_err(de::Error::custom),
            serde_yaml::Value::Number(n) => n
                .as_u64()
                .map(Duration::from_secs)
                .ok_or_else(|| de::Error::custom("duration seconds must be a positive integer")),
            _ => Err(de::Error::custom("expected a duration string such as '5m'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("1h30").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1s500ms");
    }

    #[test]
    fn test_format_duration_millisecond_granularity() {
        assert_eq!(format_duration(Duration::from_micros(1500)), "2ms");
        assert_eq!(format_duration(Duration::from_nanos(1)), "1ms");

        let huge = format_duration(Duration::MAX);
        assert!(huge.ends_with("ms"));
        assert!(parse_duration(&huge).is_ok());
    }

    #[test]
    fn test_prefix_lookup() {
        let mut config = EngineConfig::default();
        config.prefixes.insert("beads".to_string(), "bd".to_string());

        assert_eq!(config.prefix_for("beads"), "bd");
        assert_eq!(config.prefix_for("gastown"), "gt");
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "conflict_retries: 3\nstale_after: 10m\nconditions_path: /srv/conditions.yaml\nprefixes:\n  gastown: gt\n",
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.conflict_retries, 3);
        assert_eq!(config.conditions_path, PathBuf::from("/srv/conditions.yaml"));
        assert_eq!(config.stale_after, Duration::from_secs(600));
        assert_eq!(config.default_prefix, "gt");
    }

    #[test]
    fn test_load_rejects_zero_retries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "conflict_retries: 0\n").unwrap();

        assert!(matches!(EngineConfig::load(&path), Err(Error::Config(_))));
    }
}
