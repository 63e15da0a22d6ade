//! Plugin Specifications
//!
//! Declarative plugin settings loaded from YAML:
//!
//! ```yaml
//! name: gate-poller
//! gate:
//!   cooldown: 2m
//! tracking:
//!   labels: [plugin, gates]
//!   digest: true
//! execution:
//!   timeout: 30s
//!   severity: high
//!   notify_on_failure: true
//!   escalate_after: 3
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::compact_duration;
use crate::error::{Error, Result};
use crate::monitoring::notify::Severity;

/// Cooldown gate settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    /// At most one run per interval
    #[serde(with = "compact_duration")]
    pub cooldown: Duration,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TrackingConfig {
    /// Attached to every run record and digest
    pub labels: Vec<String>,
    /// Append a digest to the ledger for each run
    pub digest: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    #[serde(with = "compact_duration")]
    pub timeout: Duration,
    pub severity: Severity,
    pub notify_on_failure: bool,
    /// Consecutive failures before a notification goes out
    pub escalate_after: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            severity: Severity::default(),
            notify_on_failure: true,
            escalate_after: 3,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub gate: GateConfig,

    #[serde(default)]
    pub tracking: TrackingConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl PluginSpec {
    pub fn new(name: impl Into<String>, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            gate: GateConfig { cooldown },
            tracking: TrackingConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.execution.timeout = timeout;
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tracking.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_digest(mut self) -> Self {
        self.tracking.digest = true;
        self
    }

    pub fn escalate_after(mut self, failures: u32) -> Self {
        self.execution.escalate_after = failures;
        self
    }

    /// Owner recorded on this plugin's cooldown gates.
    pub fn owner(&self) -> String {
        format!("plugin:{}", self.name)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("plugin name must not be empty".to_string()));
        }
        if self.gate.cooldown.is_zero() {
            return Err(Error::Config(format!("plugin {} has a zero cooldown", self.name)));
        }
        if self.execution.timeout.is_zero() {
            return Err(Error::Config(format!("plugin {} has a zero timeout", self.name)));
        }
        Ok(())
    }
}

pub fn parse_plugin(yaml: &str) -> Result<PluginSpec> {
    let spec: PluginSpec = serde_yaml::from_str(yaml)?;
    spec.validate()?;
    Ok(spec)
}

pub fn load_plugin(path: impl AsRef<Path>) -> Result<PluginSpec> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    parse_plugin(&content)
}

/// Loads every `*.yaml`/`*.yml` plugin spec in `dir`, sorted by name.
///
/// Files that fail to parse are skipped with a warning.
pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<PluginSpec>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        debug!("Plugin directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let mut specs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e == "yaml" || e == "yml");
        if !is_yaml {
            continue;
        }
        match load_plugin(&path) {
            Ok(spec) => specs.push(spec),
            Err(e) => warn!("Skipping plugin {}: {}", path.display(), e),
        }
    }

    specs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(specs)
}
