//! Workspace
//!
//! Everything one process needs to work against a ledger, assembled from an
//! [`EngineConfig`]: the ledger client, the formula library, the cook cache
//! and the plugin runner.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{info, warn};

use crate::config::EngineConfig;
use crate::error::{CompileError, Result};
use crate::formula::{Cookbook, FormulaLibrary, Protomolecule};
use crate::ledger::{FileLedger, Ledger, LedgerClient};
use crate::molecule::{self, Molecule};
use crate::plugin::{self, FileConditions, GatePoller, PluginRunner, GATE_POLLER};

pub struct Workspace {
    config: EngineConfig,
    client: LedgerClient,
    library: FormulaLibrary,
    cookbook: Cookbook,
}

impl Workspace {
    /// Opens the file ledger and formula library named by `config`.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let ledger = FileLedger::new(&config.ledger_path);
        info!("Ledger: {}", ledger.path().display());
        let library = FormulaLibrary::load_dir(&config.formula_dir)?;
        Ok(Self::with_ledger(config, Arc::new(ledger), library))
    }

    pub fn with_ledger(config: EngineConfig, ledger: Arc<dyn Ledger>, library: FormulaLibrary) -> Self {
        let client = LedgerClient::new(ledger, config.conflict_retries);
        Self {
            config,
            client,
            library,
            cookbook: Cookbook::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn client(&self) -> &LedgerClient {
        &self.client
    }

    pub fn library(&self) -> &FormulaLibrary {
        &self.library
    }

    pub fn cookbook(&self) -> &Cookbook {
        &self.cookbook
    }

    /// Cooked template for a library formula.
    pub fn proto(&self, name: &str) -> Result<Arc<Protomolecule>> {
        let formula = self
            .library
            .get(name)
            .ok_or_else(|| CompileError::UnknownFormula(name.to_string()))?;
        Ok(self.cookbook.cook(formula, &self.library)?)
    }

    pub fn pour(&self, formula: &str, vars: &BTreeMap<String, String>) -> Result<Molecule> {
        let proto = self.proto(formula)?;
        molecule::pour(&self.client, &proto, vars)
    }

    pub fn wisp(&self, formula: &str, vars: &BTreeMap<String, String>) -> Result<Molecule> {
        let proto = self.proto(formula)?;
        molecule::wisp(&self.client, &proto, vars)
    }

    /// Plugin runner with every spec from the plugin directory.
    ///
    /// The gate poller is always registered; a spec named `gate-poller`
    /// overrides its defaults. Specs with no built-in body are skipped.
    pub fn plugin_runner(&self) -> Result<PluginRunner> {
        let mut runner =
            PluginRunner::new(self.client.clone()).with_max_parallel(self.config.max_parallel_plugins);
        let conditions = FileConditions::new(self.config.conditions_path.clone());
        let poller = Arc::new(GatePoller::new(Arc::new(conditions)));

        let specs = plugin::load_dir(&self.config.plugin_dir)?;
        let poller_spec = specs
            .iter()
            .find(|s| s.name == GATE_POLLER)
            .cloned()
            .unwrap_or_else(GatePoller::default_spec);
        runner.register(poller_spec, poller);

        for spec in specs.iter().filter(|s| s.name != GATE_POLLER) {
            warn!("Plugin {} has no built-in body, skipping", spec.name);
        }
        Ok(runner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::parse_formula;
    use crate::formula::parser::save_formula;
    use tempfile::tempdir;

    const FORMULA: &str = r#"
formula: patrol
steps:
  - id: scan
    title: Scan {{scope}}
  - id: report
    title: Report
    needs: scan
vars:
  scope:
    default: town
"#;

    #[test]
    fn test_open_pours_from_library() {
        let dir = tempdir().unwrap();
        let formula_dir = dir.path().join("formulas");
        std::fs::create_dir_all(&formula_dir).unwrap();
        save_formula(&parse_formula(FORMULA).unwrap(), formula_dir.join("patrol.formula.yaml")).unwrap();

        let config = EngineConfig {
            ledger_path: dir.path().join("ledger.json"),
            formula_dir,
            plugin_dir: dir.path().join("plugins"),
            ..Default::default()
        };
        let workspace = Workspace::open(config).unwrap();

        let mol = workspace.pour("patrol", &BTreeMap::new()).unwrap();
        assert_eq!(mol.steps[0].title, "Scan town");
        assert!(dir.path().join("ledger.json").exists());

        // Second pour reuses the cooked template
        workspace.wisp("patrol", &BTreeMap::new()).unwrap();
        assert_eq!(workspace.cookbook().len(), 1);

        assert!(workspace.pour("missing", &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_plugin_runner_always_has_poller() {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            ledger_path: dir.path().join("ledger.json"),
            formula_dir: dir.path().join("formulas"),
            plugin_dir: dir.path().join("plugins"),
            ..Default::default()
        };
        let workspace = Workspace::open(config).unwrap();
        let runner = workspace.plugin_runner().unwrap();
        assert_eq!(runner.len(), 1);
        assert_eq!(runner.specs().next().unwrap().name, GATE_POLLER);
    }

    #[tokio::test]
    async fn test_poller_reads_configured_conditions() {
        use crate::gate::service::{create, status, GateRequest};
        use crate::gate::GateStatus;
        use chrono::Utc;

        let dir = tempdir().unwrap();
        let conditions_path = dir.path().join("forge").join("states.yaml");
        std::fs::create_dir_all(conditions_path.parent().unwrap()).unwrap();
        std::fs::write(&conditions_path, "\"pr-merge:42\": merged\n").unwrap();

        let config = EngineConfig {
            ledger_path: dir.path().join("ledger.json"),
            formula_dir: dir.path().join("formulas"),
            plugin_dir: dir.path().join("plugins"),
            conditions_path,
            ..Default::default()
        };
        let workspace = Workspace::open(config).unwrap();
        let gate = create(
            workspace.client(),
            GateRequest::new("pr-merge:42".parse().unwrap()),
            Utc::now(),
        )
        .unwrap();

        let report = workspace.plugin_runner().unwrap().tick().await.unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(status(workspace.client(), &gate.id).unwrap(), GateStatus::Closed);
    }
}
