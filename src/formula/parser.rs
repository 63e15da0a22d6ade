//! Formula Loading
//!
//! Reads authored formulas from YAML and keeps them in a [`FormulaLibrary`]
//! so `extends` references can be resolved by name.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};

use super::model::Formula;
use crate::error::{Error, Result};

/// Loads a single formula from a YAML file.
pub fn load_formula(path: impl AsRef<Path>) -> Result<Formula> {
    let path = path.as_ref();
    info!("Loading formula from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read formula file '{}': {}",
            path.display(),
            e
        ))
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());
    parse_formula(&yaml_content)
}

/// Parses a formula from YAML text.
pub fn parse_formula(yaml: &str) -> Result<Formula> {
    let formula: Formula = serde_yaml::from_str(yaml)?;
    if formula.name.trim().is_empty() {
        return Err(Error::Config("formula has an empty name".to_string()));
    }
    debug!(
        "Parsed formula '{}' with {} steps",
        formula.name,
        formula.steps.len()
    );
    Ok(formula)
}

/// Saves a formula to a YAML file.
pub fn save_formula(formula: &Formula, path: impl AsRef<Path>) -> Result<()> {
    let yaml_content = serde_yaml::to_string(formula)?;
    fs::write(path.as_ref(), yaml_content)?;
    info!("Formula saved to: {}", path.as_ref().display());
    Ok(())
}

/// Named collection of authored formulas.
#[derive(Debug, Clone, Default)]
pub struct FormulaLibrary {
    formulas: BTreeMap<String, Formula>,
}

impl FormulaLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.yaml`/`*.yml` file in `dir`.
    ///
    /// A missing directory yields an empty library. Files that fail to parse
    /// are skipped with a warning so one bad formula cannot hide the rest.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut library = Self::new();

        if !dir.exists() {
            warn!("Formula directory {} does not exist", dir.display());
            return Ok(library);
        }

        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        for path in paths {
            match load_formula(&path) {
                Ok(formula) => library.insert(formula),
                Err(e) => warn!("Skipping formula {}: {}", path.display(), e),
            }
        }

        info!("Formula library loaded: {} formulas", library.len());
        Ok(library)
    }

    /// Adds or replaces a formula by name.
    pub fn insert(&mut self, formula: Formula) {
        self.formulas.insert(formula.name.clone(), formula);
    }

    pub fn get(&self, name: &str) -> Option<&Formula> {
        self.formulas.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.formulas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::model::FormulaStep;
    use tempfile::tempdir;

    #[test]
    fn test_load_formula_file_not_found() {
        assert!(load_formula("/nonexistent/path/f.formula.yaml").is_err());
    }

    #[test]
    fn test_parse_formula_invalid_yaml() {
        assert!(parse_formula("this is not valid yaml: [[[").is_err());
    }

    #[test]
    fn test_parse_formula_empty_name() {
        assert!(matches!(parse_formula("formula: ' '\n"), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load_dir() {
        let temp_dir = tempdir().unwrap();
        let formula = Formula::new("mol-a").with_step(FormulaStep::new("one", "One"));
        save_formula(&formula, temp_dir.path().join("mol-a.formula.yaml")).unwrap();
        std::fs::write(temp_dir.path().join("broken.yaml"), "steps: [[[").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "ignored").unwrap();

        let library = FormulaLibrary::load_dir(temp_dir.path()).unwrap();
        assert_eq!(library.len(), 1);
        assert_eq!(library.get("mol-a").unwrap().steps[0].id, "one");
    }

    #[test]
    fn test_load_missing_dir_is_empty() {
        let library = FormulaLibrary::load_dir("/nonexistent/formulas").unwrap();
        assert!(library.is_empty());
    }
}
