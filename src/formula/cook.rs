//! Formula Cooking
//!
//! `cook` flattens a formula and its `extends` chain into a
//! [`Protomolecule`]. Parents are merged first, in the order listed; a step
//! redefined later replaces the earlier one in place, keeping its original
//! position. Cooking is pure, so results are cached by name and version.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, info};

use super::model::{Formula, FormulaKey, ProtoStep, Protomolecule, VarDef};
use super::parser::FormulaLibrary;
use super::validator::{resolve_exit, validate_steps};
use crate::error::CompileError;

/// Accumulated result of merging one level of the `extends` chain.
#[derive(Default)]
struct Merged {
    vars: BTreeMap<String, VarDef>,
    steps: Vec<ProtoStep>,
    exit: Option<String>,
}

impl Merged {
    fn absorb(&mut self, other: Merged) {
        self.vars.extend(other.vars);
        for step in other.steps {
            self.put_step(step);
        }
        if other.exit.is_some() {
            self.exit = other.exit;
        }
    }

    fn put_step(&mut self, step: ProtoStep) {
        match self.steps.iter_mut().find(|s| s.id == step.id) {
            Some(existing) => *existing = step,
            None => self.steps.push(step),
        }
    }
}

/// Cooks `formula` into an immutable template.
///
/// Parents named in `extends` are looked up in `library`.
pub fn cook(formula: &Formula, library: &FormulaLibrary) -> Result<Protomolecule, CompileError> {
    let mut stack = Vec::new();
    let merged = resolve(formula, library, &mut stack)?;

    validate_steps(&formula.name, &merged.steps)?;
    let exit = resolve_exit(&formula.name, &merged.steps, merged.exit.as_deref())?;

    info!(
        "Cooked {} into {} steps (exit: {})",
        formula.key(),
        merged.steps.len(),
        exit
    );

    Ok(Protomolecule::new(
        formula.key(),
        formula.description.clone(),
        merged.vars,
        merged.steps,
        exit,
    ))
}

fn resolve(
    formula: &Formula,
    library: &FormulaLibrary,
    stack: &mut Vec<String>,
) -> Result<Merged, CompileError> {
    if stack.contains(&formula.name) {
        return Err(CompileError::ExtendsCycle(formula.name.clone()));
    }
    stack.push(formula.name.clone());

    let mut merged = Merged::default();
    for parent_name in &formula.extends {
        let parent = library
            .get(parent_name)
            .ok_or_else(|| CompileError::UnknownFormula(parent_name.clone()))?;
        debug!("Formula '{}' extends '{}'", formula.name, parent_name);
        merged.absorb(resolve(parent, library, stack)?);
    }

    // Duplicates inside one authored list are mistakes, not overrides
    let mut own_ids = HashSet::new();
    for step in &formula.steps {
        if !own_ids.insert(step.id.as_str()) {
            return Err(CompileError::DuplicateStep {
                formula: formula.name.clone(),
                step: step.id.clone(),
            });
        }
    }

    merged.absorb(Merged {
        vars: formula.vars.clone(),
        steps: formula
            .steps
            .iter()
            .map(|s| ProtoStep {
                id: s.id.clone(),
                title: s.title.clone(),
                description: s.description.clone(),
                needs: s.needs.clone(),
            })
            .collect(),
        exit: formula.exit.clone(),
    });

    stack.pop();
    Ok(merged)
}

/// Cache of cooked templates keyed by formula name and version.
///
/// Returned templates are shared behind [`Arc`]; every pour copies what it
/// needs, so instances never share mutable state.
#[derive(Debug, Default)]
pub struct Cookbook {
    cache: Mutex<HashMap<FormulaKey, Arc<Protomolecule>>>,
}

impl Cookbook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached template for `formula`, cooking it on first use.
    pub fn cook(
        &self,
        formula: &Formula,
        library: &FormulaLibrary,
    ) -> Result<Arc<Protomolecule>, CompileError> {
        let key = formula.key();
        if let Some(hit) = self.lock().get(&key) {
            debug!("Cook cache hit for {}", key);
            return Ok(Arc::clone(hit));
        }

        let proto = Arc::new(cook(formula, library)?);
        self.lock().entry(key).or_insert_with(|| Arc::clone(&proto));
        Ok(proto)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FormulaKey, Arc<Protomolecule>>> {
        // A panic while holding the lock cannot leave a half-written entry
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
