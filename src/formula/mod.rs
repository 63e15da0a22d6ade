//! Formula Module
//!
//! Authored workflow templates and the compiler that freezes them.
//!
//! # Structure
//!
//! - [`model`]: Formula, FormulaStep and the cooked Protomolecule
//! - [`parser`]: YAML loading and the name-indexed library
//! - [`validator`]: Dependency resolution and cycle detection
//! - [`cook`]: `extends` merging and the cook cache

pub mod cook;
pub mod model;
pub mod parser;
pub mod validator;

pub use cook::{cook, Cookbook};
pub use model::{Formula, FormulaKey, FormulaStep, ProtoStep, Protomolecule, VarDef};
pub use parser::{load_formula, parse_formula, FormulaLibrary};
