//! Polecat Targets
//!
//! Worker identities are addressed as `<scope>/polecats/<name>`. Anything
//! else is rejected before any ledger access.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const POLECATS: &str = "polecats";

/// A parsed `<scope>/polecats/<name>` identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolecatTarget {
    pub scope: String,
    pub name: String,
}

impl PolecatTarget {
    pub fn parse(text: &str) -> Result<Self> {
        let segments: Vec<&str> = text.split('/').collect();
        match segments.as_slice() {
            [scope, middle, name]
                if *middle == POLECATS && valid_segment(scope) && valid_segment(name) =>
            {
                Ok(Self {
                    scope: scope.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(Error::TargetFormat(text.to_string())),
        }
    }

    /// Agent bead id, e.g. `gt-gastown-polecat-Toast`.
    pub fn bead_id(&self, prefix: &str) -> String {
        format!("{}-{}-polecat-{}", prefix, self.scope, self.name)
    }
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.chars().any(char::is_whitespace)
}

impl fmt::Display for PolecatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.scope, POLECATS, self.name)
    }
}

impl FromStr for PolecatTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
