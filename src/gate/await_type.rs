//! Await Types
//!
//! The condition a gate waits on, parsed once from its string form when the
//! gate is created and stored as a tagged variant from then on.
//!
//! | String form               | Variant            | Closed by          |
//! |---------------------------|--------------------|--------------------|
//! | `cooldown:5m`             | `Cooldown`         | elapsed time       |
//! | `timer:<rfc3339>`         | `Timer`            | elapsed time       |
//! | `pr-merge:42`, `gh:pr:42` | `PullRequestMerge` | polling plugin     |
//! | `gh:run:<id>`             | `CiRun`            | polling plugin     |
//! | `human`                   | `Human`            | explicit close     |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{format_duration, parse_duration};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum AwaitType {
    /// Self-closes `duration` after the gate was created
    Cooldown { duration: Duration },
    /// Self-closes at a fixed instant
    Timer { until: DateTime<Utc> },
    /// Pull request with this number merges
    PullRequestMerge { number: u64 },
    /// CI run with this id finishes successfully
    CiRun { run_id: String },
    /// A person closes the gate
    Human,
}

impl AwaitType {
    /// Instant at which a time-based gate closes itself.
    pub fn deadline(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            AwaitType::Cooldown { duration } => {
                let delta = chrono::Duration::from_std(*duration).ok()?;
                created_at.checked_add_signed(delta)
            }
            AwaitType::Timer { until } => Some(*until),
            _ => None,
        }
    }

    /// True for gates that close on elapsed time alone.
    pub fn is_self_closing(&self) -> bool {
        matches!(self, AwaitType::Cooldown { .. } | AwaitType::Timer { .. })
    }

    /// True for gates a polling plugin evaluates against an external system.
    pub fn is_external(&self) -> bool {
        matches!(self, AwaitType::PullRequestMerge { .. } | AwaitType::CiRun { .. })
    }
}

impl fmt::Display for AwaitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AwaitType::Cooldown { duration } => write!(f, "cooldown:{}", format_duration(*duration)),
            AwaitType::Timer { until } => write!(f, "timer:{}", until.to_rfc3339()),
            AwaitType::PullRequestMerge { number } => write!(f, "pr-merge:{}", number),
            AwaitType::CiRun { run_id } => write!(f, "gh:run:{}", run_id),
            AwaitType::Human => f.write_str("human"),
        }
    }
}

impl FromStr for AwaitType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "human" {
            return Ok(AwaitType::Human);
        }

        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| format!("await type '{}' has no ':' separator", s))?;
        if value.is_empty() {
            return Err(format!("await type '{}' has an empty identifier", s));
        }

        match kind {
            "cooldown" => Ok(AwaitType::Cooldown {
                duration: parse_duration(value)?,
            }),
            "timer" => DateTime::parse_from_rfc3339(value)
                .map(|t| AwaitType::Timer {
                    until: t.with_timezone(&Utc),
                })
                .map_err(|e| format!("invalid timer instant '{}': {}", value, e)),
            "pr-merge" => parse_pr_number(value),
            "gh" => match value.split_once(':') {
                Some(("pr", number)) => parse_pr_number(number),
                Some(("run", run_id)) if !run_id.is_empty() => Ok(AwaitType::CiRun {
                    run_id: run_id.to_string(),
                }),
                _ => Err(format!("unknown GitHub await type '{}'", s)),
            },
            _ => Err(format!("unknown await type '{}'", kind)),
        }
    }
}

fn parse_pr_number(value: &str) -> Result<AwaitType, String> {
    value
        .trim_start_matches('#')
        .parse::<u64>()
        .map(|number| AwaitType::PullRequestMerge { number })
        .map_err(|_| format!("invalid pull request number '{}'", value))
}

impl TryFrom<String> for AwaitType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AwaitType> for String {
    fn from(value: AwaitType) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_variants() {
        assert_eq!(
            "pr-merge:42".parse::<AwaitType>().unwrap(),
            AwaitType::PullRequestMerge { number: 42 }
        );
        assert_eq!(
            "gh:pr:#7".parse::<AwaitType>().unwrap(),
            AwaitType::PullRequestMerge { number: 7 }
        );
        assert_eq!(
            "gh:run:9913".parse::<AwaitType>().unwrap(),
            AwaitType::CiRun { run_id: "9913".into() }
        );
        assert_eq!(
            "cooldown:5m".parse::<AwaitType>().unwrap(),
            AwaitType::Cooldown { duration: Duration::from_secs(300) }
        );
        assert_eq!("human".parse::<AwaitType>().unwrap(), AwaitType::Human);
        assert!(matches!(
            "timer:2026-03-01T12:00:00Z".parse::<AwaitType>().unwrap(),
            AwaitType::Timer { .. }
        ));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "pr-merge", "pr-merge:", "pr-merge:abc", "gh:issue:3", "mail:x", "cooldown:soon"] {
            assert!(bad.parse::<AwaitType>().is_err(), "accepted '{}'", bad);
        }
    }

    #[test]
    fn test_display_is_canonical() {
        let parsed: AwaitType = "gh:pr:42".parse().unwrap();
        assert_eq!(parsed.to_string(), "pr-merge:42");
        let cooldown: AwaitType = "cooldown:90s".parse().unwrap();
        assert_eq!(cooldown.to_string(), "cooldown:1m30s");
    }

    #[test]
    fn test_serde_uses_string_form() {
        let json = serde_json::to_string(&AwaitType::PullRequestMerge { number: 42 }).unwrap();
        assert_eq!(json, "\"pr-merge:42\"");
        let back: AwaitType = serde_json::from_str("\"gh:run:5\"").unwrap();
        assert_eq!(back, AwaitType::CiRun { run_id: "5".into() });
        assert!(serde_json::from_str::<AwaitType>("\"bogus\"").is_err());
    }

    #[test]
    fn test_deadline() {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let cooldown = AwaitType::Cooldown { duration: Duration::from_secs(60) };
        assert_eq!(cooldown.deadline(t), Some(t + chrono::Duration::seconds(60)));
        assert!(cooldown.is_self_closing());

        let pr = AwaitType::PullRequestMerge { number: 1 };
        assert_eq!(pr.deadline(t), None);
        assert!(pr.is_external());
    }
}
