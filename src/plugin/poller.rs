//! Gate Poller
//!
//! Built-in plugin that evaluates external gates. For each open gate whose
//! await type names an external event, the [`ConditionSource`] is asked for
//! the current state; satisfied gates are closed and their waiters woken.
//!
//! An unreachable source leaves the gate open and fails the run, so the
//! failure counts toward escalation and the gate is retried next interval.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use super::runner::{Plugin, PluginContext, PluginFuture, PluginOutcome};
use super::spec::PluginSpec;
use crate::error::{Error, Result};
use crate::gate::service;
use crate::gate::{AwaitType, Gate};
use crate::ledger::LedgerClient;

pub const GATE_POLLER: &str = "gate-poller";

/// Observed state of one external condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionState {
    Pending,
    /// Carries the close reason
    Satisfied(String),
}

/// Answers "has this happened yet?" for external await types.
///
/// Implementations return [`Error::ExternalUnavailable`] when the system
/// behind the condition cannot be reached.
pub trait ConditionSource: Send + Sync {
    fn check(&self, await_type: &AwaitType) -> Result<ConditionState>;
}

pub struct GatePoller {
    source: Arc<dyn ConditionSource>,
}

impl GatePoller {
    pub fn new(source: Arc<dyn ConditionSource>) -> Self {
        Self { source }
    }

    /// Spec used when no `gate-poller` spec is configured.
    pub fn default_spec() -> PluginSpec {
        PluginSpec::new(GATE_POLLER, Duration::from_secs(120))
            .with_timeout(Duration::from_secs(30))
            .with_labels(["plugin", "gates"])
    }
}

impl Plugin for GatePoller {
    fn run(&self, ctx: PluginContext) -> PluginFuture {
        let source = Arc::clone(&self.source);
        Box::pin(async move {
            // Checks block on the source; only the close pass touches the
            // ledger, and it is skipped when the run is dropped on timeout
            let client = ctx.client.clone();
            let checks = tokio::task::spawn_blocking(move || check_gates(&client, source.as_ref()))
                .await
                .map_err(|e| Error::InvalidState(format!("gate poller task failed: {}", e)))??;
            close_satisfied(&ctx, checks)
        })
    }
}

/// A gate together with what the source said about it.
pub struct GateCheck {
    pub gate: Gate,
    pub state: Result<ConditionState>,
}

/// Asks the source about every open external gate. Blocking.
pub fn check_gates(client: &LedgerClient, source: &dyn ConditionSource) -> Result<Vec<GateCheck>> {
    service::open_external(client)?
        .into_iter()
        .map(|gate| {
            let state = source.check(&gate.await_type);
            match state {
                Err(e) if !matches!(e, Error::ExternalUnavailable(_)) => Err(e),
                state => Ok(GateCheck { gate, state }),
            }
        })
        .collect()
}

/// Closes the satisfied gates from one round of checks.
pub fn close_satisfied(ctx: &PluginContext, checks: Vec<GateCheck>) -> Result<PluginOutcome> {
    let total = checks.len();
    let mut closed = 0;
    let mut unreachable = Vec::new();

    for GateCheck { gate, state } in checks {
        match state {
            Ok(ConditionState::Satisfied(reason)) => {
                service::close(&ctx.client, ctx.wake.as_ref(), &gate.id, &reason, ctx.now)?;
                closed += 1;
            }
            Ok(ConditionState::Pending) => debug!("Gate {} still waiting on {}", gate.id, gate.await_type),
            Err(e) => {
                warn!("Could not check gate {} ({}): {}", gate.id, gate.await_type, e);
                unreachable.push(gate.id);
            }
        }
    }

    if !unreachable.is_empty() {
        return Err(Error::ExternalUnavailable(format!(
            "{} of {} gates left unchecked: {}",
            unreachable.len(),
            total,
            unreachable.join(", ")
        )));
    }
    Ok(PluginOutcome::new(format!("checked {} gates, closed {}", total, closed)))
}

/// One polling pass over all open external gates.
pub fn poll_gates(ctx: &PluginContext, source: &dyn ConditionSource) -> Result<PluginOutcome> {
    let checks = check_gates(&ctx.client, source)?;
    close_satisfied(ctx, checks)
}

/// Default close reason for a satisfied condition.
pub fn satisfied_reason(await_type: &AwaitType) -> String {
    match await_type {
        AwaitType::PullRequestMerge { number } => format!("PR #{} merged", number),
        AwaitType::CiRun { run_id } => format!("CI run {} succeeded", run_id),
        other => format!("{} satisfied", other),
    }
}

/// Condition states read from a YAML map of await type to state, e.g.
/// `"pr-merge:42": merged`.
///
/// `merged`, `success`, `completed` and `satisfied` count as satisfied; any
/// other value or a missing key is pending. A missing file means the source
/// is unavailable.
#[derive(Debug, Clone)]
pub struct FileConditions {
    path: PathBuf,
}

impl FileConditions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConditionSource for FileConditions {
    fn check(&self, await_type: &AwaitType) -> Result<ConditionState> {
        let content = fs::read_to_string(&self.path).map_err(|e| {
            Error::ExternalUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        let states: BTreeMap<String, String> = serde_yaml::from_str(&content)?;

        let state = states
            .get(&await_type.to_string())
            .map(|s| s.trim().to_ascii_lowercase());
        Ok(match state.as_deref() {
            Some("merged" | "success" | "completed" | "satisfied") => {
                ConditionState::Satisfied(satisfied_reason(await_type))
            }
            _ => ConditionState::Pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::service::{create, status, GateRequest};
    use crate::gate::{ChannelWake, GateStatus, WakeSink};
    use crate::ledger::{LedgerClient, MemoryLedger};
    use chrono::Utc;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Source answering from a fixed table; `None` means unreachable.
    struct Table(Mutex<Option<BTreeMap<String, ConditionState>>>);

    impl ConditionSource for Table {
        fn check(&self, await_type: &AwaitType) -> Result<ConditionState> {
            let table = self.0.lock().unwrap();
            match table.as_ref() {
                Some(t) => Ok(t.get(&await_type.to_string()).cloned().unwrap_or(ConditionState::Pending)),
                None => Err(Error::ExternalUnavailable("forge unreachable".into())),
            }
        }
    }

    fn ctx(client: &LedgerClient, wake: Arc<dyn WakeSink>) -> PluginContext {
        PluginContext { client: client.clone(), wake, now: Utc::now() }
    }

    #[test]
    fn test_poller_closes_merged_pr_and_wakes() {
        let client = LedgerClient::new(Arc::new(MemoryLedger::new()), 4);
        let (wake, mut rx) = ChannelWake::new();
        let merged = create(
            &client,
            GateRequest::new("pr-merge:42".parse().unwrap()).waiter("w1"),
            Utc::now(),
        )
        .unwrap();
        let open = create(&client, GateRequest::new("pr-merge:7".parse().unwrap()), Utc::now()).unwrap();

        let mut table = BTreeMap::new();
        table.insert(
            "pr-merge:42".to_string(),
            ConditionState::Satisfied(satisfied_reason(&merged.await_type)),
        );
        let source = Table(Mutex::new(Some(table)));

        let outcome = poll_gates(&ctx(&client, Arc::new(wake)), &source).unwrap();
        assert_eq!(outcome.summary, "checked 2 gates, closed 1");
        assert_eq!(status(&client, &merged.id).unwrap(), GateStatus::Closed);
        assert_eq!(status(&client, &open.id).unwrap(), GateStatus::Open);
        assert_eq!(rx.try_recv().unwrap().waiter, "w1");

        let state = client.read().unwrap();
        assert_eq!(state.gate(&merged.id).unwrap().reason.as_deref(), Some("PR #42 merged"));
    }

    #[test]
    fn test_unreachable_source_leaves_gate_open() {
        let client = LedgerClient::new(Arc::new(MemoryLedger::new()), 4);
        let gate = create(&client, GateRequest::new("gh:run:99".parse().unwrap()), Utc::now()).unwrap();
        let source = Table(Mutex::new(None));

        let err = poll_gates(&ctx(&client, Arc::new(crate::gate::LogWake)), &source).unwrap_err();
        assert!(matches!(err, Error::ExternalUnavailable(_)));
        assert_eq!(status(&client, &gate.id).unwrap(), GateStatus::Open);
    }

    /// Source that reports every condition satisfied after a fixed delay.
    struct Delayed(Duration);

    impl ConditionSource for Delayed {
        fn check(&self, await_type: &AwaitType) -> Result<ConditionState> {
            std::thread::sleep(self.0);
            Ok(ConditionState::Satisfied(satisfied_reason(await_type)))
        }
    }

    #[tokio::test]
    async fn test_slow_source_times_out_without_closing() {
        use crate::plugin::runner::PluginRunner;

        let client = LedgerClient::new(Arc::new(MemoryLedger::new()), 4);
        let gate = create(&client, GateRequest::new("pr-merge:42".parse().unwrap()), Utc::now()).unwrap();

        let mut runner = PluginRunner::new(client.clone());
        runner.register(
            GatePoller::default_spec().with_timeout(Duration::from_millis(50)),
            Arc::new(GatePoller::new(Arc::new(Delayed(Duration::from_millis(600))))),
        );

        let started = std::time::Instant::now();
        let report = runner.tick_at(Utc::now()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(report.failed, vec![GATE_POLLER]);

        // The late answer is never committed
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(status(&client, &gate.id).unwrap(), GateStatus::Open);
    }

    #[tokio::test]
    async fn test_poller_plugin_closes_through_runner() {
        use crate::plugin::runner::PluginRunner;

        let client = LedgerClient::new(Arc::new(MemoryLedger::new()), 4);
        let gate = create(&client, GateRequest::new("gh:run:7".parse().unwrap()), Utc::now()).unwrap();

        let mut runner = PluginRunner::new(client.clone());
        runner.register(
            GatePoller::default_spec(),
            Arc::new(GatePoller::new(Arc::new(Delayed(Duration::ZERO)))),
        );

        let report = runner.tick_at(Utc::now()).await.unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(status(&client, &gate.id).unwrap(), GateStatus::Closed);
    }

    #[test]
    fn test_file_conditions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conditions.yaml");
        let source = FileConditions::new(&path);
        let pr: AwaitType = "pr-merge:42".parse().unwrap();

        assert!(matches!(source.check(&pr), Err(Error::ExternalUnavailable(_))));

        fs::write(&path, "\"pr-merge:42\": MERGED\n\"gh:run:5\": in_progress\n").unwrap();
        assert_eq!(
            source.check(&pr).unwrap(),
            ConditionState::Satisfied("PR #42 merged".into())
        );
        assert_eq!(
            source.check(&"gh:run:5".parse().unwrap()).unwrap(),
            ConditionState::Pending
        );
    }
}
