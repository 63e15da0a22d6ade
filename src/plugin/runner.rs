//! Plugin Runner
//!
//! Executes periodic plugins under cooldown-gated rate limiting.
//!
//! # Tick
//!
//! 1. Close every time-based gate whose deadline passed
//! 2. In one ledger transaction, find plugins with no live cooldown gate and
//!    claim each by creating its next cooldown gate
//! 3. Run the claimed plugins concurrently, each under its timeout
//! 4. Persist the outcome (failure counters, optional digest), emit a run
//!    record and escalate repeated failures
//!
//! Claiming before running means a failing or hanging plugin still waits a
//! full cooldown, and two runner processes sharing a ledger cannot both run
//! the same interval: the loser's claim is reapplied on fresher state and
//! finds the gate.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::spec::PluginSpec;
use crate::error::{Error, Result};
use crate::gate::service::{insert_gate, sweep_elapsed, GateRequest};
use crate::gate::{AwaitType, LogWake, WakeSink};
use crate::ledger::{LedgerClient, LedgerState};
use crate::molecule::model::Digest;
use crate::monitoring::notify::{LogNotifier, Notification, Notifier};
use crate::monitoring::record::{LogRecords, RecordKind, RecordSink, RunRecord};

/// Per-plugin bookkeeping kept in the ledger.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginState {
    #[serde(default)]
    pub runs: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Successful plugin result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginOutcome {
    pub summary: String,
}

impl PluginOutcome {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
        }
    }
}

/// What a plugin body gets to work with.
#[derive(Clone)]
pub struct PluginContext {
    pub client: LedgerClient,
    pub wake: Arc<dyn WakeSink>,
    /// Tick time
    pub now: DateTime<Utc>,
}

pub type PluginFuture = Pin<Box<dyn Future<Output = Result<PluginOutcome>> + Send>>;

/// A periodic check routine.
///
/// The timeout only interrupts a body at an await point, so blocking work
/// belongs on `tokio::task::spawn_blocking`.
pub trait Plugin: Send + Sync {
    fn run(&self, ctx: PluginContext) -> PluginFuture;
}

struct Registered {
    spec: PluginSpec,
    body: Arc<dyn Plugin>,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Time-based gates closed by the sweep
    pub swept: Vec<String>,
    /// Plugins executed this tick
    pub ran: Vec<String>,
    /// Subset of `ran` that failed or timed out
    pub failed: Vec<String>,
    /// Plugins still cooling down
    pub cooling: Vec<String>,
}

pub struct PluginRunner {
    client: LedgerClient,
    plugins: Vec<Registered>,
    wake: Arc<dyn WakeSink>,
    records: Arc<dyn RecordSink>,
    notifier: Arc<dyn Notifier>,
    max_parallel: usize,
}

impl PluginRunner {
    pub fn new(client: LedgerClient) -> Self {
        Self {
            client,
            plugins: Vec::new(),
            wake: Arc::new(LogWake),
            records: Arc::new(LogRecords),
            notifier: Arc::new(LogNotifier),
            max_parallel: num_cpus::get(),
        }
    }

    pub fn with_wake(mut self, wake: Arc<dyn WakeSink>) -> Self {
        self.wake = wake;
        self
    }

    pub fn with_records(mut self, records: Arc<dyn RecordSink>) -> Self {
        self.records = records;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Registers a plugin, replacing any with the same name.
    pub fn register(&mut self, spec: PluginSpec, body: Arc<dyn Plugin>) {
        self.plugins.retain(|p| p.spec.name != spec.name);
        info!(
            "Registered plugin {} (cooldown {:?}, timeout {:?})",
            spec.name, spec.gate.cooldown, spec.execution.timeout
        );
        self.plugins.push(Registered { spec, body });
    }

    pub fn specs(&self) -> impl Iterator<Item = &PluginSpec> {
        self.plugins.iter().map(|p| &p.spec)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Runs one tick as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport {
            swept: sweep_elapsed(&self.client, self.wake.as_ref(), now)?,
            ..Default::default()
        };

        let claimed = self.claim_due(now)?;
        report.cooling = self
            .plugins
            .iter()
            .enumerate()
            .filter(|(i, _)| !claimed.contains(i))
            .map(|(_, p)| p.spec.name.clone())
            .collect();
        debug!("Tick at {}: due {:?}, cooling {:?}", now, claimed, report.cooling);

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut handles = Vec::with_capacity(claimed.len());
        for index in claimed {
            let plugin = &self.plugins[index];
            let ctx = PluginContext {
                client: self.client.clone(),
                wake: Arc::clone(&self.wake),
                now,
            };
            let task = execute(
                Arc::clone(&plugin.body),
                plugin.spec.name.clone(),
                plugin.spec.execution.timeout,
                ctx,
                Arc::clone(&semaphore),
            );
            handles.push((index, tokio::spawn(task)));
        }

        for (index, handle) in handles {
            let spec = &self.plugins[index].spec;
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::InvalidState(format!("plugin {} task failed: {}", spec.name, e))),
            };
            if result.is_err() {
                report.failed.push(spec.name.clone());
            }
            report.ran.push(spec.name.clone());
            self.settle(spec, result, now);
        }

        Ok(report)
    }

    /// Ticks every `every` until the process is stopped.
    pub async fn run(&self, every: Duration) {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                error!("Plugin tick failed: {}", e);
            }
        }
    }

    /// Claims every due plugin by creating its next cooldown gate.
    fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<usize>> {
        self.client.transact(|state| {
            let mut claimed = Vec::new();
            for (index, plugin) in self.plugins.iter().enumerate() {
                let owner = plugin.spec.owner();
                if cooling_down(state, &owner, now) {
                    continue;
                }
                prune_cooldowns(state, &owner);
                let request = GateRequest::new(AwaitType::Cooldown {
                    duration: plugin.spec.gate.cooldown,
                })
                .owner(owner);
                let gate = insert_gate(state, &request, now);
                debug!("Plugin {} claimed cooldown gate {}", plugin.spec.name, gate.id);
                claimed.push(index);
            }
            Ok(claimed)
        })
    }

    /// Persists the outcome, emits the run record and escalates.
    fn settle(&self, spec: &PluginSpec, result: Result<PluginOutcome>, now: DateTime<Utc>) {
        let (success, summary) = match &result {
            Ok(outcome) => (true, outcome.summary.clone()),
            Err(e) => (false, e.to_string()),
        };

        let persisted = self.client.transact(|state| {
            let entry = state.plugins.entry(spec.name.clone()).or_default();
            entry.runs += 1;
            entry.last_run = Some(now);
            if success {
                entry.consecutive_failures = 0;
                entry.last_success = Some(now);
                entry.last_error = None;
            } else {
                entry.consecutive_failures += 1;
                entry.last_error = Some(summary.clone());
            }
            let failures = entry.consecutive_failures;

            let digest = if spec.tracking.digest {
                let digest = Digest {
                    id: state.next_id("digest"),
                    source: spec.owner(),
                    labels: spec.tracking.labels.clone(),
                    summary: summary.clone(),
                    created_at: now,
                };
                state.digests.push(digest.clone());
                Some(digest.id)
            } else {
                None
            };
            Ok((failures, digest))
        });

        let mut record = RunRecord::new(RecordKind::Plugin, &spec.name, success, &summary, now)
            .with_labels(&spec.tracking.labels);

        let failures = match persisted {
            Ok((failures, digest)) => {
                if let Some(id) = digest {
                    record = record.with_digest(id);
                }
                Some(failures)
            }
            Err(e) => {
                error!("Could not record outcome of plugin {}: {}", spec.name, e);
                None
            }
        };
        self.records.record(&record);

        if success {
            info!("Plugin {} ran: {}", spec.name, summary);
            return;
        }
        warn!("Plugin {} failed: {}", spec.name, summary);

        let execution = &spec.execution;
        if let Some(failures) = failures {
            if execution.notify_on_failure && failures >= execution.escalate_after {
                self.notifier.notify(&Notification {
                    plugin: spec.name.clone(),
                    severity: execution.severity,
                    consecutive_failures: failures,
                    message: summary,
                });
            }
        }
    }
}

async fn execute(
    body: Arc<dyn Plugin>,
    name: String,
    limit: Duration,
    ctx: PluginContext,
    permits: Arc<Semaphore>,
) -> Result<PluginOutcome> {
    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|e| Error::InvalidState(format!("plugin {}: {}", name, e)))?;

    match tokio::time::timeout(limit, body.run(ctx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: format!("plugin {}", name),
            limit,
        }),
    }
}

/// True while `owner` has a cooldown gate that is open and not yet due.
///
/// An open gate past its deadline is closed here, so the claim does not
/// depend on a sweep having run first.
fn cooling_down(state: &mut LedgerState, owner: &str, now: DateTime<Utc>) -> bool {
    let mut cooling = false;
    for gate in state.gates.values_mut() {
        let ours = gate.owner.as_deref() == Some(owner)
            && matches!(gate.await_type, AwaitType::Cooldown { .. });
        if !ours || !gate.is_open() {
            continue;
        }
        if gate.has_elapsed(now) {
            gate.close("cooldown elapsed", now);
        } else {
            cooling = true;
        }
    }
    cooling
}

/// Drops `owner`'s closed cooldown gates; only the live one matters.
fn prune_cooldowns(state: &mut LedgerState, owner: &str) {
    state.gates.retain(|_, gate| {
        let ours = gate.owner.as_deref() == Some(owner)
            && matches!(gate.await_type, AwaitType::Cooldown { .. });
        !ours || gate.is_open()
    });
}
