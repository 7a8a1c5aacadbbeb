//! Chaos lifecycle reconciler
//!
//! Drives every record of an experiment towards its desired phase:
//!
//! ```text
//! NotInjected --apply ok--> Injected --recover ok--> NotInjected
//!      any --target gone--> NotExist (terminal)
//! ```
//!
//! A pass plans one operation per record, runs the operations with bounded
//! parallelism and only then writes the observed phases back. A failing
//! record keeps its phase and gets a failure entry with backoff; it never
//! holds up the other records.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chaos_core::{ChaosError, Phase, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};

use crate::chaosimpl::{FaultContext, FaultImpl, ImplRegistry};
use crate::client::{DaemonConnector, HttpConnector};
use crate::decoder::Decoder;
use crate::experiment::{DesiredState, Experiment, Failure, Operation, Record, RecordId};
use crate::inventory::TargetResolver;

/// Reconciler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Deadline of every daemon RPC
    pub rpc_timeout: Duration,
    /// Records operated on concurrently within one pass
    pub max_parallel: usize,
    /// Interval between passes when nothing is pending
    pub resync_interval: Duration,
    /// First retry delay after a failure, doubled per attempt
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Attempts before a permanent failure is given up on
    pub max_attempts: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(10),
            max_parallel: 8,
            resync_interval: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            max_attempts: 3,
        }
    }
}

impl ReconcilerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(ChaosError::InvalidConfig(
                "max_parallel must be at least 1".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ChaosError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.rpc_timeout.is_zero() {
            return Err(ChaosError::InvalidConfig(
                "rpc_timeout must be greater than zero".to_string(),
            ));
        }

        if self.backoff_base > self.backoff_max {
            return Err(ChaosError::InvalidConfig(format!(
                "backoff base {:?} exceeds backoff max {:?}",
                self.backoff_base, self.backoff_max
            )));
        }

        Ok(())
    }

    /// Delay before retry number `attempts + 1`
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}

/// Longest retry delay written to a record
const MAX_RETRY_DELAY: Duration = Duration::from_secs(7 * 24 * 3600);

/// When a record whose last attempt failed at `now` may be retried
fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay.min(MAX_RETRY_DELAY))
        .unwrap_or_else(|_| chrono::Duration::days(7));
    now.checked_add_signed(delay).unwrap_or(now)
}

type ClaimSet = Arc<Mutex<HashSet<(String, RecordId)>>>;

/// Records with an Apply or Recover currently running, across all passes
#[derive(Clone, Default)]
pub struct InFlightRecords {
    claims: ClaimSet,
}

impl InFlightRecords {
    /// Claim a record; `None` if another operation holds it
    pub fn try_claim(&self, experiment: &str, id: &RecordId) -> Option<RecordClaim> {
        let key = (experiment.to_string(), id.clone());
        let mut claims = self.claims.lock().unwrap_or_else(|poison| poison.into_inner());
        if !claims.insert(key.clone()) {
            return None;
        }
        Some(RecordClaim {
            key,
            claims: self.claims.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.claims
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the record when dropped
pub struct RecordClaim {
    key: (String, RecordId),
    claims: ClaimSet,
}

impl Drop for RecordClaim {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(&self.key);
    }
}

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutcome {
    pub applied: usize,
    pub recovered: usize,
    /// Records that turned out to be gone
    pub gone: usize,
    pub failed: usize,
    /// Records skipped because another operation held them
    pub busy: usize,
    /// Records skipped while backing off
    pub waiting: usize,
    /// Records whose failure was given up on
    pub stalled: usize,
    /// When the next pass should run; `None` once nothing is pending
    pub requeue_after: Option<Duration>,
}

impl PassOutcome {
    pub fn converged(&self) -> bool {
        self.requeue_after.is_none()
    }

    fn requeue(&mut self, after: Duration) {
        self.requeue_after = Some(self.requeue_after.map_or(after, |d| d.min(after)));
    }
}

enum Gate {
    Ready,
    Waiting(Duration),
    Stalled,
}

/// The operation that moves `record` towards the desired state, if any
fn plan(record: &Record, desired: DesiredState, signature: &str) -> Option<Operation> {
    let wanted = desired == DesiredState::Run && record.selected;
    match record.phase {
        Phase::NotExist => None,
        Phase::NotInjected if wanted => Some(Operation::Apply),
        Phase::NotInjected => None,
        Phase::Injected if !wanted => Some(Operation::Recover),
        // Injected with an outdated spec: recover now, re-apply next pass
        Phase::Injected if record.signature.as_deref() != Some(signature) => {
            Some(Operation::Recover)
        }
        Phase::Injected => None,
    }
}

fn gate(record: &Record, op: Operation, signature: &str, now: DateTime<Utc>) -> Gate {
    match &record.failure {
        Some(f) if f.operation == op && f.signature == signature => {
            if f.gave_up {
                return Gate::Stalled;
            }
            match f.next_retry.map(|at| at - now) {
                Some(wait) if wait > chrono::Duration::zero() => {
                    Gate::Waiting(wait.to_std().unwrap_or_default())
                }
                _ => Gate::Ready,
            }
        }
        _ => Gate::Ready,
    }
}

pub struct Reconciler {
    config: ReconcilerConfig,
    registry: ImplRegistry,
    decoder: Decoder,
    in_flight: InFlightRecords,
}

impl Reconciler {
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ImplRegistry {
        &self.registry
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn in_flight(&self) -> &InFlightRecords {
        &self.in_flight
    }

    /// Apply the experiment's fault to record `index`.
    ///
    /// Returns the new phase: `Injected`, or `NotExist` if the target is
    /// gone. On error the caller keeps the record's previous phase.
    pub async fn apply(
        &self,
        index: usize,
        records: &[Record],
        experiment: &Experiment,
    ) -> Result<Phase> {
        self.run_claimed(index, records, experiment, Operation::Apply)
            .await
    }

    /// Recover record `index`.
    ///
    /// Returns `NotInjected`, or `NotExist` if the target is gone. One-shot
    /// kinds return `NotInjected` without contacting the daemon.
    pub async fn recover(
        &self,
        index: usize,
        records: &[Record],
        experiment: &Experiment,
    ) -> Result<Phase> {
        self.run_claimed(index, records, experiment, Operation::Recover)
            .await
    }

    async fn run_claimed(
        &self,
        index: usize,
        records: &[Record],
        experiment: &Experiment,
        op: Operation,
    ) -> Result<Phase> {
        let record = record_at(records, index)?;
        let fault = self.registry.build(&experiment.spec.fault)?;
        let _claim = self
            .in_flight
            .try_claim(&experiment.name, &record.id)
            .ok_or_else(|| ChaosError::Busy(record.id.to_string()))?;
        self.run(index, records, &fault, op).await
    }

    async fn run(
        &self,
        index: usize,
        records: &[Record],
        fault: &FaultImpl,
        op: Operation,
    ) -> Result<Phase> {
        let record = record_at(records, index)?;

        if op == Operation::Recover && fault.one_shot() {
            debug!("{} is one-shot; nothing to recover on {}", fault.kind(), record.id);
            return Ok(Phase::NotInjected);
        }

        let decoded = match self.decoder.decode(&record.id) {
            Ok(decoded) => decoded,
            Err(e) if e.is_target_gone() => {
                info!("{} is gone: {}", record.id, e);
                return Ok(Phase::NotExist);
            }
            Err(e) => return Err(e),
        };

        let ctx = FaultContext {
            daemon: decoded.daemon.as_ref(),
            target: &decoded.target,
            timeout: self.config.rpc_timeout,
        };
        debug!(
            "{} {} on {} ({} on node {})",
            op,
            fault.kind(),
            record.id,
            decoded.target.container_id,
            decoded.target.node
        );

        let result = match op {
            Operation::Apply => fault.apply(&ctx).await.map(|()| Phase::Injected),
            Operation::Recover => fault.recover(&ctx).await.map(|()| Phase::NotInjected),
        };

        match result {
            Err(e) if e.is_target_gone() => {
                info!("{} disappeared during {}: {}", record.id, op, e);
                Ok(Phase::NotExist)
            }
            other => other,
        }
    }

    /// Run one reconciliation pass over `experiment` and update its status.
    ///
    /// Errors only for problems of the experiment as a whole (invalid
    /// manifest, unknown kind, selector failure); per-record failures are
    /// recorded on the records.
    pub async fn reconcile(&self, experiment: &mut Experiment) -> Result<PassOutcome> {
        experiment.validate()?;
        let fault = self.registry.build(&experiment.spec.fault)?;
        let signature = experiment.spec.fault.signature();
        let desired = experiment.spec.desired;

        let resolver = self.decoder.resolver();
        if let Err(e) = resolver.refresh() {
            warn!("Inventory refresh failed, using the previous snapshot: {}", e);
        }
        if desired == DesiredState::Run {
            let selected = resolver.select(&experiment.spec.selector)?;
            experiment.status.sync_records(&selected);
        }

        let mut outcome = PassOutcome::default();
        let now = Utc::now();
        let mut work = Vec::new();

        for (index, record) in experiment.status.records.iter().enumerate() {
            let Some(op) = plan(record, desired, &signature) else {
                continue;
            };

            match gate(record, op, &signature, now) {
                Gate::Stalled => {
                    outcome.stalled += 1;
                    continue;
                }
                Gate::Waiting(_) => {
                    outcome.waiting += 1;
                    continue;
                }
                Gate::Ready => {}
            }

            match self.in_flight.try_claim(&experiment.name, &record.id) {
                Some(claim) => work.push((index, op, claim)),
                None => {
                    debug!("{} already has an operation in flight", record.id);
                    outcome.busy += 1;
                }
            }
        }

        let records = &experiment.status.records;
        let fault = &fault;
        let results: Vec<(usize, Operation, Result<Phase>)> = stream::iter(work)
            .map(|(index, op, claim)| async move {
                let result = self.run(index, records, fault, op).await;
                drop(claim);
                (index, op, result)
            })
            .buffer_unordered(self.config.max_parallel)
            .collect()
            .await;

        for (index, op, result) in results {
            let record = &mut experiment.status.records[index];
            self.observe(record, op, result, &signature, &mut outcome);
        }
        experiment.status.refresh_conditions();

        let now = Utc::now();
        for record in &experiment.status.records {
            let Some(op) = plan(record, desired, &signature) else {
                continue;
            };
            match gate(record, op, &signature, now) {
                Gate::Ready => outcome.requeue(Duration::ZERO),
                Gate::Waiting(wait) => outcome.requeue(wait),
                Gate::Stalled => {}
            }
        }

        info!(
            "{}: {} applied, {} recovered, {} gone, {} failed ({} injected of {})",
            experiment.name,
            outcome.applied,
            outcome.recovered,
            outcome.gone,
            outcome.failed,
            experiment.status.count(Phase::Injected),
            experiment.status.records.len()
        );
        Ok(outcome)
    }

    /// Write an operation's observed result back to its record
    fn observe(
        &self,
        record: &mut Record,
        op: Operation,
        result: Result<Phase>,
        signature: &str,
        outcome: &mut PassOutcome,
    ) {
        match result {
            Ok(Phase::NotExist) => {
                record.phase = Phase::NotExist;
                record.failure = None;
                outcome.gone += 1;
            }
            Ok(phase) => {
                record.phase = phase;
                record.failure = None;
                match op {
                    Operation::Apply => {
                        record.signature = Some(signature.to_string());
                        record.injected_count += 1;
                        outcome.applied += 1;
                    }
                    Operation::Recover => {
                        record.signature = None;
                        record.recovered_count += 1;
                        outcome.recovered += 1;
                    }
                }
            }
            Err(e) => {
                outcome.failed += 1;
                let attempts = match &record.failure {
                    Some(f) if f.operation == op && f.signature == signature => f.attempts + 1,
                    _ => 1,
                };
                let gave_up = !e.is_retryable() && attempts >= self.config.max_attempts;
                let next_retry =
                    (!gave_up).then(|| retry_at(Utc::now(), self.config.backoff(attempts)));

                if gave_up {
                    error!(
                        "Giving up {} of {} after {} attempts: {}",
                        op, record.id, attempts, e
                    );
                } else {
                    warn!("{} of {} failed (attempt {}): {}", op, record.id, attempts, e);
                }

                record.failure = Some(Failure {
                    operation: op,
                    attempts,
                    last_error: e.to_string(),
                    gave_up,
                    signature: signature.to_string(),
                    next_retry,
                });
            }
        }
    }
}

fn record_at(records: &[Record], index: usize) -> Result<&Record> {
    records.get(index).ok_or_else(|| {
        ChaosError::InvalidConfig(format!(
            "record index {} out of range ({} records)",
            index,
            records.len()
        ))
    })
}

/// Builder for [`Reconciler`]
pub struct ReconcilerBuilder {
    config: ReconcilerConfig,
    resolver: Arc<dyn TargetResolver>,
    connector: Option<Arc<dyn DaemonConnector>>,
    registry: Option<ImplRegistry>,
}

impl ReconcilerBuilder {
    pub fn new(resolver: Arc<dyn TargetResolver>) -> Self {
        Self {
            config: ReconcilerConfig::default(),
            resolver,
            connector: None,
            registry: None,
        }
    }

    pub fn config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    pub fn max_parallel(mut self, n: usize) -> Self {
        self.config.max_parallel = n;
        self
    }

    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.config.resync_interval = interval;
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.backoff_base = base;
        self.config.backoff_max = max;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    /// Replace the HTTP connector, e.g. with in-process fakes
    pub fn connector(mut self, connector: Arc<dyn DaemonConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn registry(mut self, registry: ImplRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Reconciler> {
        self.config.validate()?;

        let connector: Arc<dyn DaemonConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(HttpConnector::new(self.config.rpc_timeout)),
        };

        Ok(Reconciler {
            decoder: Decoder::new(self.resolver, connector),
            registry: self.registry.unwrap_or_else(ImplRegistry::builtin),
            in_flight: InFlightRecords::default(),
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Inventory;

    fn record(phase: Phase, signature: Option<&str>) -> Record {
        let mut record = Record::new(RecordId::new("web", "p0", "app"));
        record.phase = phase;
        record.signature = signature.map(str::to_string);
        record
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ReconcilerConfig {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(500));
        assert_eq!(config.backoff(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_time_is_clamped() {
        let now = Utc::now();
        assert_eq!(
            retry_at(now, Duration::from_millis(1500)),
            now + chrono::Duration::milliseconds(1500)
        );
        assert_eq!(retry_at(now, Duration::MAX), now + chrono::Duration::days(7));

        let config = ReconcilerConfig {
            backoff_base: Duration::from_secs(u64::MAX / 4),
            backoff_max: Duration::MAX,
            ..Default::default()
        };
        let at = retry_at(now, config.backoff(u32::MAX));
        assert!(at > now && at <= now + chrono::Duration::days(7));
    }

    #[test]
    fn test_failure_with_huge_backoff_is_recorded() {
        let reconciler = ReconcilerBuilder::new(Arc::new(Inventory::default()))
            .backoff(Duration::MAX, Duration::MAX)
            .build()
            .unwrap();
        let mut rec = record(Phase::NotInjected, None);
        let mut outcome = PassOutcome::default();

        reconciler.observe(
            &mut rec,
            Operation::Apply,
            Err(ChaosError::Connection("refused".to_string())),
            "s1",
            &mut outcome,
        );

        let failure = rec.failure.unwrap();
        assert_eq!(failure.attempts, 1);
        assert!(failure.next_retry.unwrap() > Utc::now());
        assert_eq!(outcome.failed, 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(ReconcilerConfig::default().validate().is_ok());

        let config = ReconcilerConfig {
            max_parallel: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ReconcilerConfig {
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_plan() {
        let run = DesiredState::Run;
        let stop = DesiredState::Stop;

        assert_eq!(plan(&record(Phase::NotInjected, None), run, "s1"), Some(Operation::Apply));
        assert_eq!(plan(&record(Phase::NotInjected, None), stop, "s1"), None);
        assert_eq!(plan(&record(Phase::Injected, Some("s1")), run, "s1"), None);
        assert_eq!(
            plan(&record(Phase::Injected, Some("s1")), stop, "s1"),
            Some(Operation::Recover)
        );
        assert_eq!(
            plan(&record(Phase::Injected, Some("s0")), run, "s1"),
            Some(Operation::Recover)
        );
        assert_eq!(plan(&record(Phase::NotExist, None), run, "s1"), None);

        let mut deselected = record(Phase::Injected, Some("s1"));
        deselected.selected = false;
        assert_eq!(plan(&deselected, run, "s1"), Some(Operation::Recover));
    }

    #[test]
    fn test_gate_respects_backoff_and_give_up() {
        let now = Utc::now();
        let mut rec = record(Phase::NotInjected, None);
        rec.failure = Some(Failure {
            operation: Operation::Apply,
            attempts: 1,
            last_error: "refused".to_string(),
            gave_up: false,
            signature: "s1".to_string(),
            next_retry: Some(now + chrono::Duration::seconds(30)),
        });
        assert!(matches!(gate(&rec, Operation::Apply, "s1", now), Gate::Waiting(_)));
        // a changed spec resets the failure
        assert!(matches!(gate(&rec, Operation::Apply, "s2", now), Gate::Ready));

        if let Some(f) = rec.failure.as_mut() {
            f.gave_up = true;
        }
        assert!(matches!(gate(&rec, Operation::Apply, "s1", now), Gate::Stalled));
    }

    #[test]
    fn test_claims_are_exclusive_until_dropped() {
        let in_flight = InFlightRecords::default();
        let id = RecordId::new("web", "p0", "app");

        let claim = in_flight.try_claim("exp", &id).unwrap();
        assert!(in_flight.try_claim("exp", &id).is_none());
        assert!(in_flight.try_claim("other", &id).is_some());

        drop(claim);
        assert!(in_flight.try_claim("exp", &id).is_some());
        assert!(in_flight.is_empty());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = ReconcilerBuilder::new(Arc::new(Inventory::default()))
            .max_attempts(0)
            .build();
        assert!(result.is_err());
    }
}
