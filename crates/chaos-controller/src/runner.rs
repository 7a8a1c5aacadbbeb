//! Experiment runner: reconciles until the experiment is stopped
//!
//! The experiment stops when its `duration` elapses, when the shutdown
//! token is cancelled (Ctrl-C), when the manifest asks for it or when a pass
//! fails as a whole. A stopped experiment is reconciled until every record is
//! recovered or gone or given up on, then the runner returns. Cancelling the
//! abort token leaves immediately, even while recovering.

use std::sync::Arc;

use chaos_core::{ChaosError, Phase, Result};
use log::{info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::experiment::{DesiredState, Experiment};
use crate::reconciler::Reconciler;
use crate::store::ExperimentStore;

pub struct ExperimentRunner {
    reconciler: Arc<Reconciler>,
    store: ExperimentStore,
    abort: CancellationToken,
}

impl ExperimentRunner {
    pub fn new(reconciler: Arc<Reconciler>, store: ExperimentStore) -> Self {
        Self {
            reconciler,
            store,
            abort: CancellationToken::new(),
        }
    }

    /// Give up on recovery and return as soon as `token` is cancelled
    pub fn abort_on(mut self, token: CancellationToken) -> Self {
        self.abort = token;
        self
    }

    fn abandon(&self, experiment: &Experiment) -> Result<Experiment> {
        warn!(
            "Aborting {} with {} records still injected",
            experiment.name,
            experiment.status.count(Phase::Injected)
        );
        self.store.save(experiment)?;
        Err(ChaosError::Cancelled)
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<Experiment> {
        let mut experiment = self.store.load()?;
        let deadline = experiment.duration()?.map(|d| Instant::now() + d);
        let resync = self.reconciler.config().resync_interval;
        let mut stopping = experiment.spec.desired == DesiredState::Stop;
        let mut pass = 0u64;

        info!(
            "Running {} ({} on {})",
            experiment.name,
            experiment.spec.fault.kind,
            experiment.spec.selector.namespace
        );

        loop {
            if pass > 0
                && let Err(e) = self
                    .store
                    .refresh_spec(&mut experiment, self.reconciler.registry())
            {
                warn!("Ignoring manifest update: {}", e);
            }
            if stopping {
                experiment.spec.desired = DesiredState::Stop;
            }
            stopping = experiment.spec.desired == DesiredState::Stop;
            pass += 1;

            let result = tokio::select! {
                result = self.reconciler.reconcile(&mut experiment) => result,
                _ = self.abort.cancelled() => return self.abandon(&experiment),
            };
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) if !stopping && experiment.status.count(Phase::Injected) > 0 => {
                    warn!("Pass over {} failed, recovering: {}", experiment.name, e);
                    stopping = true;
                    self.store.save(&experiment)?;
                    continue;
                }
                Err(e) => {
                    self.store.save(&experiment)?;
                    return Err(e);
                }
            };
            self.store.save(&experiment)?;

            if stopping && outcome.converged() {
                let left = experiment.status.count(Phase::Injected);
                if left == 0 {
                    info!("{} recovered after {} passes", experiment.name, pass);
                } else {
                    warn!(
                        "{} stopped with {} records still injected",
                        experiment.name, left
                    );
                }
                return Ok(experiment);
            }

            let wait = outcome.requeue_after.unwrap_or(resync).min(resync);
            let expire = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.abort.cancelled() => return self.abandon(&experiment),
                _ = shutdown.cancelled(), if !stopping => {
                    info!("Stop requested; recovering {}", experiment.name);
                    stopping = true;
                }
                _ = expire, if !stopping => {
                    info!("Duration of {} elapsed; recovering", experiment.name);
                    stopping = true;
                }
            }
        }
    }
}
