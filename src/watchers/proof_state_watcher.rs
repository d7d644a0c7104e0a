//! Proof state watcher
//!
//! Reconciles inflight proofs with the mint and moves pending operations
//! forward once the mint has settled them: a send whose proofs were claimed is
//! finalized, a pending melt is re-checked with its payment rail.
//!
//! Unless `watch_existing_inflight_on_start` is set, proofs already inflight
//! when the watcher first starts are left alone, together with the operations
//! holding them, until they leave the inflight state.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::config::ProofStateWatcherConfig;
use crate::errors::WalletResult;
use crate::operations::{MeltEngine, MeltPendingDecision, SendEngine};
use crate::services::{ProofReconcileReport, ProofService};
use crate::types::{MeltState, ProofData, SendState};

use super::PollTask;

const NAME: &str = "proof state watcher";

/// What one cycle changed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProofStateCycle {
    pub proofs: ProofReconcileReport,
    pub finalized_sends: Vec<String>,
    /// Melt operations that reached a terminal state
    pub settled_melts: Vec<String>,
}

struct Targets {
    proofs: Arc<ProofService>,
    send: Arc<SendEngine>,
    melt: Arc<MeltEngine>,
    /// Inflight secrets found on first start; `None` until then
    excluded: Mutex<Option<HashSet<String>>>,
}

pub struct ProofStateWatcher {
    targets: Arc<Targets>,
    config: ProofStateWatcherConfig,
    task: PollTask,
}

impl ProofStateWatcher {
    pub fn new(
        proofs: Arc<ProofService>,
        send: Arc<SendEngine>,
        melt: Arc<MeltEngine>,
        config: ProofStateWatcherConfig,
    ) -> Self {
        Self {
            targets: Arc::new(Targets {
                proofs,
                send,
                melt,
                excluded: Mutex::new(None),
            }),
            config,
            task: PollTask::default(),
        }
    }

    pub async fn start(&self) -> WalletResult<()> {
        if self.config.disabled || self.is_running() {
            return Ok(());
        }
        if self.targets.excluded().is_none() {
            let existing: HashSet<String> = if self.config.watch_existing_inflight_on_start {
                HashSet::new()
            } else {
                self.targets
                    .proofs
                    .get_inflight_proofs(None)
                    .await?
                    .into_iter()
                    .map(|p| p.secret)
                    .collect()
            };
            if !existing.is_empty() {
                log::info!("Leaving {} inflight proofs from before start unwatched", existing.len());
            }
            let mut excluded = self.targets.excluded();
            if excluded.is_none() {
                *excluded = Some(existing);
            }
        }

        let targets = self.targets.clone();
        self.task.start(
            NAME,
            Duration::from_millis(self.config.interval_ms),
            move || {
                let targets = targets.clone();
                async move {
                    if let Err(e) = targets.cycle().await {
                        log::warn!("Proof state check failed: {}", e);
                    }
                }
            },
        );
        Ok(())
    }

    pub fn stop(&self) {
        self.task.stop(NAME);
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Run one cycle now
    pub async fn check_once(&self) -> WalletResult<ProofStateCycle> {
        self.targets.cycle().await
    }
}

impl Targets {
    fn excluded(&self) -> MutexGuard<'_, Option<HashSet<String>>> {
        self.excluded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop secrets that left the inflight state and return what remains
    fn prune_excluded(&self, inflight: &[ProofData]) -> HashSet<String> {
        let mut guard = self.excluded();
        let Some(excluded) = guard.as_mut() else {
            return HashSet::new();
        };
        let current: HashSet<&str> = inflight.iter().map(|p| p.secret.as_str()).collect();
        excluded.retain(|s| current.contains(s.as_str()));
        excluded.clone()
    }

    async fn cycle(&self) -> WalletResult<ProofStateCycle> {
        let inflight = self.proofs.get_inflight_proofs(None).await?;
        let excluded = self.prune_excluded(&inflight);
        let watched: Vec<ProofData> = inflight
            .into_iter()
            .filter(|p| !excluded.contains(&p.secret))
            .collect();
        let mut cycle = ProofStateCycle {
            proofs: self.proofs.reconcile_proofs(watched).await?,
            ..Default::default()
        };
        let holds_excluded = |secrets: &[String]| secrets.iter().any(|s| excluded.contains(s));

        for op in self.send.get_pending_operations().await? {
            if op.state != SendState::Pending
                || self.send.is_operation_locked(&op.id)
                || holds_excluded(&op.send_secrets)
            {
                continue;
            }
            match self.send.finalize(&op.id).await {
                Ok(op) if op.state == SendState::Finalized => cycle.finalized_sends.push(op.id),
                Ok(_) => {}
                Err(e) => log::warn!("Finalizing send {} failed: {}", op.id, e),
            }
        }

        for op in self.melt.get_pending_melts().await? {
            if op.state != MeltState::Pending
                || self.melt.is_operation_locked(&op.id)
                || holds_excluded(&op.input_secrets)
            {
                continue;
            }
            match self.melt.check_pending_melt_by_quote(&op.quote_id).await {
                Ok(Some(MeltPendingDecision::StayPending)) | Ok(None) => {}
                Ok(Some(_)) => cycle.settled_melts.push(op.id),
                Err(e) => log::warn!("Checking melt {} failed: {}", op.id, e),
            }
        }

        if !cycle.finalized_sends.is_empty() || !cycle.settled_melts.is_empty() {
            log::info!(
                "Proof state check: {} sends finalized, {} melts settled",
                cycle.finalized_sends.len(),
                cycle.settled_melts.len()
            );
        }
        Ok(cycle)
    }
}

impl Drop for ProofStateWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
