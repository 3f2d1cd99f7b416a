//! The deterministic ordering and commitment engine: validation, acceptance
//! tracking, ranking, allocation freeze and live projections, plus the
//! self-gated background loops that drive them.

pub mod allocation;
pub mod ranker;
pub mod scanner;
pub mod stats;
pub mod tickets;
pub mod tracker;
pub mod validate;

#[cfg(test)]
mod testutil;

use ghostpass_chain::{AcceptanceSource, TransferSource};
use ghostpass_storage::{AttemptStore, SaleStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub use tracker::DEFAULT_ACCEPTANCE_BATCH;

/// Outcome of one background pass. Per-sale errors are collected here and
/// never abort the pass or its loop.
#[derive(Debug, Default)]
pub struct PassReport {
    pub sales: usize,
    pub new_attempts: u64,
    pub newly_accepted: u64,
    pub newly_final: u64,
    pub rank_changes: u64,
    pub errors: Vec<(Uuid, String)>,
}

fn log_report(pass: &str, report: &PassReport) {
    if report.errors.is_empty() {
        debug!(
            pass,
            sales = report.sales,
            new_attempts = report.new_attempts,
            newly_accepted = report.newly_accepted,
            newly_final = report.newly_final,
            rank_changes = report.rank_changes,
            "pass complete"
        );
    } else {
        for (sale, err) in &report.errors {
            warn!(pass, sale = %sale, "pass error: {err}");
        }
    }
}

/// Owns the background loops. Each loop is self-gated: a new pass starts only
/// after the previous one finished and the interval elapsed.
pub struct Engine<S> {
    store: Arc<S>,
    transfers: Arc<dyn TransferSource>,
    acceptance: Arc<dyn AcceptanceSource>,
    poll_interval: Duration,
    acceptance_batch: usize,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transfers: self.transfers.clone(),
            acceptance: self.acceptance.clone(),
            poll_interval: self.poll_interval,
            acceptance_batch: self.acceptance_batch,
        }
    }
}

impl<S> Engine<S>
where
    S: SaleStore + AttemptStore + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<S>,
        transfers: Arc<dyn TransferSource>,
        acceptance: Arc<dyn AcceptanceSource>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            transfers,
            acceptance,
            poll_interval,
            acceptance_batch: DEFAULT_ACCEPTANCE_BATCH,
        }
    }

    /// Spawns the scanner, tracker and ranker loops.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let report =
                    scanner::run_scanner_pass(engine.store.as_ref(), engine.transfers.as_ref())
                        .await;
                log_report("scanner", &report);
                tokio::time::sleep(engine.poll_interval).await;
            }
        }));

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let report = tracker::run_tracker_pass(
                    engine.store.as_ref(),
                    engine.acceptance.as_ref(),
                    engine.acceptance_batch,
                )
                .await;
                log_report("tracker", &report);
                tokio::time::sleep(engine.poll_interval).await;
            }
        }));

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let report = ranker::run_ranker_pass(engine.store.as_ref()).await;
                log_report("ranker", &report);
                tokio::time::sleep(engine.poll_interval).await;
            }
        }));

        handles
    }
}
