//! Acceptance tracker: walks valid attempts that have not yet reached the
//! finality depth and folds in the adapter's acceptance data.

use crate::PassReport;
use ghostpass_chain::{AcceptanceSource, TxAcceptance};
use ghostpass_core::{PurchaseAttempt, SaleStatus};
use ghostpass_storage::{AttemptStore, SaleStore};
use std::collections::HashMap;
use tracing::{debug, warn};

pub const DEFAULT_ACCEPTANCE_BATCH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptanceDelta {
    pub accepted: bool,
    pub confirmations: u32,
    pub accepting_block_hash: Option<String>,
    pub hash_changed: bool,
    pub newly_accepted: bool,
    pub newly_final: bool,
}

/// How an acceptance record moves an attempt. Pure; the caller decides what
/// to persist.
pub fn acceptance_delta(
    attempt: &PurchaseAttempt,
    record: &TxAcceptance,
    finality_depth: u32,
) -> AcceptanceDelta {
    let hash_changed = record.accepting_block_hash.is_some()
        && record.accepting_block_hash != attempt.accepting_block_hash;
    AcceptanceDelta {
        accepted: record.is_accepted,
        confirmations: record.confirmations,
        accepting_block_hash: record
            .accepting_block_hash
            .clone()
            .or_else(|| attempt.accepting_block_hash.clone()),
        hash_changed,
        newly_accepted: record.is_accepted && !attempt.accepted,
        newly_final: record.confirmations >= finality_depth
            && attempt.confirmations < finality_depth,
    }
}

/// One tracker pass over every live sale that has not frozen its allocation.
pub async fn run_tracker_pass<S>(
    store: &S,
    acceptance: &dyn AcceptanceSource,
    batch_size: usize,
) -> PassReport
where
    S: SaleStore + AttemptStore,
{
    let mut report = PassReport::default();
    let sales = match store.sales_in_status(&[SaleStatus::Live]).await {
        Ok(sales) => sales,
        Err(err) => {
            warn!("tracker could not list live sales: {err:#}");
            report.errors.push((uuid::Uuid::nil(), err.to_string()));
            return report;
        }
    };

    for sale in sales {
        if sale.allocation_frozen {
            continue;
        }
        report.sales += 1;
        let pending = match store.pending_acceptance(sale.id, sale.finality_depth).await {
            Ok(pending) => pending,
            Err(err) => {
                report.errors.push((sale.id, err.to_string()));
                continue;
            }
        };

        for chunk in pending.chunks(batch_size.max(1)) {
            let txids: Vec<String> = chunk.iter().map(|a| a.txid.clone()).collect();
            let records = match acceptance.transaction_acceptance(&txids).await {
                Ok(records) => records,
                Err(err) => {
                    warn!(sale = %sale.id, "acceptance query failed: {err}");
                    report.errors.push((sale.id, err.to_string()));
                    continue;
                }
            };
            let by_txid: HashMap<&str, &TxAcceptance> =
                records.iter().map(|r| (r.txid.as_str(), r)).collect();

            for attempt in chunk {
                // Attempts the adapter does not know about yet stay untouched.
                let Some(record) = by_txid.get(attempt.txid.as_str()).copied() else {
                    continue;
                };
                let delta = acceptance_delta(attempt, record, sale.finality_depth);

                let mut blue_score = None;
                if delta.hash_changed {
                    if let Some(hash) = delta.accepting_block_hash.as_deref() {
                        match acceptance.block_blue_score(hash).await {
                            Ok(score) => {
                                if let (Some(new), Some(old)) =
                                    (score, attempt.accepting_blue_score)
                                {
                                    if new < old {
                                        debug!(sale = %sale.id, txid = %attempt.txid,
                                               old, new, "accepting block moved to a lower blue score");
                                    }
                                }
                                blue_score = score;
                            }
                            Err(err) => {
                                report.errors.push((sale.id, err.to_string()));
                                continue;
                            }
                        }
                    }
                }

                if let Err(err) = store
                    .apply_acceptance(
                        sale.id,
                        &attempt.txid,
                        delta.accepted,
                        delta.confirmations,
                        delta.accepting_block_hash.as_deref(),
                        blue_score,
                    )
                    .await
                {
                    report.errors.push((sale.id, err.to_string()));
                    continue;
                }
                if delta.newly_accepted {
                    report.newly_accepted += 1;
                }
                if delta.newly_final {
                    report.newly_final += 1;
                }
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MemStore, StaticAcceptance};
    use ghostpass_core::ValidationStatus;

    #[tokio::test]
    async fn tracker_promotes_attempts_through_acceptance_and_finality() {
        let store = MemStore::new();
        let sale = store.add_live_sale(1_000_000, 1);
        store.add_attempt(&sale.id, "tx-1", ValidationStatus::Valid, |_| {});

        let mut acceptance = StaticAcceptance::new();
        acceptance.record("tx-1", true, Some("block-a"), 1);
        acceptance.blue_score("block-a", 500);

        let report = run_tracker_pass(&store, &acceptance, DEFAULT_ACCEPTANCE_BATCH).await;
        assert_eq!(report.newly_accepted, 1);
        assert_eq!(report.newly_final, 0);
        let attempt = store.attempt(&sale.id, "tx-1");
        assert!(attempt.accepted);
        assert_eq!(attempt.confirmations, 1);
        assert_eq!(attempt.accepting_block_hash.as_deref(), Some("block-a"));
        assert_eq!(attempt.accepting_blue_score, Some(500));

        // Finality depth for this sale is 2; a deeper confirmation makes the
        // attempt newly final exactly once.
        let mut acceptance = StaticAcceptance::new();
        acceptance.record("tx-1", true, Some("block-a"), 3);
        let report = run_tracker_pass(&store, &acceptance, DEFAULT_ACCEPTANCE_BATCH).await;
        assert_eq!(report.newly_accepted, 0);
        assert_eq!(report.newly_final, 1);
        // Once final, the attempt leaves the pending set.
        let report = run_tracker_pass(&store, &acceptance, DEFAULT_ACCEPTANCE_BATCH).await;
        assert_eq!(report.newly_final, 0);
    }

    #[tokio::test]
    async fn reorg_to_lower_blue_score_overwrites() {
        let store = MemStore::new();
        let sale = store.add_live_sale(1_000_000, 1);
        store.add_attempt(&sale.id, "tx-1", ValidationStatus::Valid, |a| {
            a.accepted = true;
            a.confirmations = 1;
            a.accepting_block_hash = Some("block-high".into());
            a.accepting_blue_score = Some(900);
        });

        let mut acceptance = StaticAcceptance::new();
        acceptance.record("tx-1", true, Some("block-low"), 1);
        acceptance.blue_score("block-low", 400);
        run_tracker_pass(&store, &acceptance, DEFAULT_ACCEPTANCE_BATCH).await;

        let attempt = store.attempt(&sale.id, "tx-1");
        assert_eq!(attempt.accepting_block_hash.as_deref(), Some("block-low"));
        assert_eq!(attempt.accepting_blue_score, Some(400));
    }

    #[tokio::test]
    async fn missing_records_leave_attempts_unchanged_and_errors_do_not_abort() {
        let store = MemStore::new();
        let sale = store.add_live_sale(1_000_000, 1);
        store.add_attempt(&sale.id, "tx-unknown", ValidationStatus::Valid, |_| {});

        let acceptance = StaticAcceptance::new();
        let report = run_tracker_pass(&store, &acceptance, DEFAULT_ACCEPTANCE_BATCH).await;
        assert_eq!(report.newly_accepted, 0);
        assert!(!store.attempt(&sale.id, "tx-unknown").accepted);

        let failing = StaticAcceptance::failing();
        let report = run_tracker_pass(&store, &failing, DEFAULT_ACCEPTANCE_BATCH).await;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, sale.id);
    }

    #[tokio::test]
    async fn frozen_sales_are_skipped() {
        let store = MemStore::new();
        let sale = store.add_live_sale(1_000_000, 1);
        store.freeze(&sale.id);
        store.add_attempt(&sale.id, "tx-1", ValidationStatus::Valid, |_| {});

        let mut acceptance = StaticAcceptance::new();
        acceptance.record("tx-1", true, Some("block-a"), 9);
        let report = run_tracker_pass(&store, &acceptance, DEFAULT_ACCEPTANCE_BATCH).await;
        assert_eq!(report.sales, 0);
        assert!(!store.attempt(&sale.id, "tx-1").accepted);
    }
}
