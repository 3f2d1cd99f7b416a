//! Scanner pass: pulls treasury transfers from the configured source and
//! materializes them as purchase attempts. Dedup on `(sale_id, txid)` makes
//! every pass idempotent.

use crate::validate::{validate_transfer, Verdict};
use crate::PassReport;
use ghostpass_chain::{TransferSource, TreasuryTransfer};
use ghostpass_core::{PurchaseAttempt, Sale, SaleStatus, ValidationStatus};
use ghostpass_storage::{AttemptStore, SaleStore};
use tracing::{debug, warn};

fn attempt_from_transfer(
    sale: &Sale,
    transfer: &TreasuryTransfer,
    status: ValidationStatus,
    reason: Option<String>,
    buyer_addr_hash: Option<[u8; 20]>,
) -> PurchaseAttempt {
    PurchaseAttempt {
        sale_id: sale.id,
        txid: transfer.txid.clone(),
        buyer_address: transfer.from_address.clone(),
        buyer_addr_hash: buyer_addr_hash.map(hex::encode),
        amount: transfer.value,
        block_hash: transfer.block_hash.clone(),
        block_number: transfer.block_number,
        block_timestamp: transfer.block_timestamp,
        log_index: transfer.log_index,
        validation_status: status,
        invalid_reason: reason,
        accepted: false,
        confirmations: 0,
        accepting_block_hash: None,
        accepting_blue_score: None,
        provisional_rank: None,
        final_rank: None,
    }
}

/// One scanner pass over every live sale. Adapter failures are recorded per
/// sale and never abort the pass.
pub async fn run_scanner_pass<S>(store: &S, source: &dyn TransferSource) -> PassReport
where
    S: SaleStore + AttemptStore,
{
    let mut report = PassReport::default();
    let sales = match store.sales_in_status(&[SaleStatus::Live]).await {
        Ok(sales) => sales,
        Err(err) => {
            warn!("scanner could not list live sales: {err:#}");
            report.errors.push((uuid::Uuid::nil(), err.to_string()));
            return report;
        }
    };

    for sale in sales {
        report.sales += 1;
        let transfers = match source.list_transfers(&sale.treasury_address).await {
            Ok(transfers) => transfers,
            Err(err) => {
                warn!(sale = %sale.id, "transfer source failed: {err}");
                report.errors.push((sale.id, err.to_string()));
                continue;
            }
        };
        let types = match store.ticket_types(sale.id).await {
            Ok(types) => types,
            Err(err) => {
                report.errors.push((sale.id, err.to_string()));
                continue;
            }
        };
        let allowed = sale.allowed_amounts(&types);

        for transfer in transfers {
            match validate_transfer(&sale, &allowed, &transfer) {
                Verdict::Drop => continue,
                Verdict::Materialize {
                    status,
                    reason,
                    buyer_addr_hash,
                } => {
                    let attempt =
                        attempt_from_transfer(&sale, &transfer, status, reason, buyer_addr_hash);
                    match store.insert_attempt(&attempt).await {
                        Ok(true) => {
                            report.new_attempts += 1;
                            debug!(sale = %sale.id, txid = %attempt.txid,
                                   status = attempt.validation_status.as_str(),
                                   "new purchase attempt");
                        }
                        Ok(false) => {}
                        Err(err) => report.errors.push((sale.id, err.to_string())),
                    }
                }
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{solved_transfer, MemStore, StaticTransfers};
    use ghostpass_chain::TreasuryTransfer;
    use ghostpass_core::ValidationStatus;

    #[tokio::test]
    async fn scanner_materializes_and_deduplicates_attempts() {
        let store = MemStore::new();
        let sale = store.add_live_sale(1_000_000, 1);

        let good = solved_transfer(&sale, "tx-good", 1_000_000, "kaspa:qbuyer").await;
        let wrong_amount = TreasuryTransfer {
            txid: "tx-short".into(),
            from_address: None,
            to_address: sale.treasury_address.clone(),
            value: 500_000,
            block_hash: None,
            block_number: None,
            block_timestamp: None,
            log_index: None,
            payload: None,
        };
        let source = StaticTransfers::new(vec![good, wrong_amount]);

        let report = run_scanner_pass(&store, &source).await;
        assert_eq!(report.new_attempts, 2);
        assert!(report.errors.is_empty());

        let good_attempt = store.attempt(&sale.id, "tx-good");
        assert_eq!(good_attempt.validation_status, ValidationStatus::Valid);
        assert!(good_attempt.buyer_addr_hash.is_some());
        let short = store.attempt(&sale.id, "tx-short");
        assert_eq!(
            short.validation_status,
            ValidationStatus::InvalidMissingPayload
        );

        // Re-running the pass observes the same transfers and inserts nothing.
        let second = run_scanner_pass(&store, &source).await;
        assert_eq!(second.new_attempts, 0);
    }

    #[tokio::test]
    async fn scanner_records_source_errors_per_sale() {
        let store = MemStore::new();
        let sale = store.add_live_sale(1_000_000, 1);
        let source = StaticTransfers::failing();
        let report = run_scanner_pass(&store, &source).await;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, sale.id);
    }
}
