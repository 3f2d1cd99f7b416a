//! Ranking pass: projects the sale's total attempt order onto stored ranks.
//! Recomputation is pure over a snapshot; the write path skips rows whose
//! ranks are already correct.

use crate::PassReport;
use anyhow::Result;
use ghostpass_core::{rank_attempts, RankAssignment, Sale, SaleStatus};
use ghostpass_storage::{AttemptStore, SaleStore};
use tracing::{debug, warn};

/// Read path: rank assignments for a sale at this moment, without mutating
/// anything.
pub async fn ranked_snapshot<S>(store: &S, sale: &Sale) -> Result<Vec<RankAssignment>>
where
    S: AttemptStore,
{
    let attempts = store.attempts_for_sale(sale.id).await?;
    Ok(rank_attempts(sale.ordering, &attempts, sale.finality_depth))
}

/// Recomputes and persists ranks for one sale. Returns the number of rows
/// that actually changed.
pub async fn rank_sale<S>(store: &S, sale: &Sale) -> Result<u64>
where
    S: AttemptStore,
{
    let assignments = ranked_snapshot(store, sale).await?;
    let changed = store.write_ranks(sale.id, &assignments).await?;
    if changed > 0 {
        debug!(sale = %sale.id, changed, "ranks updated");
    }
    Ok(changed)
}

/// One ranker pass over every live, unfrozen sale.
pub async fn run_ranker_pass<S>(store: &S) -> PassReport
where
    S: SaleStore + AttemptStore,
{
    let mut report = PassReport::default();
    let sales = match store.sales_in_status(&[SaleStatus::Live]).await {
        Ok(sales) => sales,
        Err(err) => {
            warn!("ranker could not list live sales: {err:#}");
            report.errors.push((uuid::Uuid::nil(), err.to_string()));
            return report;
        }
    };
    for sale in sales {
        if sale.allocation_frozen {
            continue;
        }
        report.sales += 1;
        match rank_sale(store, &sale).await {
            Ok(changed) => report.rank_changes += changed,
            Err(err) => report.errors.push((sale.id, err.to_string())),
        }
    }
    report
}
