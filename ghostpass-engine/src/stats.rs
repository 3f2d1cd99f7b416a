//! Live projections derived on demand from the attempts table. No cached
//! sums: every call reads the current snapshot.

use anyhow::Result;
use chrono::{DateTime, Utc};
use ghostpass_core::{Sale, SaleStatus, ValidationStatus};
use ghostpass_storage::AttemptStore;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleStats {
    pub sale_id: uuid::Uuid,
    pub status: SaleStatus,
    pub supply_total: u32,
    pub remaining: u32,
    pub total_attempts: u64,
    pub valid_attempts: u64,
    pub accepted_attempts: u64,
    pub final_attempts: u64,
    pub timestamp: DateTime<Utc>,
}

pub async fn live_stats<S: AttemptStore>(store: &S, sale: &Sale) -> Result<SaleStats> {
    let counts = store.counts(sale.id, sale.finality_depth).await?;
    let remaining = u64::from(sale.supply_total).saturating_sub(counts.finalized);
    Ok(SaleStats {
        sale_id: sale.id,
        status: sale.status,
        supply_total: sale.supply_total,
        remaining: remaining.min(u64::from(sale.supply_total)) as u32,
        total_attempts: counts.total,
        valid_attempts: counts.valid,
        accepted_attempts: counts.accepted,
        final_attempts: counts.finalized,
        timestamp: Utc::now(),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MyStatus {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_status: Option<ValidationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    pub accepted: bool,
    pub confirmations: u32,
    pub provisional_rank: Option<u32>,
    pub final_rank: Option<u32>,
    pub is_winner: bool,
}

/// Status of one buyer's attempt, as shown on `/my-status` and over the
/// WebSocket.
pub async fn my_status<S: AttemptStore>(store: &S, sale: &Sale, txid: &str) -> Result<MyStatus> {
    let Some(attempt) = store.get_attempt(sale.id, txid).await? else {
        return Ok(MyStatus {
            found: false,
            validation_status: None,
            invalid_reason: None,
            accepted: false,
            confirmations: 0,
            provisional_rank: None,
            final_rank: None,
            is_winner: false,
        });
    };
    Ok(MyStatus {
        found: true,
        validation_status: Some(attempt.validation_status),
        invalid_reason: attempt.invalid_reason.clone(),
        accepted: attempt.accepted,
        confirmations: attempt.confirmations,
        provisional_rank: attempt.provisional_rank,
        final_rank: attempt.final_rank,
        is_winner: attempt.is_winner(sale.supply_total),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemStore;

    #[tokio::test]
    async fn stats_reflect_the_current_snapshot() {
        let store = MemStore::new();
        let sale = store.add_live_sale(1_000_000, 3);
        store.add_attempt(&sale.id, "tx-bad", ValidationStatus::InvalidWrongAmount, |_| {});
        store.add_attempt(&sale.id, "tx-pend", ValidationStatus::Valid, |_| {});
        store.add_attempt(&sale.id, "tx-acc", ValidationStatus::Valid, |a| {
            a.accepted = true;
            a.confirmations = 1;
        });
        store.add_attempt(&sale.id, "tx-fin", ValidationStatus::Valid, |a| {
            a.accepted = true;
            a.confirmations = 5;
        });

        let stats = live_stats(&store, &store.sale(&sale.id)).await.unwrap();
        assert_eq!(stats.total_attempts, 4);
        assert_eq!(stats.valid_attempts, 3);
        assert_eq!(stats.accepted_attempts, 2);
        assert_eq!(stats.final_attempts, 1);
        assert_eq!(stats.remaining, 2);
    }

    #[tokio::test]
    async fn wrong_amount_attempts_never_count_as_valid() {
        let store = MemStore::new();
        let sale = store.add_live_sale(1_000_000, 1);
        store.add_attempt(&sale.id, "tx-short", ValidationStatus::InvalidWrongAmount, |_| {});
        let stats = live_stats(&store, &store.sale(&sale.id)).await.unwrap();
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.valid_attempts, 0);
        assert_eq!(stats.remaining, 1);
    }

    #[tokio::test]
    async fn my_status_reports_winner_only_within_supply() {
        let store = MemStore::new();
        let sale = store.add_live_sale(1_000_000, 1);
        store.add_attempt(&sale.id, "tx-1", ValidationStatus::Valid, |a| {
            a.accepted = true;
            a.confirmations = 9;
            a.provisional_rank = Some(1);
            a.final_rank = Some(1);
        });
        store.add_attempt(&sale.id, "tx-2", ValidationStatus::Valid, |a| {
            a.accepted = true;
            a.confirmations = 9;
            a.provisional_rank = Some(2);
            a.final_rank = Some(2);
        });

        let sale = store.sale(&sale.id);
        let winner = my_status(&store, &sale, "tx-1").await.unwrap();
        assert!(winner.found);
        assert!(winner.is_winner);
        let loser = my_status(&store, &sale, "tx-2").await.unwrap();
        assert!(loser.found);
        assert!(!loser.is_winner);
        let missing = my_status(&store, &sale, "tx-zz").await.unwrap();
        assert!(!missing.found);
    }
}
