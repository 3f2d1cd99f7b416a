//! Allocation freeze, on-chain commit bookkeeping, Merkle proofs and claim
//! intake. Lifecycle transitions run as optimistic status updates so exactly
//! one of any set of concurrent callers succeeds.

use crate::ranker::rank_sale;
use anyhow::Result;
use ghostpass_core::{
    Claim, CoreError, PurchaseAttempt, Sale, SaleAction, SaleStatus,
};
use ghostpass_merkle::{CommitPayload, MerkleLeaf, MerkleTree, ProofStep};
use ghostpass_storage::{AttemptStore, ClaimStore, SaleStore};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

pub async fn fetch_sale<S: SaleStore>(store: &S, id: Uuid) -> Result<Sale> {
    store
        .get_sale(id)
        .await?
        .ok_or_else(|| CoreError::NotFound("sale").into())
}

/// Applies one lifecycle action under the optimistic status guard. The loser
/// of a concurrent race observes `InvalidStateTransition` against the status
/// the winner left behind.
pub async fn apply_transition<S: SaleStore>(
    store: &S,
    id: Uuid,
    action: SaleAction,
) -> Result<Sale> {
    let sale = fetch_sale(store, id).await?;
    let to = sale.status.apply(action)?;
    if !store.transition_status(id, sale.status, to).await? {
        let current = fetch_sale(store, id).await?;
        return Err(CoreError::InvalidStateTransition {
            from: current.status,
            action,
        }
        .into());
    }
    info!(sale = %id, from = %sale.status, to = %to, "sale transitioned");
    fetch_sale(store, id).await
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerEntry {
    pub txid: String,
    pub final_rank: u32,
    pub buyer_addr_hash: Option<String>,
    pub accepting_block_hash: Option<String>,
    pub accepting_blue_score: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationSummary {
    pub sale_id: Uuid,
    pub status: SaleStatus,
    pub frozen: bool,
    pub winners: Vec<WinnerEntry>,
    pub losers_count: u64,
    pub merkle_root: Option<String>,
    pub commit_payload_hex: Option<String>,
}

fn leaf_for(attempt: &PurchaseAttempt) -> MerkleLeaf {
    MerkleLeaf {
        final_rank: attempt.final_rank.unwrap_or(0),
        txid: attempt.txid.clone(),
        accepting_block_hash: attempt.accepting_block_hash.clone(),
        accepting_blue_score: attempt.accepting_blue_score,
        buyer_addr_hash: attempt.buyer_addr_hash.clone(),
    }
}

fn winner_entry(attempt: &PurchaseAttempt) -> WinnerEntry {
    WinnerEntry {
        txid: attempt.txid.clone(),
        final_rank: attempt.final_rank.unwrap_or(0),
        buyer_addr_hash: attempt.buyer_addr_hash.clone(),
        accepting_block_hash: attempt.accepting_block_hash.clone(),
        accepting_blue_score: attempt.accepting_blue_score,
    }
}

/// Splits final-ranked attempts (ascending) into winners and the loser tail.
fn split_winners(finals: Vec<PurchaseAttempt>, supply_total: u32) -> (Vec<PurchaseAttempt>, u64) {
    let cut = (supply_total as usize).min(finals.len());
    let losers = (finals.len() - cut) as u64;
    let mut winners = finals;
    winners.truncate(cut);
    (winners, losers)
}

fn tree_over(winners: &[PurchaseAttempt]) -> (Vec<MerkleLeaf>, MerkleTree) {
    let leaves: Vec<MerkleLeaf> = winners.iter().map(leaf_for).collect();
    let hashes: Vec<[u8; 32]> = leaves.iter().map(MerkleLeaf::hash).collect();
    (leaves, MerkleTree::build(&hashes))
}

fn commit_payload_hex(sale: &Sale) -> Option<String> {
    sale.merkle_root.as_ref().map(|root| {
        CommitPayload {
            sale_id: sale.id.to_string(),
            merkle_root: root.clone(),
        }
        .encode_hex()
    })
}

/// `finalize`: live → finalizing, one last rank recomputation, then the
/// winner snapshot, the Merkle root and the freeze flag. After this returns,
/// neither the valid set nor any final rank of this sale changes again.
pub async fn finalize_sale<S>(store: &S, id: Uuid) -> Result<AllocationSummary>
where
    S: SaleStore + AttemptStore,
{
    let sale = apply_transition(store, id, SaleAction::Finalize).await?;
    rank_sale(store, &sale).await?;

    let finals = store.final_ranked(id).await?;
    let (winners, losers_count) = split_winners(finals, sale.supply_total);
    let merkle_root = if winners.is_empty() {
        None
    } else {
        let (_, tree) = tree_over(&winners);
        Some(tree.root_hex())
    };
    store.freeze_allocation(id, merkle_root.as_deref()).await?;
    info!(sale = %id, winners = winners.len(), losers_count,
          root = merkle_root.as_deref().unwrap_or("-"), "allocation frozen");

    let sale = fetch_sale(store, id).await?;
    Ok(AllocationSummary {
        sale_id: id,
        status: sale.status,
        frozen: sale.allocation_frozen,
        winners: winners.iter().map(winner_entry).collect(),
        losers_count,
        merkle_root,
        commit_payload_hex: commit_payload_hex(&sale),
    })
}

/// Read path for `/allocation`: the current winner set and commitment.
pub async fn allocation_summary<S>(store: &S, id: Uuid) -> Result<AllocationSummary>
where
    S: SaleStore + AttemptStore,
{
    let sale = fetch_sale(store, id).await?;
    let finals = store.final_ranked(id).await?;
    let (winners, losers_count) = split_winners(finals, sale.supply_total);
    Ok(AllocationSummary {
        sale_id: id,
        status: sale.status,
        frozen: sale.allocation_frozen,
        winners: winners.iter().map(winner_entry).collect(),
        losers_count,
        merkle_root: sale.merkle_root.clone(),
        commit_payload_hex: commit_payload_hex(&sale),
    })
}

/// `commit`: records the anchoring txid and opens the claim window.
/// Idempotent for the same txid; a different txid is a `Conflict` once one
/// is stored.
pub async fn commit_sale<S: SaleStore>(store: &S, id: Uuid, commit_txid: &str) -> Result<Sale> {
    let sale = fetch_sale(store, id).await?;
    match sale.commit_txid.as_deref() {
        Some(existing) if existing == commit_txid => {
            // Retry of a commit we already recorded. Finish the transition if
            // an earlier attempt stopped between the two writes.
            if sale.status == SaleStatus::Finalizing {
                store
                    .transition_status(id, SaleStatus::Finalizing, SaleStatus::ClaimOpen)
                    .await?;
            }
            return fetch_sale(store, id).await;
        }
        Some(_) => {
            return Err(CoreError::Conflict(
                "sale already committed with a different txid".into(),
            )
            .into());
        }
        None => {}
    }

    sale.status.apply(SaleAction::Commit)?;
    if !store.set_commit_txid(id, commit_txid).await? {
        // Another committer got there first; re-inspect what they stored.
        let current = fetch_sale(store, id).await?;
        if current.commit_txid.as_deref() == Some(commit_txid) {
            return Ok(current);
        }
        return Err(CoreError::Conflict(
            "sale already committed with a different txid".into(),
        )
        .into());
    }
    if !store
        .transition_status(id, SaleStatus::Finalizing, SaleStatus::ClaimOpen)
        .await?
    {
        let current = fetch_sale(store, id).await?;
        return Err(CoreError::InvalidStateTransition {
            from: current.status,
            action: SaleAction::Commit,
        }
        .into());
    }
    info!(sale = %id, commit_txid, "commit recorded, claims open");
    fetch_sale(store, id).await
}

/// The contract's finalization event, relayed by the on-chain indexer.
pub async fn mark_onchain_finalized<S: SaleStore>(store: &S, id: Uuid) -> Result<Sale> {
    apply_transition(store, id, SaleAction::OnchainFinalized).await
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofResponse {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaf: Option<MerkleLeaf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaf_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<Vec<ProofStep>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<String>,
}

/// Inclusion proof for a winning txid; `found = false` for anything else.
pub async fn merkle_proof<S>(store: &S, id: Uuid, txid: &str) -> Result<ProofResponse>
where
    S: SaleStore + AttemptStore,
{
    let sale = fetch_sale(store, id).await?;
    let finals = store.final_ranked(id).await?;
    let (winners, _) = split_winners(finals, sale.supply_total);
    let Some(index) = winners.iter().position(|w| w.txid == txid) else {
        return Ok(ProofResponse {
            found: false,
            leaf: None,
            leaf_index: None,
            proof: None,
            merkle_root: None,
        });
    };
    let (leaves, tree) = tree_over(&winners);
    Ok(ProofResponse {
        found: true,
        leaf: Some(leaves[index].clone()),
        leaf_index: Some(index),
        proof: tree.proof(index),
        merkle_root: Some(tree.root_hex()),
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimInput {
    pub kaspa_txid: String,
    pub type_code: Option<String>,
    pub claimer_evm_address: String,
    pub token_id: u64,
    pub block_number: u64,
    pub block_timestamp: i64,
    pub tx_hash: String,
}

/// Mirrors an on-chain claim. The claim must point at a winning attempt.
pub async fn sync_claim<S>(store: &S, sale_id: Uuid, input: ClaimInput) -> Result<Claim>
where
    S: SaleStore + AttemptStore + ClaimStore,
{
    let sale = fetch_sale(store, sale_id).await?;
    let attempt = store
        .get_attempt(sale_id, &input.kaspa_txid)
        .await?
        .ok_or(CoreError::WinnerNotFound)?;
    if !attempt.is_winner(sale.supply_total) {
        return Err(CoreError::WinnerNotFound.into());
    }
    let Some(final_rank) = attempt.final_rank else {
        return Err(CoreError::WinnerNotFound.into());
    };
    let claim = Claim {
        sale_id,
        kaspa_txid: input.kaspa_txid,
        type_code: input.type_code,
        claimer_evm_address: input.claimer_evm_address,
        token_id: input.token_id,
        final_rank,
        block_number: input.block_number,
        block_timestamp: input.block_timestamp,
        tx_hash: input.tx_hash,
    };
    store.upsert_claim(&claim).await?;
    Ok(claim)
}
