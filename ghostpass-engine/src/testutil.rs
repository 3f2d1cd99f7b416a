//! In-memory store and static chain sources mirroring the persistence
//! semantics the engine relies on (attempt dedupe, optimistic transitions,
//! change-counting rank writes).

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ghostpass_chain::{
    AcceptanceSource, ChainError, TransferSource, TreasuryTransfer, TxAcceptance,
};
use ghostpass_codec::{buyer_addr_hash, solve_pow, PurchasePayload, SolveOptions};
use ghostpass_core::{
    Claim, OrderingMode, PurchaseAttempt, RankAssignment, Sale, SaleStatus, TicketArtifact,
    TicketStatus, TicketType, ValidationStatus,
};
use ghostpass_storage::{AttemptCounts, AttemptStore, ClaimStore, SaleStore, TicketStore};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MemStore {
    sales: Mutex<HashMap<Uuid, Sale>>,
    types: Mutex<HashMap<Uuid, Vec<TicketType>>>,
    attempts: Mutex<HashMap<(Uuid, String), PurchaseAttempt>>,
    tickets: Mutex<HashMap<Uuid, TicketArtifact>>,
    scans: Mutex<Vec<(Uuid, Uuid, String)>>,
    claims: Mutex<HashMap<(Uuid, String), Claim>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn base_sale(&self, price: u128, supply: u32, status: SaleStatus) -> Sale {
        let sale = Sale {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            network: "kaspa-testnet".into(),
            treasury_address: "kaspa:qtreasury".into(),
            ticket_price_sompi: price,
            supply_total: supply,
            max_per_address: None,
            pow_difficulty: 8,
            finality_depth: 2,
            start_at: None,
            end_at: None,
            status,
            ordering: OrderingMode::BlueScore,
            fallback_enabled: false,
            allocation_frozen: false,
            merkle_root: None,
            commit_txid: None,
        };
        self.sales.lock().unwrap().insert(sale.id, sale.clone());
        sale
    }

    pub fn add_live_sale(&self, price: u128, supply: u32) -> Sale {
        self.base_sale(price, supply, SaleStatus::Live)
    }

    pub fn add_scheduled_sale(&self, price: u128, supply: u32) -> Sale {
        self.base_sale(price, supply, SaleStatus::Scheduled)
    }

    pub fn sale(&self, id: &Uuid) -> Sale {
        self.sales.lock().unwrap().get(id).cloned().expect("sale")
    }

    pub fn freeze(&self, id: &Uuid) {
        self.sales
            .lock()
            .unwrap()
            .get_mut(id)
            .expect("sale")
            .allocation_frozen = true;
    }

    pub fn add_attempt(
        &self,
        sale_id: &Uuid,
        txid: &str,
        status: ValidationStatus,
        mutate: impl FnOnce(&mut PurchaseAttempt),
    ) {
        let mut attempt = PurchaseAttempt {
            sale_id: *sale_id,
            txid: txid.to_string(),
            buyer_address: None,
            buyer_addr_hash: Some("ab".repeat(20)),
            amount: 1_000_000,
            block_hash: None,
            block_number: None,
            block_timestamp: None,
            log_index: None,
            validation_status: status,
            invalid_reason: None,
            accepted: false,
            confirmations: 0,
            accepting_block_hash: None,
            accepting_blue_score: None,
            provisional_rank: None,
            final_rank: None,
        };
        mutate(&mut attempt);
        self.attempts
            .lock()
            .unwrap()
            .insert((*sale_id, txid.to_string()), attempt);
    }

    pub fn update_attempt(
        &self,
        sale_id: &Uuid,
        txid: &str,
        mutate: impl FnOnce(&mut PurchaseAttempt),
    ) {
        let mut attempts = self.attempts.lock().unwrap();
        let attempt = attempts
            .get_mut(&(*sale_id, txid.to_string()))
            .expect("attempt");
        mutate(attempt);
    }

    pub fn attempt(&self, sale_id: &Uuid, txid: &str) -> PurchaseAttempt {
        self.attempts
            .lock()
            .unwrap()
            .get(&(*sale_id, txid.to_string()))
            .cloned()
            .expect("attempt")
    }
}

#[async_trait]
impl SaleStore for MemStore {
    async fn create_sale(&self, sale: &Sale, types: &[TicketType]) -> Result<()> {
        self.sales.lock().unwrap().insert(sale.id, sale.clone());
        self.types.lock().unwrap().insert(sale.id, types.to_vec());
        Ok(())
    }

    async fn get_sale(&self, id: Uuid) -> Result<Option<Sale>> {
        Ok(self.sales.lock().unwrap().get(&id).cloned())
    }

    async fn sales_in_status(&self, statuses: &[SaleStatus]) -> Result<Vec<Sale>> {
        Ok(self
            .sales
            .lock()
            .unwrap()
            .values()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect())
    }

    async fn ticket_types(&self, sale_id: Uuid) -> Result<Vec<TicketType>> {
        Ok(self
            .types
            .lock()
            .unwrap()
            .get(&sale_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_ticket_types(&self, sale_id: Uuid, types: &[TicketType]) -> Result<()> {
        self.types
            .lock()
            .unwrap()
            .entry(sale_id)
            .or_default()
            .extend(types.iter().cloned());
        Ok(())
    }

    async fn transition_status(&self, id: Uuid, from: SaleStatus, to: SaleStatus) -> Result<bool> {
        let mut sales = self.sales.lock().unwrap();
        let sale = sales.get_mut(&id).ok_or_else(|| anyhow!("no sale"))?;
        if sale.status != from {
            return Ok(false);
        }
        sale.status = to;
        Ok(true)
    }

    async fn freeze_allocation(&self, id: Uuid, merkle_root: Option<&str>) -> Result<()> {
        let mut sales = self.sales.lock().unwrap();
        let sale = sales.get_mut(&id).ok_or_else(|| anyhow!("no sale"))?;
        sale.merkle_root = merkle_root.map(str::to_string);
        sale.allocation_frozen = true;
        Ok(())
    }

    async fn set_commit_txid(&self, id: Uuid, txid: &str) -> Result<bool> {
        let mut sales = self.sales.lock().unwrap();
        let sale = sales.get_mut(&id).ok_or_else(|| anyhow!("no sale"))?;
        if sale.commit_txid.is_some() {
            return Ok(false);
        }
        sale.commit_txid = Some(txid.to_string());
        Ok(true)
    }
}

#[async_trait]
impl AttemptStore for MemStore {
    async fn insert_attempt(&self, attempt: &PurchaseAttempt) -> Result<bool> {
        let mut attempts = self.attempts.lock().unwrap();
        let key = (attempt.sale_id, attempt.txid.clone());
        if attempts.contains_key(&key) {
            return Ok(false);
        }
        attempts.insert(key, attempt.clone());
        Ok(true)
    }

    async fn get_attempt(&self, sale_id: Uuid, txid: &str) -> Result<Option<PurchaseAttempt>> {
        Ok(self
            .attempts
            .lock()
            .unwrap()
            .get(&(sale_id, txid.to_string()))
            .cloned())
    }

    async fn attempts_for_sale(&self, sale_id: Uuid) -> Result<Vec<PurchaseAttempt>> {
        Ok(self
            .attempts
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.sale_id == sale_id)
            .cloned()
            .collect())
    }

    async fn pending_acceptance(
        &self,
        sale_id: Uuid,
        finality_depth: u32,
    ) -> Result<Vec<PurchaseAttempt>> {
        let mut pending: Vec<PurchaseAttempt> = self
            .attempts
            .lock()
            .unwrap()
            .values()
            .filter(|a| {
                a.sale_id == sale_id && a.is_valid() && a.confirmations < finality_depth
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.txid.cmp(&b.txid));
        Ok(pending)
    }

    async fn apply_acceptance(
        &self,
        sale_id: Uuid,
        txid: &str,
        accepted: bool,
        confirmations: u32,
        accepting_block_hash: Option<&str>,
        accepting_blue_score: Option<u64>,
    ) -> Result<()> {
        let mut attempts = self.attempts.lock().unwrap();
        let attempt = attempts
            .get_mut(&(sale_id, txid.to_string()))
            .ok_or_else(|| anyhow!("no attempt"))?;
        attempt.accepted = accepted;
        attempt.confirmations = confirmations;
        attempt.accepting_block_hash = accepting_block_hash.map(str::to_string);
        if accepting_blue_score.is_some() {
            attempt.accepting_blue_score = accepting_blue_score;
        }
        Ok(())
    }

    async fn write_ranks(&self, sale_id: Uuid, ranks: &[RankAssignment]) -> Result<u64> {
        let mut attempts = self.attempts.lock().unwrap();
        let mut changed = 0u64;
        for assignment in ranks {
            let Some(attempt) = attempts.get_mut(&(sale_id, assignment.txid.clone())) else {
                continue;
            };
            if attempt.provisional_rank != Some(assignment.provisional_rank)
                || attempt.final_rank != assignment.final_rank
            {
                attempt.provisional_rank = Some(assignment.provisional_rank);
                attempt.final_rank = assignment.final_rank;
                changed += 1;
            }
        }
        for attempt in attempts.values_mut().filter(|a| a.sale_id == sale_id) {
            let still_ranked = ranks.iter().any(|r| r.txid == attempt.txid);
            if !still_ranked
                && (attempt.provisional_rank.is_some() || attempt.final_rank.is_some())
            {
                attempt.provisional_rank = None;
                attempt.final_rank = None;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn final_ranked(&self, sale_id: Uuid) -> Result<Vec<PurchaseAttempt>> {
        let mut finals: Vec<PurchaseAttempt> = self
            .attempts
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.sale_id == sale_id && a.final_rank.is_some())
            .cloned()
            .collect();
        finals.sort_by_key(|a| a.final_rank);
        Ok(finals)
    }

    async fn counts(&self, sale_id: Uuid, finality_depth: u32) -> Result<AttemptCounts> {
        let attempts = self.attempts.lock().unwrap();
        let mut counts = AttemptCounts::default();
        for a in attempts.values().filter(|a| a.sale_id == sale_id) {
            counts.total += 1;
            if a.is_valid() {
                counts.valid += 1;
                if a.accepted {
                    counts.accepted += 1;
                    if a.confirmations >= finality_depth {
                        counts.finalized += 1;
                    }
                }
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl TicketStore for MemStore {
    async fn insert_ticket(&self, ticket: &TicketArtifact) -> Result<()> {
        self.tickets
            .lock()
            .unwrap()
            .insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<TicketArtifact>> {
        Ok(self.tickets.lock().unwrap().get(&id).cloned())
    }

    async fn ticket_for_attempt(
        &self,
        sale_id: Uuid,
        txid: &str,
    ) -> Result<Option<TicketArtifact>> {
        Ok(self
            .tickets
            .lock()
            .unwrap()
            .values()
            .find(|t| t.sale_id == sale_id && t.txid == txid)
            .cloned())
    }

    async fn set_ticket_status(
        &self,
        id: Uuid,
        from: TicketStatus,
        to: TicketStatus,
    ) -> Result<bool> {
        let mut tickets = self.tickets.lock().unwrap();
        let ticket = tickets.get_mut(&id).ok_or_else(|| anyhow!("no ticket"))?;
        if ticket.status != from {
            return Ok(false);
        }
        ticket.status = to;
        Ok(true)
    }

    async fn record_scan(&self, ticket_id: Uuid, sale_id: Uuid, result: &str) -> Result<()> {
        self.scans
            .lock()
            .unwrap()
            .push((ticket_id, sale_id, result.to_string()));
        Ok(())
    }
}

#[async_trait]
impl ClaimStore for MemStore {
    async fn upsert_claim(&self, claim: &Claim) -> Result<()> {
        self.claims
            .lock()
            .unwrap()
            .insert((claim.sale_id, claim.kaspa_txid.clone()), claim.clone());
        Ok(())
    }

    async fn get_claim(&self, sale_id: Uuid, kaspa_txid: &str) -> Result<Option<Claim>> {
        Ok(self
            .claims
            .lock()
            .unwrap()
            .get(&(sale_id, kaspa_txid.to_string()))
            .cloned())
    }
}

pub struct StaticTransfers {
    transfers: Vec<TreasuryTransfer>,
    fail: bool,
}

impl StaticTransfers {
    pub fn new(transfers: Vec<TreasuryTransfer>) -> Self {
        Self {
            transfers,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            transfers: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl TransferSource for StaticTransfers {
    async fn list_transfers(&self, _treasury: &str) -> Result<Vec<TreasuryTransfer>, ChainError> {
        if self.fail {
            return Err(ChainError::Unavailable("test outage".into()));
        }
        Ok(self.transfers.clone())
    }

    async fn current_tip(&self) -> Result<u64, ChainError> {
        Ok(0)
    }
}

#[derive(Default)]
pub struct StaticAcceptance {
    records: HashMap<String, TxAcceptance>,
    blues: HashMap<String, u64>,
    fail: bool,
}

impl StaticAcceptance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn record(
        &mut self,
        txid: &str,
        is_accepted: bool,
        accepting_block_hash: Option<&str>,
        confirmations: u32,
    ) {
        self.records.insert(
            txid.to_string(),
            TxAcceptance {
                txid: txid.to_string(),
                is_accepted,
                accepting_block_hash: accepting_block_hash.map(str::to_string),
                confirmations,
            },
        );
    }

    pub fn blue_score(&mut self, block_hash: &str, score: u64) {
        self.blues.insert(block_hash.to_string(), score);
    }
}

#[async_trait]
impl AcceptanceSource for StaticAcceptance {
    async fn transaction_acceptance(
        &self,
        txids: &[String],
    ) -> Result<Vec<TxAcceptance>, ChainError> {
        if self.fail {
            return Err(ChainError::Unavailable("test outage".into()));
        }
        Ok(txids
            .iter()
            .filter_map(|txid| self.records.get(txid).cloned())
            .collect())
    }

    async fn block_blue_score(&self, block_hash: &str) -> Result<Option<u64>, ChainError> {
        Ok(self.blues.get(block_hash).copied())
    }
}

/// A transfer carrying a fully solved payload for the sale.
pub async fn solved_transfer(
    sale: &Sale,
    txid: &str,
    value: u128,
    buyer: &str,
) -> TreasuryTransfer {
    let hash = buyer_addr_hash(buyer);
    let solution = solve_pow(&sale.id, &hash, sale.pow_difficulty, SolveOptions::default())
        .await
        .expect("solvable difficulty");
    let payload =
        PurchasePayload::new(sale.id, &hash, 1_722_000_000_000, sale.pow_difficulty, solution.nonce)
            .expect("20-byte hash")
            .encode()
            .to_vec();
    TreasuryTransfer {
        txid: txid.to_string(),
        from_address: Some(buyer.to_string()),
        to_address: sale.treasury_address.clone(),
        value,
        block_hash: None,
        block_number: None,
        block_timestamp: None,
        log_index: None,
        payload: Some(payload),
    }
}
