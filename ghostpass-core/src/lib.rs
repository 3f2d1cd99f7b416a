use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Smallest integer unit of the payment currency. Prices and transfer values
/// are exact integers, never floats.
pub type Sompi = u128;

pub const MAX_POW_DIFFICULTY: u8 = 32;
pub const MIN_FINALITY_DEPTH: u32 = 1;
pub const MAX_FINALITY_DEPTH: u32 = 100;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid state transition: cannot {action} a {from} sale")]
    InvalidStateTransition { from: SaleStatus, action: SaleAction },
    #[error("ticket types can only be changed while the sale is scheduled")]
    InvalidStateForTicketTypeMutation,
    #[error("duplicate ticket type code {0}")]
    DuplicateTicketTypeCode(String),
    #[error("attempt is not a winner")]
    NotAWinner,
    #[error("no winning attempt recorded for this transaction")]
    WinnerNotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("chain adapter unavailable: {0}")]
    AdapterUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Draft,
    Published,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Draft => "draft",
            EventStatus::Published => "published",
        }
    }
}

impl FromStr for EventStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(EventStatus::Draft),
            "published" => Ok(EventStatus::Published),
            other => Err(CoreError::ValidationFailed(format!(
                "unknown event status {other}"
            ))),
        }
    }
}

/// Inert container for sales.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub organizer_id: String,
    pub title: String,
    pub venue: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub status: EventStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    Scheduled,
    Live,
    Finalizing,
    ClaimOpen,
    Finalized,
}

impl SaleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SaleStatus::Scheduled => "scheduled",
            SaleStatus::Live => "live",
            SaleStatus::Finalizing => "finalizing",
            SaleStatus::ClaimOpen => "claim_open",
            SaleStatus::Finalized => "finalized",
        }
    }

    /// The sale lifecycle state machine. Every transition not listed here is
    /// rejected with `InvalidStateTransition` and leaves the state unchanged.
    pub fn apply(self, action: SaleAction) -> Result<SaleStatus, CoreError> {
        match (self, action) {
            (SaleStatus::Scheduled, SaleAction::Publish) => Ok(SaleStatus::Live),
            (SaleStatus::Live, SaleAction::Finalize) => Ok(SaleStatus::Finalizing),
            (SaleStatus::Finalizing, SaleAction::Commit) => Ok(SaleStatus::ClaimOpen),
            (SaleStatus::ClaimOpen, SaleAction::OnchainFinalized) => Ok(SaleStatus::Finalized),
            (from, action) => Err(CoreError::InvalidStateTransition { from, action }),
        }
    }
}

impl fmt::Display for SaleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SaleStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SaleStatus::Scheduled),
            "live" => Ok(SaleStatus::Live),
            "finalizing" => Ok(SaleStatus::Finalizing),
            "claim_open" => Ok(SaleStatus::ClaimOpen),
            "finalized" => Ok(SaleStatus::Finalized),
            other => Err(CoreError::ValidationFailed(format!(
                "unknown sale status {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaleAction {
    Publish,
    Finalize,
    Commit,
    OnchainFinalized,
}

impl fmt::Display for SaleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SaleAction::Publish => "publish",
            SaleAction::Finalize => "finalize",
            SaleAction::Commit => "commit",
            SaleAction::OnchainFinalized => "finalize on-chain",
        };
        f.write_str(s)
    }
}

/// Which variant of the attempt order a sale uses. Fixed at sale creation and
/// stable for the life of the sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingMode {
    /// Native DAG mode: `(acceptingBlueScore asc, nulls last, txid asc)`.
    BlueScore,
    /// Transfer-table mode: `(blockNumber asc, logIndex asc, txid asc)`.
    BlockIndex,
}

impl OrderingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderingMode::BlueScore => "blue_score",
            OrderingMode::BlockIndex => "block_index",
        }
    }
}

impl FromStr for OrderingMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blue_score" => Ok(OrderingMode::BlueScore),
            "block_index" => Ok(OrderingMode::BlockIndex),
            other => Err(CoreError::ValidationFailed(format!(
                "unknown ordering mode {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    pub id: Uuid,
    pub event_id: Uuid,
    pub network: String,
    pub treasury_address: String,
    pub ticket_price_sompi: Sompi,
    pub supply_total: u32,
    pub max_per_address: Option<u32>,
    pub pow_difficulty: u8,
    pub finality_depth: u32,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub status: SaleStatus,
    pub ordering: OrderingMode,
    pub fallback_enabled: bool,
    pub allocation_frozen: bool,
    pub merkle_root: Option<String>,
    pub commit_txid: Option<String>,
}

impl Sale {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.treasury_address.trim().is_empty() {
            return Err(CoreError::ValidationFailed(
                "treasury address must not be empty".into(),
            ));
        }
        if self.supply_total == 0 {
            return Err(CoreError::ValidationFailed(
                "supply total must be positive".into(),
            ));
        }
        if self.pow_difficulty > MAX_POW_DIFFICULTY {
            return Err(CoreError::ValidationFailed(format!(
                "pow difficulty {} exceeds maximum {MAX_POW_DIFFICULTY}",
                self.pow_difficulty
            )));
        }
        if !(MIN_FINALITY_DEPTH..=MAX_FINALITY_DEPTH).contains(&self.finality_depth) {
            return Err(CoreError::ValidationFailed(format!(
                "finality depth {} outside [{MIN_FINALITY_DEPTH},{MAX_FINALITY_DEPTH}]",
                self.finality_depth
            )));
        }
        if let (Some(start), Some(end)) = (self.start_at, self.end_at) {
            if end <= start {
                return Err(CoreError::ValidationFailed(
                    "sale end must be after sale start".into(),
                ));
            }
        }
        Ok(())
    }

    /// The set of payment amounts a transfer may carry to count as a ticket
    /// purchase: the ticket-type prices when any types exist, the flat sale
    /// price otherwise.
    pub fn allowed_amounts(&self, types: &[TicketType]) -> Vec<Sompi> {
        if types.is_empty() {
            vec![self.ticket_price_sompi]
        } else {
            types.iter().map(|t| t.price_sompi).collect()
        }
    }

    /// Whether a block timestamp (unix seconds) falls inside the sale window.
    /// A missing bound is open on that side.
    pub fn accepts_timestamp(&self, block_ts_secs: i64) -> bool {
        if let Some(start) = self.start_at {
            if block_ts_secs < start.timestamp() {
                return false;
            }
        }
        if let Some(end) = self.end_at {
            if block_ts_secs > end.timestamp() {
                return false;
            }
        }
        true
    }
}

pub const TICKET_TYPE_CODE_MAX_LEN: usize = 20;

/// Ticket type codes are uppercase `[A-Z0-9_]{1,20}`, unique per sale.
pub fn valid_ticket_type_code(code: &str) -> bool {
    !code.is_empty()
        && code.len() <= TICKET_TYPE_CODE_MAX_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

/// Returns the first code that appears more than once, if any.
pub fn duplicate_ticket_type_code(types: &[TicketType]) -> Option<&str> {
    for (i, t) in types.iter().enumerate() {
        if types[..i].iter().any(|prev| prev.code == t.code) {
            return Some(&t.code);
        }
    }
    None
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketType {
    pub sale_id: Uuid,
    pub code: String,
    pub name: String,
    pub price_sompi: Sompi,
    pub supply: u32,
    pub sort_order: i32,
}

impl TicketType {
    pub fn validate(&self) -> Result<(), CoreError> {
        if !valid_ticket_type_code(&self.code) {
            return Err(CoreError::ValidationFailed(format!(
                "ticket type code {:?} must match [A-Z0-9_]{{1,{TICKET_TYPE_CODE_MAX_LEN}}}",
                self.code
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Valid,
    ValidFallback,
    InvalidMissingPayload,
    InvalidBadPayload,
    InvalidWrongSale,
    InvalidPow,
    InvalidWrongAmount,
}

impl ValidationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::Valid => "valid",
            ValidationStatus::ValidFallback => "valid_fallback",
            ValidationStatus::InvalidMissingPayload => "invalid_missing_payload",
            ValidationStatus::InvalidBadPayload => "invalid_bad_payload",
            ValidationStatus::InvalidWrongSale => "invalid_wrong_sale",
            ValidationStatus::InvalidPow => "invalid_pow",
            ValidationStatus::InvalidWrongAmount => "invalid_wrong_amount",
        }
    }

    pub fn is_valid(self) -> bool {
        matches!(self, ValidationStatus::Valid | ValidationStatus::ValidFallback)
    }
}

impl FromStr for ValidationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ValidationStatus::Pending),
            "valid" => Ok(ValidationStatus::Valid),
            "valid_fallback" => Ok(ValidationStatus::ValidFallback),
            "invalid_missing_payload" => Ok(ValidationStatus::InvalidMissingPayload),
            "invalid_bad_payload" => Ok(ValidationStatus::InvalidBadPayload),
            "invalid_wrong_sale" => Ok(ValidationStatus::InvalidWrongSale),
            "invalid_pow" => Ok(ValidationStatus::InvalidPow),
            "invalid_wrong_amount" => Ok(ValidationStatus::InvalidWrongAmount),
            other => Err(CoreError::ValidationFailed(format!(
                "unknown validation status {other}"
            ))),
        }
    }
}

/// One observed treasury transfer, with derived validation, acceptance and
/// ranking fields. Identity is `(sale_id, txid)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseAttempt {
    pub sale_id: Uuid,
    pub txid: String,
    pub buyer_address: Option<String>,
    /// 20-byte fingerprint of the buyer address, hex. Null for fallback-mode
    /// attempts, which carry no payload.
    pub buyer_addr_hash: Option<String>,
    pub amount: Sompi,
    pub block_hash: Option<String>,
    pub block_number: Option<u64>,
    pub block_timestamp: Option<i64>,
    pub log_index: Option<u32>,
    pub validation_status: ValidationStatus,
    pub invalid_reason: Option<String>,
    pub accepted: bool,
    pub confirmations: u32,
    pub accepting_block_hash: Option<String>,
    pub accepting_blue_score: Option<u64>,
    pub provisional_rank: Option<u32>,
    pub final_rank: Option<u32>,
}

impl PurchaseAttempt {
    pub fn is_valid(&self) -> bool {
        self.validation_status.is_valid()
    }

    pub fn is_winner(&self, supply_total: u32) -> bool {
        matches!(self.final_rank, Some(rank) if rank <= supply_total)
    }
}

fn cmp_nulls_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// The total order on attempts of one sale. Deterministic, antisymmetric and
/// total for both variants; the txid tiebreak guarantees no two distinct
/// attempts ever compare equal.
pub fn attempt_order(mode: OrderingMode, a: &PurchaseAttempt, b: &PurchaseAttempt) -> Ordering {
    match mode {
        OrderingMode::BlueScore => cmp_nulls_last(a.accepting_blue_score, b.accepting_blue_score)
            .then_with(|| a.txid.cmp(&b.txid)),
        OrderingMode::BlockIndex => cmp_nulls_last(a.block_number, b.block_number)
            .then_with(|| cmp_nulls_last(a.log_index, b.log_index))
            .then_with(|| a.txid.cmp(&b.txid)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankAssignment {
    pub txid: String,
    pub provisional_rank: u32,
    pub final_rank: Option<u32>,
}

/// Ranks a point-in-time snapshot of a sale's attempts.
///
/// Provisional ranks run 1..=M over attempts that are valid and accepted;
/// final ranks run 1..=K over the subset whose confirmations have reached the
/// finality depth, preserving the same order. Pure over the snapshot: two
/// runs on the same input produce identical assignments.
pub fn rank_attempts(
    mode: OrderingMode,
    attempts: &[PurchaseAttempt],
    finality_depth: u32,
) -> Vec<RankAssignment> {
    let mut eligible: Vec<&PurchaseAttempt> = attempts
        .iter()
        .filter(|a| a.is_valid() && a.accepted)
        .collect();
    eligible.sort_by(|a, b| attempt_order(mode, a, b));

    let mut out = Vec::with_capacity(eligible.len());
    let mut next_final = 0u32;
    for (i, attempt) in eligible.iter().enumerate() {
        let final_rank = if attempt.confirmations >= finality_depth {
            next_final += 1;
            Some(next_final)
        } else {
            None
        };
        out.push(RankAssignment {
            txid: attempt.txid.clone(),
            provisional_rank: i as u32 + 1,
            final_rank,
        });
    }
    out
}

/// On-chain NFT mint against a winning attempt. One per `(sale_id, kaspa_txid)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub sale_id: Uuid,
    pub kaspa_txid: String,
    pub type_code: Option<String>,
    pub claimer_evm_address: String,
    pub token_id: u64,
    pub final_rank: u32,
    pub block_number: u64,
    pub block_timestamp: i64,
    pub tx_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Issued,
    Redeemed,
    Cancelled,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Issued => "issued",
            TicketStatus::Redeemed => "redeemed",
            TicketStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for TicketStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issued" => Ok(TicketStatus::Issued),
            "redeemed" => Ok(TicketStatus::Redeemed),
            "cancelled" => Ok(TicketStatus::Cancelled),
            other => Err(CoreError::ValidationFailed(format!(
                "unknown ticket status {other}"
            ))),
        }
    }
}

/// An issued ticket, bound to the winning attempt that paid for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketArtifact {
    pub id: Uuid,
    pub sale_id: Uuid,
    pub txid: String,
    pub ticket_type_code: Option<String>,
    pub owner_address: String,
    pub metadata: serde_json::Value,
    pub status: TicketStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(txid: &str) -> PurchaseAttempt {
        PurchaseAttempt {
            sale_id: Uuid::new_v4(),
            txid: txid.to_string(),
            buyer_address: None,
            buyer_addr_hash: None,
            amount: 1_000_000,
            block_hash: None,
            block_number: None,
            block_timestamp: None,
            log_index: None,
            validation_status: ValidationStatus::Valid,
            invalid_reason: None,
            accepted: true,
            confirmations: 0,
            accepting_block_hash: None,
            accepting_blue_score: None,
            provisional_rank: None,
            final_rank: None,
        }
    }

    #[test]
    fn lifecycle_accepts_exactly_the_allowed_transitions() {
        assert_eq!(
            SaleStatus::Scheduled.apply(SaleAction::Publish).unwrap(),
            SaleStatus::Live
        );
        assert_eq!(
            SaleStatus::Live.apply(SaleAction::Finalize).unwrap(),
            SaleStatus::Finalizing
        );
        assert_eq!(
            SaleStatus::Finalizing.apply(SaleAction::Commit).unwrap(),
            SaleStatus::ClaimOpen
        );
        assert_eq!(
            SaleStatus::ClaimOpen
                .apply(SaleAction::OnchainFinalized)
                .unwrap(),
            SaleStatus::Finalized
        );

        let all_states = [
            SaleStatus::Scheduled,
            SaleStatus::Live,
            SaleStatus::Finalizing,
            SaleStatus::ClaimOpen,
            SaleStatus::Finalized,
        ];
        let all_actions = [
            SaleAction::Publish,
            SaleAction::Finalize,
            SaleAction::Commit,
            SaleAction::OnchainFinalized,
        ];
        let allowed = [
            (SaleStatus::Scheduled, SaleAction::Publish),
            (SaleStatus::Live, SaleAction::Finalize),
            (SaleStatus::Finalizing, SaleAction::Commit),
            (SaleStatus::ClaimOpen, SaleAction::OnchainFinalized),
        ];
        for state in all_states {
            for action in all_actions {
                let outcome = state.apply(action);
                if allowed.contains(&(state, action)) {
                    assert!(outcome.is_ok());
                } else {
                    assert!(matches!(
                        outcome,
                        Err(CoreError::InvalidStateTransition { from, action: a })
                            if from == state && a == action
                    ));
                }
            }
        }
    }

    #[test]
    fn blue_score_ties_break_on_txid() {
        let mut a = attempt("tx-ccc");
        let mut b = attempt("tx-aaa");
        let mut c = attempt("tx-bbb");
        for x in [&mut a, &mut b, &mut c] {
            x.accepting_blue_score = Some(100);
            x.confirmations = 10;
        }
        let ranks = rank_attempts(OrderingMode::BlueScore, &[a, b, c], 1);
        let order: Vec<_> = ranks.iter().map(|r| r.txid.as_str()).collect();
        assert_eq!(order, vec!["tx-aaa", "tx-bbb", "tx-ccc"]);
        assert_eq!(ranks[0].final_rank, Some(1));
        assert_eq!(ranks[1].final_rank, Some(2));
        assert_eq!(ranks[2].final_rank, Some(3));
    }

    #[test]
    fn null_blue_score_sorts_after_all_defined_values() {
        let mut a = attempt("tx-late");
        a.accepting_blue_score = None;
        let mut b = attempt("tx-early");
        b.accepting_blue_score = Some(u64::MAX);
        let ranks = rank_attempts(OrderingMode::BlueScore, &[a, b], 1);
        assert_eq!(ranks[0].txid, "tx-early");
        assert_eq!(ranks[1].txid, "tx-late");
    }

    #[test]
    fn block_index_order_uses_number_then_log_index_then_txid() {
        let mut a = attempt("tx-b");
        a.block_number = Some(5);
        a.log_index = Some(2);
        let mut b = attempt("tx-a");
        b.block_number = Some(5);
        b.log_index = Some(1);
        let mut c = attempt("tx-c");
        c.block_number = Some(4);
        c.log_index = Some(9);
        let ranks = rank_attempts(OrderingMode::BlockIndex, &[a, b, c], 1);
        let order: Vec<_> = ranks.iter().map(|r| r.txid.as_str()).collect();
        assert_eq!(order, vec!["tx-c", "tx-a", "tx-b"]);
    }

    #[test]
    fn final_ranks_are_contiguous_over_the_final_subset() {
        let mut confirmed = attempt("tx-1");
        confirmed.accepting_blue_score = Some(10);
        confirmed.confirmations = 5;
        let mut shallow = attempt("tx-2");
        shallow.accepting_blue_score = Some(20);
        shallow.confirmations = 1;
        let mut deep = attempt("tx-3");
        deep.accepting_blue_score = Some(30);
        deep.confirmations = 9;
        let ranks = rank_attempts(OrderingMode::BlueScore, &[confirmed, shallow, deep], 5);
        assert_eq!(ranks[0].provisional_rank, 1);
        assert_eq!(ranks[0].final_rank, Some(1));
        assert_eq!(ranks[1].provisional_rank, 2);
        assert_eq!(ranks[1].final_rank, None);
        assert_eq!(ranks[2].provisional_rank, 3);
        assert_eq!(ranks[2].final_rank, Some(2));
    }

    #[test]
    fn invalid_and_unaccepted_attempts_never_rank() {
        let mut rejected = attempt("tx-bad");
        rejected.validation_status = ValidationStatus::InvalidWrongAmount;
        let mut unaccepted = attempt("tx-wait");
        unaccepted.accepted = false;
        let ranks = rank_attempts(OrderingMode::BlueScore, &[rejected, unaccepted], 1);
        assert!(ranks.is_empty());
    }

    #[test]
    fn ranking_is_deterministic_across_runs() {
        let mut snapshot = Vec::new();
        for i in 0..50u64 {
            let mut a = attempt(&format!("tx-{:03}", (i * 37) % 50));
            a.accepting_blue_score = Some(1000 - (i % 7) * 10);
            a.confirmations = (i % 3) as u32;
            snapshot.push(a);
        }
        let first = rank_attempts(OrderingMode::BlueScore, &snapshot, 2);
        let second = rank_attempts(OrderingMode::BlueScore, &snapshot, 2);
        assert_eq!(first, second);
    }

    #[test]
    fn winner_is_final_rank_within_supply() {
        let mut a = attempt("tx-1");
        a.final_rank = Some(1);
        assert!(a.is_winner(1));
        a.final_rank = Some(2);
        assert!(!a.is_winner(1));
        a.final_rank = None;
        assert!(!a.is_winner(1));
    }

    #[test]
    fn ticket_type_codes_are_validated_and_deduped() {
        assert!(valid_ticket_type_code("VIP"));
        assert!(valid_ticket_type_code("GA_2026"));
        assert!(!valid_ticket_type_code(""));
        assert!(!valid_ticket_type_code("lowercase"));
        assert!(!valid_ticket_type_code("TOO-DASHED"));
        assert!(!valid_ticket_type_code("A_VERY_LONG_CODE_INDEED"));

        let sale_id = Uuid::new_v4();
        let mk = |code: &str| TicketType {
            sale_id,
            code: code.into(),
            name: code.into(),
            price_sompi: 1,
            supply: 10,
            sort_order: 0,
        };
        assert!(duplicate_ticket_type_code(&[mk("VIP"), mk("GA")]).is_none());
        assert_eq!(
            duplicate_ticket_type_code(&[mk("DUP"), mk("GA"), mk("DUP")]),
            Some("DUP")
        );
    }

    #[test]
    fn sale_window_bounds_are_inclusive_of_interior_only() {
        let mut sale = Sale {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            network: "mainnet".into(),
            treasury_address: "kaspa:qtreasury".into(),
            ticket_price_sompi: 1_000_000,
            supply_total: 10,
            max_per_address: None,
            pow_difficulty: 8,
            finality_depth: 10,
            start_at: Some(DateTime::from_timestamp(1_000, 0).unwrap()),
            end_at: Some(DateTime::from_timestamp(2_000, 0).unwrap()),
            status: SaleStatus::Live,
            ordering: OrderingMode::BlueScore,
            fallback_enabled: false,
            allocation_frozen: false,
            merkle_root: None,
            commit_txid: None,
        };
        assert!(sale.accepts_timestamp(1_000));
        assert!(sale.accepts_timestamp(1_500));
        assert!(sale.accepts_timestamp(2_000));
        assert!(!sale.accepts_timestamp(999));
        assert!(!sale.accepts_timestamp(2_001));
        sale.start_at = None;
        assert!(sale.accepts_timestamp(0));
    }

    #[test]
    fn sale_validation_bounds() {
        let mut sale = Sale {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            network: "mainnet".into(),
            treasury_address: "kaspa:qtreasury".into(),
            ticket_price_sompi: 1_000_000,
            supply_total: 10,
            max_per_address: None,
            pow_difficulty: 8,
            finality_depth: 10,
            start_at: None,
            end_at: None,
            status: SaleStatus::Scheduled,
            ordering: OrderingMode::BlueScore,
            fallback_enabled: false,
            allocation_frozen: false,
            merkle_root: None,
            commit_txid: None,
        };
        assert!(sale.validate().is_ok());
        sale.pow_difficulty = 33;
        assert!(sale.validate().is_err());
        sale.pow_difficulty = 8;
        sale.finality_depth = 0;
        assert!(sale.validate().is_err());
        sale.finality_depth = 101;
        assert!(sale.validate().is_err());
    }

    #[test]
    fn allowed_amounts_prefer_ticket_types() {
        let sale = Sale {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            network: "mainnet".into(),
            treasury_address: "kaspa:qtreasury".into(),
            ticket_price_sompi: 1_000_000,
            supply_total: 10,
            max_per_address: None,
            pow_difficulty: 0,
            finality_depth: 1,
            start_at: None,
            end_at: None,
            status: SaleStatus::Live,
            ordering: OrderingMode::BlueScore,
            fallback_enabled: false,
            allocation_frozen: false,
            merkle_root: None,
            commit_txid: None,
        };
        assert_eq!(sale.allowed_amounts(&[]), vec![1_000_000]);
        let vip = TicketType {
            sale_id: sale.id,
            code: "VIP".into(),
            name: "VIP".into(),
            price_sompi: 5_000_000,
            supply: 2,
            sort_order: 0,
        };
        assert_eq!(sale.allowed_amounts(&[vip]), vec![5_000_000]);
    }
}
