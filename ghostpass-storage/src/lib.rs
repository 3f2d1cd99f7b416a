//! Postgres persistence. The database is the single source of truth; every
//! mutation is a transactional operation or a single statement, and the
//! engine's idempotence guarantees (attempt dedupe, optimistic lifecycle
//! transitions, rank writes that skip unchanged rows) live here.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ghostpass_core::{
    Claim, Event, EventStatus, OrderingMode, PurchaseAttempt, RankAssignment, Sale, SaleStatus,
    TicketArtifact, TicketStatus, TicketType, ValidationStatus,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptCounts {
    pub total: u64,
    pub valid: u64,
    pub accepted: u64,
    pub finalized: u64,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn create_event(&self, event: &Event) -> Result<()>;
    async fn get_event(&self, id: Uuid) -> Result<Option<Event>>;
    async fn list_events(&self) -> Result<Vec<Event>>;
}

#[async_trait]
pub trait SaleStore: Send + Sync {
    /// Inserts the sale and its ticket types in one transaction. The caller
    /// validates codes and duplicates first.
    async fn create_sale(&self, sale: &Sale, types: &[TicketType]) -> Result<()>;
    async fn get_sale(&self, id: Uuid) -> Result<Option<Sale>>;
    async fn sales_in_status(&self, statuses: &[SaleStatus]) -> Result<Vec<Sale>>;
    async fn ticket_types(&self, sale_id: Uuid) -> Result<Vec<TicketType>>;
    async fn add_ticket_types(&self, sale_id: Uuid, types: &[TicketType]) -> Result<()>;
    /// Optimistic transition: updates only when the stored status matches
    /// `from`. Returns whether a row changed; under concurrency exactly one
    /// caller observes `true`.
    async fn transition_status(&self, id: Uuid, from: SaleStatus, to: SaleStatus) -> Result<bool>;
    /// Persists the committed root (null for an empty allocation) and raises
    /// the freeze flag in one statement.
    async fn freeze_allocation(&self, id: Uuid, merkle_root: Option<&str>) -> Result<()>;
    /// Records the commit txid only when none is stored yet. Returns whether
    /// this call set it; a `false` means some txid (possibly the same one)
    /// was already present.
    async fn set_commit_txid(&self, id: Uuid, txid: &str) -> Result<bool>;
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Insert-or-skip keyed on `(sale_id, txid)`. Returns `false` when the
    /// attempt already existed, which makes scanner passes idempotent.
    async fn insert_attempt(&self, attempt: &PurchaseAttempt) -> Result<bool>;
    async fn get_attempt(&self, sale_id: Uuid, txid: &str) -> Result<Option<PurchaseAttempt>>;
    async fn attempts_for_sale(&self, sale_id: Uuid) -> Result<Vec<PurchaseAttempt>>;
    /// Valid attempts still short of the finality depth.
    async fn pending_acceptance(
        &self,
        sale_id: Uuid,
        finality_depth: u32,
    ) -> Result<Vec<PurchaseAttempt>>;
    async fn apply_acceptance(
        &self,
        sale_id: Uuid,
        txid: &str,
        accepted: bool,
        confirmations: u32,
        accepting_block_hash: Option<&str>,
        accepting_blue_score: Option<u64>,
    ) -> Result<()>;
    /// Writes a full rank assignment for the sale. Rows whose stored ranks
    /// already match are left untouched; rows absent from the assignment
    /// have their ranks cleared. Returns the number of rows changed.
    async fn write_ranks(&self, sale_id: Uuid, ranks: &[RankAssignment]) -> Result<u64>;
    /// Attempts holding a final rank, ascending.
    async fn final_ranked(&self, sale_id: Uuid) -> Result<Vec<PurchaseAttempt>>;
    async fn counts(&self, sale_id: Uuid, finality_depth: u32) -> Result<AttemptCounts>;
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn insert_ticket(&self, ticket: &TicketArtifact) -> Result<()>;
    async fn get_ticket(&self, id: Uuid) -> Result<Option<TicketArtifact>>;
    async fn ticket_for_attempt(&self, sale_id: Uuid, txid: &str) -> Result<Option<TicketArtifact>>;
    /// Optimistic status change; `false` when the ticket was not in `from`.
    async fn set_ticket_status(
        &self,
        id: Uuid,
        from: TicketStatus,
        to: TicketStatus,
    ) -> Result<bool>;
    async fn record_scan(&self, ticket_id: Uuid, sale_id: Uuid, result: &str) -> Result<()>;
}

#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn upsert_claim(&self, claim: &Claim) -> Result<()>;
    async fn get_claim(&self, sale_id: Uuid, kaspa_txid: &str) -> Result<Option<Claim>>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS events(
        id UUID PRIMARY KEY,
        organizer_id TEXT NOT NULL,
        title TEXT NOT NULL,
        venue TEXT,
        start_at TIMESTAMPTZ,
        end_at TIMESTAMPTZ,
        status TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sales(
        id UUID PRIMARY KEY,
        event_id UUID NOT NULL REFERENCES events(id),
        network TEXT NOT NULL,
        treasury_address TEXT NOT NULL,
        ticket_price_sompi TEXT NOT NULL,
        supply_total INTEGER NOT NULL,
        max_per_address INTEGER,
        pow_difficulty SMALLINT NOT NULL,
        finality_depth INTEGER NOT NULL,
        start_at TIMESTAMPTZ,
        end_at TIMESTAMPTZ,
        status TEXT NOT NULL,
        ordering_mode TEXT NOT NULL,
        fallback_enabled BOOLEAN NOT NULL DEFAULT FALSE,
        allocation_frozen BOOLEAN NOT NULL DEFAULT FALSE,
        merkle_root TEXT,
        commit_txid TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS ticket_types(
        sale_id UUID NOT NULL REFERENCES sales(id),
        code TEXT NOT NULL,
        name TEXT NOT NULL,
        price_sompi TEXT NOT NULL,
        supply INTEGER NOT NULL,
        sort_order INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY(sale_id, code)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS purchase_attempts(
        sale_id UUID NOT NULL REFERENCES sales(id),
        txid TEXT NOT NULL,
        buyer_address TEXT,
        buyer_addr_hash TEXT,
        amount TEXT NOT NULL,
        block_hash TEXT,
        block_number BIGINT,
        block_timestamp BIGINT,
        log_index INTEGER,
        validation_status TEXT NOT NULL,
        invalid_reason TEXT,
        accepted BOOLEAN NOT NULL DEFAULT FALSE,
        confirmations BIGINT NOT NULL DEFAULT 0,
        accepting_block_hash TEXT,
        accepting_blue_score BIGINT,
        provisional_rank INTEGER,
        final_rank INTEGER,
        PRIMARY KEY(sale_id, txid)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS purchase_attempts_final_rank_idx
        ON purchase_attempts(sale_id, final_rank)"#,
    r#"CREATE TABLE IF NOT EXISTS tickets(
        id UUID PRIMARY KEY,
        sale_id UUID NOT NULL REFERENCES sales(id),
        txid TEXT NOT NULL,
        ticket_type_code TEXT,
        owner_address TEXT NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}',
        status TEXT NOT NULL,
        UNIQUE(sale_id, txid)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS scans(
        id UUID PRIMARY KEY,
        ticket_id UUID NOT NULL REFERENCES tickets(id),
        sale_id UUID NOT NULL,
        result TEXT NOT NULL,
        scanned_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS claims_onchain(
        sale_id UUID NOT NULL REFERENCES sales(id),
        kaspa_txid TEXT NOT NULL,
        type_code TEXT,
        claimer_evm_address TEXT NOT NULL,
        token_id BIGINT NOT NULL,
        final_rank INTEGER NOT NULL,
        block_number BIGINT NOT NULL,
        block_timestamp BIGINT NOT NULL,
        tx_hash TEXT NOT NULL,
        PRIMARY KEY(sale_id, kaspa_txid)
    )"#,
];

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .context("connecting to postgres")?;
        let store = Self { pool };
        store.migrate().await?;
        info!("database schema ready");
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn parse_sompi(text: &str) -> Result<u128> {
    text.parse::<u128>()
        .map_err(|_| anyhow!("non-integer sompi amount {text}"))
}

fn row_to_event(row: &PgRow) -> Result<Event> {
    let status: String = row.try_get("status")?;
    Ok(Event {
        id: row.try_get("id")?,
        organizer_id: row.try_get("organizer_id")?,
        title: row.try_get("title")?,
        venue: row.try_get("venue")?,
        start_at: row.try_get::<Option<DateTime<Utc>>, _>("start_at")?,
        end_at: row.try_get::<Option<DateTime<Utc>>, _>("end_at")?,
        status: EventStatus::from_str(&status)?,
    })
}

fn row_to_sale(row: &PgRow) -> Result<Sale> {
    let status: String = row.try_get("status")?;
    let ordering: String = row.try_get("ordering_mode")?;
    let price: String = row.try_get("ticket_price_sompi")?;
    let supply_total: i32 = row.try_get("supply_total")?;
    let max_per_address: Option<i32> = row.try_get("max_per_address")?;
    let pow_difficulty: i16 = row.try_get("pow_difficulty")?;
    let finality_depth: i32 = row.try_get("finality_depth")?;
    Ok(Sale {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        network: row.try_get("network")?,
        treasury_address: row.try_get("treasury_address")?,
        ticket_price_sompi: parse_sompi(&price)?,
        supply_total: supply_total.max(0) as u32,
        max_per_address: max_per_address.map(|v| v.max(0) as u32),
        pow_difficulty: pow_difficulty.clamp(0, i16::from(u8::MAX)) as u8,
        finality_depth: finality_depth.max(0) as u32,
        start_at: row.try_get::<Option<DateTime<Utc>>, _>("start_at")?,
        end_at: row.try_get::<Option<DateTime<Utc>>, _>("end_at")?,
        status: SaleStatus::from_str(&status)?,
        ordering: OrderingMode::from_str(&ordering)?,
        fallback_enabled: row.try_get("fallback_enabled")?,
        allocation_frozen: row.try_get("allocation_frozen")?,
        merkle_root: row.try_get("merkle_root")?,
        commit_txid: row.try_get("commit_txid")?,
    })
}

fn row_to_ticket_type(row: &PgRow) -> Result<TicketType> {
    let price: String = row.try_get("price_sompi")?;
    let supply: i32 = row.try_get("supply")?;
    Ok(TicketType {
        sale_id: row.try_get("sale_id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        price_sompi: parse_sompi(&price)?,
        supply: supply.max(0) as u32,
        sort_order: row.try_get("sort_order")?,
    })
}

fn row_to_attempt(row: &PgRow) -> Result<PurchaseAttempt> {
    let status: String = row.try_get("validation_status")?;
    let amount: String = row.try_get("amount")?;
    let block_number: Option<i64> = row.try_get("block_number")?;
    let log_index: Option<i32> = row.try_get("log_index")?;
    let confirmations: i64 = row.try_get("confirmations")?;
    let accepting_blue_score: Option<i64> = row.try_get("accepting_blue_score")?;
    let provisional_rank: Option<i32> = row.try_get("provisional_rank")?;
    let final_rank: Option<i32> = row.try_get("final_rank")?;
    Ok(PurchaseAttempt {
        sale_id: row.try_get("sale_id")?,
        txid: row.try_get("txid")?,
        buyer_address: row.try_get("buyer_address")?,
        buyer_addr_hash: row.try_get("buyer_addr_hash")?,
        amount: parse_sompi(&amount)?,
        block_hash: row.try_get("block_hash")?,
        block_number: block_number.map(|n| n.max(0) as u64),
        block_timestamp: row.try_get("block_timestamp")?,
        log_index: log_index.map(|i| i.max(0) as u32),
        validation_status: ValidationStatus::from_str(&status)?,
        invalid_reason: row.try_get("invalid_reason")?,
        accepted: row.try_get("accepted")?,
        confirmations: confirmations.clamp(0, i64::from(u32::MAX)) as u32,
        accepting_block_hash: row.try_get("accepting_block_hash")?,
        accepting_blue_score: accepting_blue_score.map(|s| s.max(0) as u64),
        provisional_rank: provisional_rank.map(|r| r.max(0) as u32),
        final_rank: final_rank.map(|r| r.max(0) as u32),
    })
}

fn row_to_ticket(row: &PgRow) -> Result<TicketArtifact> {
    let status: String = row.try_get("status")?;
    Ok(TicketArtifact {
        id: row.try_get("id")?,
        sale_id: row.try_get("sale_id")?,
        txid: row.try_get("txid")?,
        ticket_type_code: row.try_get("ticket_type_code")?,
        owner_address: row.try_get("owner_address")?,
        metadata: row.try_get("metadata")?,
        status: TicketStatus::from_str(&status)?,
    })
}

fn row_to_claim(row: &PgRow) -> Result<Claim> {
    let token_id: i64 = row.try_get("token_id")?;
    let final_rank: i32 = row.try_get("final_rank")?;
    let block_number: i64 = row.try_get("block_number")?;
    Ok(Claim {
        sale_id: row.try_get("sale_id")?,
        kaspa_txid: row.try_get("kaspa_txid")?,
        type_code: row.try_get("type_code")?,
        claimer_evm_address: row.try_get("claimer_evm_address")?,
        token_id: token_id.max(0) as u64,
        final_rank: final_rank.max(0) as u32,
        block_number: block_number.max(0) as u64,
        block_timestamp: row.try_get("block_timestamp")?,
        tx_hash: row.try_get("tx_hash")?,
    })
}

#[async_trait]
impl EventStore for PgStore {
    async fn create_event(&self, event: &Event) -> Result<()> {
        sqlx::query(
            "INSERT INTO events(id, organizer_id, title, venue, start_at, end_at, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.id)
        .bind(&event.organizer_id)
        .bind(&event.title)
        .bind(&event.venue)
        .bind(event.start_at)
        .bind(event.end_at)
        .bind(event.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_event(&r)).transpose()
    }

    async fn list_events(&self) -> Result<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events ORDER BY title")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_event).collect()
    }
}

#[async_trait]
impl SaleStore for PgStore {
    async fn create_sale(&self, sale: &Sale, types: &[TicketType]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO sales(id, event_id, network, treasury_address, ticket_price_sompi,
                               supply_total, max_per_address, pow_difficulty, finality_depth,
                               start_at, end_at, status, ordering_mode, fallback_enabled,
                               allocation_frozen, merkle_root, commit_txid)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, FALSE, NULL, NULL)",
        )
        .bind(sale.id)
        .bind(sale.event_id)
        .bind(&sale.network)
        .bind(&sale.treasury_address)
        .bind(sale.ticket_price_sompi.to_string())
        .bind(sale.supply_total as i32)
        .bind(sale.max_per_address.map(|v| v as i32))
        .bind(i16::from(sale.pow_difficulty))
        .bind(sale.finality_depth as i32)
        .bind(sale.start_at)
        .bind(sale.end_at)
        .bind(sale.status.as_str())
        .bind(sale.ordering.as_str())
        .bind(sale.fallback_enabled)
        .execute(&mut *tx)
        .await?;
        for t in types {
            sqlx::query(
                "INSERT INTO ticket_types(sale_id, code, name, price_sompi, supply, sort_order)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(sale.id)
            .bind(&t.code)
            .bind(&t.name)
            .bind(t.price_sompi.to_string())
            .bind(t.supply as i32)
            .bind(t.sort_order)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_sale(&self, id: Uuid) -> Result<Option<Sale>> {
        let row = sqlx::query("SELECT * FROM sales WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_sale(&r)).transpose()
    }

    async fn sales_in_status(&self, statuses: &[SaleStatus]) -> Result<Vec<Sale>> {
        let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query("SELECT * FROM sales WHERE status = ANY($1)")
            .bind(&names)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_sale).collect()
    }

    async fn ticket_types(&self, sale_id: Uuid) -> Result<Vec<TicketType>> {
        let rows = sqlx::query(
            "SELECT * FROM ticket_types WHERE sale_id = $1 ORDER BY sort_order, code",
        )
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_ticket_type).collect()
    }

    async fn add_ticket_types(&self, sale_id: Uuid, types: &[TicketType]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for t in types {
            sqlx::query(
                "INSERT INTO ticket_types(sale_id, code, name, price_sompi, supply, sort_order)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(sale_id)
            .bind(&t.code)
            .bind(&t.name)
            .bind(t.price_sompi.to_string())
            .bind(t.supply as i32)
            .bind(t.sort_order)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn transition_status(&self, id: Uuid, from: SaleStatus, to: SaleStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE sales SET status = $1 WHERE id = $2 AND status = $3")
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn freeze_allocation(&self, id: Uuid, merkle_root: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE sales SET merkle_root = $1, allocation_frozen = TRUE WHERE id = $2",
        )
        .bind(merkle_root)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_commit_txid(&self, id: Uuid, txid: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sales SET commit_txid = $1 WHERE id = $2 AND commit_txid IS NULL",
        )
        .bind(txid)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl AttemptStore for PgStore {
    async fn insert_attempt(&self, attempt: &PurchaseAttempt) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO purchase_attempts(sale_id, txid, buyer_address, buyer_addr_hash, amount,
                                           block_hash, block_number, block_timestamp, log_index,
                                           validation_status, invalid_reason, accepted,
                                           confirmations, accepting_block_hash,
                                           accepting_blue_score, provisional_rank, final_rank)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NULL, NULL)
             ON CONFLICT (sale_id, txid) DO NOTHING",
        )
        .bind(attempt.sale_id)
        .bind(&attempt.txid)
        .bind(&attempt.buyer_address)
        .bind(&attempt.buyer_addr_hash)
        .bind(attempt.amount.to_string())
        .bind(&attempt.block_hash)
        .bind(attempt.block_number.map(|n| n as i64))
        .bind(attempt.block_timestamp)
        .bind(attempt.log_index.map(|i| i as i32))
        .bind(attempt.validation_status.as_str())
        .bind(&attempt.invalid_reason)
        .bind(attempt.accepted)
        .bind(i64::from(attempt.confirmations))
        .bind(&attempt.accepting_block_hash)
        .bind(attempt.accepting_blue_score.map(|s| s as i64))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_attempt(&self, sale_id: Uuid, txid: &str) -> Result<Option<PurchaseAttempt>> {
        let row = sqlx::query("SELECT * FROM purchase_attempts WHERE sale_id = $1 AND txid = $2")
            .bind(sale_id)
            .bind(txid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_attempt(&r)).transpose()
    }

    async fn attempts_for_sale(&self, sale_id: Uuid) -> Result<Vec<PurchaseAttempt>> {
        let rows = sqlx::query("SELECT * FROM purchase_attempts WHERE sale_id = $1")
            .bind(sale_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_attempt).collect()
    }

    async fn pending_acceptance(
        &self,
        sale_id: Uuid,
        finality_depth: u32,
    ) -> Result<Vec<PurchaseAttempt>> {
        let rows = sqlx::query(
            "SELECT * FROM purchase_attempts
             WHERE sale_id = $1
               AND validation_status IN ('valid', 'valid_fallback')
               AND confirmations < $2
             ORDER BY txid",
        )
        .bind(sale_id)
        .bind(i64::from(finality_depth))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_attempt).collect()
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
        sqlx::query(
            "UPDATE purchase_attempts
             SET accepted = $1,
                 confirmations = $2,
                 accepting_block_hash = $3,
                 accepting_blue_score = COALESCE($4, accepting_blue_score)
             WHERE sale_id = $5 AND txid = $6",
        )
        .bind(accepted)
        .bind(i64::from(confirmations))
        .bind(accepting_block_hash)
        .bind(accepting_blue_score.map(|s| s as i64))
        .bind(sale_id)
        .bind(txid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn write_ranks(&self, sale_id: Uuid, ranks: &[RankAssignment]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut changed = 0u64;
        for assignment in ranks {
            let result = sqlx::query(
                "UPDATE purchase_attempts
                 SET provisional_rank = $1, final_rank = $2
                 WHERE sale_id = $3 AND txid = $4
                   AND (provisional_rank IS DISTINCT FROM $1
                        OR final_rank IS DISTINCT FROM $2)",
            )
            .bind(assignment.provisional_rank as i32)
            .bind(assignment.final_rank.map(|r| r as i32))
            .bind(sale_id)
            .bind(&assignment.txid)
            .execute(&mut *tx)
            .await?;
            changed += result.rows_affected();
        }
        let ranked: Vec<String> = ranks.iter().map(|r| r.txid.clone()).collect();
        let cleared = sqlx::query(
            "UPDATE purchase_attempts
             SET provisional_rank = NULL, final_rank = NULL
             WHERE sale_id = $1 AND txid != ALL($2)
               AND (provisional_rank IS NOT NULL OR final_rank IS NOT NULL)",
        )
        .bind(sale_id)
        .bind(&ranked)
        .execute(&mut *tx)
        .await?;
        changed += cleared.rows_affected();
        tx.commit().await?;
        Ok(changed)
    }

    async fn final_ranked(&self, sale_id: Uuid) -> Result<Vec<PurchaseAttempt>> {
        let rows = sqlx::query(
            "SELECT * FROM purchase_attempts
             WHERE sale_id = $1 AND final_rank IS NOT NULL
             ORDER BY final_rank ASC",
        )
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_attempt).collect()
    }

    async fn counts(&self, sale_id: Uuid, finality_depth: u32) -> Result<AttemptCounts> {
        let row = sqlx::query(
            "SELECT count(*) AS total,
                    count(*) FILTER (WHERE validation_status IN ('valid', 'valid_fallback'))
                        AS valid,
                    count(*) FILTER (WHERE validation_status IN ('valid', 'valid_fallback')
                                       AND accepted) AS accepted,
                    count(*) FILTER (WHERE validation_status IN ('valid', 'valid_fallback')
                                       AND accepted AND confirmations >= $2) AS finalized
             FROM purchase_attempts WHERE sale_id = $1",
        )
        .bind(sale_id)
        .bind(i64::from(finality_depth))
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        let valid: i64 = row.try_get("valid")?;
        let accepted: i64 = row.try_get("accepted")?;
        let finalized: i64 = row.try_get("finalized")?;
        Ok(AttemptCounts {
            total: total.max(0) as u64,
            valid: valid.max(0) as u64,
            accepted: accepted.max(0) as u64,
            finalized: finalized.max(0) as u64,
        })
    }
}

#[async_trait]
impl TicketStore for PgStore {
    async fn insert_ticket(&self, ticket: &TicketArtifact) -> Result<()> {
        sqlx::query(
            "INSERT INTO tickets(id, sale_id, txid, ticket_type_code, owner_address, metadata, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(ticket.id)
        .bind(ticket.sale_id)
        .bind(&ticket.txid)
        .bind(&ticket.ticket_type_code)
        .bind(&ticket.owner_address)
        .bind(&ticket.metadata)
        .bind(ticket.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<TicketArtifact>> {
        let row = sqlx::query("SELECT * FROM tickets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_ticket(&r)).transpose()
    }

    async fn ticket_for_attempt(
        &self,
        sale_id: Uuid,
        txid: &str,
    ) -> Result<Option<TicketArtifact>> {
        let row = sqlx::query("SELECT * FROM tickets WHERE sale_id = $1 AND txid = $2")
            .bind(sale_id)
            .bind(txid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_ticket(&r)).transpose()
    }

    async fn set_ticket_status(
        &self,
        id: Uuid,
        from: TicketStatus,
        to: TicketStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE tickets SET status = $1 WHERE id = $2 AND status = $3")
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_scan(&self, ticket_id: Uuid, sale_id: Uuid, result: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO scans(id, ticket_id, sale_id, result) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(ticket_id)
        .bind(sale_id)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ClaimStore for PgStore {
    async fn upsert_claim(&self, claim: &Claim) -> Result<()> {
        sqlx::query(
            "INSERT INTO claims_onchain(sale_id, kaspa_txid, type_code, claimer_evm_address,
                                        token_id, final_rank, block_number, block_timestamp, tx_hash)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (sale_id, kaspa_txid) DO UPDATE
             SET token_id = EXCLUDED.token_id,
                 final_rank = EXCLUDED.final_rank,
                 block_number = EXCLUDED.block_number,
                 block_timestamp = EXCLUDED.block_timestamp,
                 tx_hash = EXCLUDED.tx_hash",
        )
        .bind(claim.sale_id)
        .bind(&claim.kaspa_txid)
        .bind(&claim.type_code)
        .bind(&claim.claimer_evm_address)
        .bind(claim.token_id as i64)
        .bind(claim.final_rank as i32)
        .bind(claim.block_number as i64)
        .bind(claim.block_timestamp)
        .bind(&claim.tx_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_claim(&self, sale_id: Uuid, kaspa_txid: &str) -> Result<Option<Claim>> {
        let row = sqlx::query("SELECT * FROM claims_onchain WHERE sale_id = $1 AND kaspa_txid = $2")
            .bind(sale_id)
            .bind(kaspa_txid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_claim(&r)).transpose()
    }
}
