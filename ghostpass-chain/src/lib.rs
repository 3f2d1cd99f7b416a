//! Read-only views over the chain: treasury-bound transfers and acceptance
//! data. The engine treats every implementation as idempotent and eventually
//! consistent; a transfer never disappears once visible, but confirmations
//! and the accepting block may move forward (or, on a reorg, sideways).

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use sqlx::{PgPool, Row};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain adapter unavailable: {0}")]
    Unavailable(String),
    #[error("malformed adapter response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreasuryTransfer {
    pub txid: String,
    pub from_address: Option<String>,
    pub to_address: String,
    pub value: u128,
    pub block_hash: Option<String>,
    pub block_number: Option<u64>,
    pub block_timestamp: Option<i64>,
    pub log_index: Option<u32>,
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxAcceptance {
    pub txid: String,
    pub is_accepted: bool,
    pub accepting_block_hash: Option<String>,
    pub confirmations: u32,
}

/// `(blockNumber, logIndex, txid)` ascending, missing values last. Sources
/// must hand the engine transfers in this order.
pub fn sort_transfers(transfers: &mut [TreasuryTransfer]) {
    transfers.sort_by(|a, b| {
        cmp_option(a.block_number, b.block_number)
            .then_with(|| cmp_option(a.log_index, b.log_index))
            .then_with(|| a.txid.cmp(&b.txid))
    });
}

fn cmp_option<T: Ord>(a: Option<T>, b: Option<T>) -> std::cmp::Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

/// Confirmations derived from the chain tip in transfer-table mode:
/// `max(0, tip − blockNumber + 1)`, clamped to `u32`.
pub fn confirmations_from_tip(tip: u64, block_number: u64) -> u32 {
    if block_number > tip {
        return 0;
    }
    (tip - block_number).saturating_add(1).min(u64::from(u32::MAX)) as u32
}

#[async_trait]
pub trait TransferSource: Send + Sync {
    /// All observed transfers that pay the treasury address, sorted by
    /// `(blockNumber, logIndex, txid)` ascending.
    async fn list_transfers(&self, treasury: &str) -> Result<Vec<TreasuryTransfer>, ChainError>;

    async fn current_tip(&self) -> Result<u64, ChainError>;
}

#[async_trait]
pub trait AcceptanceSource: Send + Sync {
    /// Acceptance records for a batch of transaction ids. Ids unknown to the
    /// adapter are simply absent from the result.
    async fn transaction_acceptance(
        &self,
        txids: &[String],
    ) -> Result<Vec<TxAcceptance>, ChainError>;

    /// Blue score of a block, when the chain exposes one.
    async fn block_blue_score(&self, block_hash: &str) -> Result<Option<u64>, ChainError>;
}

// ---------------------------------------------------------------------------
// Native REST adapter

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestOutput {
    address: String,
    #[serde(default)]
    amount: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestTransaction {
    transaction_id: String,
    #[serde(default)]
    block_time: Option<i64>,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    outputs: Vec<RestOutput>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestAcceptance {
    transaction_id: String,
    is_accepted: bool,
    #[serde(default)]
    accepting_block_hash: Option<String>,
    #[serde(default)]
    confirmations: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestBlock {
    blue_score: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestTip {
    blue_score: u64,
}

/// Adapter over a native-chain REST indexer. Transfers carry no block number
/// or log index here; ordering comes from the accepting block's blue score.
pub struct NativeRestSource {
    client: Client,
    base_url: String,
}

impl NativeRestSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ChainError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| ChainError::Unavailable(e.to_string()))?;
        resp.json::<T>()
            .await
            .map_err(|e| ChainError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl TransferSource for NativeRestSource {
    async fn list_transfers(&self, treasury: &str) -> Result<Vec<TreasuryTransfer>, ChainError> {
        let txs: Vec<RestTransaction> = self
            .get_json(&format!("/addresses/{treasury}/full-transactions"))
            .await?;
        let mut out = Vec::new();
        for tx in txs {
            let value: u128 = tx
                .outputs
                .iter()
                .filter(|o| o.address.eq_ignore_ascii_case(treasury))
                .map(|o| u128::from(o.amount))
                .sum();
            if value == 0 {
                continue;
            }
            let payload = match tx.payload.as_deref() {
                Some(p) if !p.is_empty() => {
                    Some(hex::decode(p).map_err(|e| ChainError::Malformed(e.to_string()))?)
                }
                _ => None,
            };
            out.push(TreasuryTransfer {
                txid: tx.transaction_id,
                from_address: None,
                to_address: treasury.to_string(),
                value,
                block_hash: None,
                block_number: None,
                // block_time is unix milliseconds on the wire.
                block_timestamp: tx.block_time.map(|ms| ms / 1000),
                log_index: None,
                payload,
            });
        }
        sort_transfers(&mut out);
        Ok(out)
    }

    async fn current_tip(&self) -> Result<u64, ChainError> {
        let tip: RestTip = self.get_json("/info/tip").await?;
        Ok(tip.blue_score)
    }
}

#[async_trait]
impl AcceptanceSource for NativeRestSource {
    async fn transaction_acceptance(
        &self,
        txids: &[String],
    ) -> Result<Vec<TxAcceptance>, ChainError> {
        if txids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/transactions/acceptance", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "transactionIds": txids }))
            .send()
            .await
            .map_err(|e| ChainError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| ChainError::Unavailable(e.to_string()))?;
        let records: Vec<RestAcceptance> = resp
            .json()
            .await
            .map_err(|e| ChainError::Malformed(e.to_string()))?;
        Ok(records
            .into_iter()
            .map(|r| TxAcceptance {
                txid: r.transaction_id,
                is_accepted: r.is_accepted,
                accepting_block_hash: r.accepting_block_hash,
                confirmations: r.confirmations,
            })
            .collect())
    }

    async fn block_blue_score(&self, block_hash: &str) -> Result<Option<u64>, ChainError> {
        let block: RestBlock = self.get_json(&format!("/blocks/{block_hash}")).await?;
        Ok(Some(block.blue_score))
    }
}

// ---------------------------------------------------------------------------
// Indexer-table adapter

/// Adapter over the `payment_transfers_onchain` table a separate indexer
/// keeps populated. Acceptance is synthesized from the table: a row exists
/// only once its transfer is in a block, so it is accepted by construction
/// and its confirmations follow the tip.
pub struct IndexerTableSource {
    pool: PgPool,
    schema: String,
}

impl IndexerTableSource {
    pub fn new(pool: PgPool, schema: &str) -> Result<Self> {
        if schema.is_empty()
            || !schema
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            bail!("indexer schema {schema:?} is not a valid identifier");
        }
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    fn table(&self) -> String {
        format!("{}.payment_transfers_onchain", self.schema)
    }
}

#[async_trait]
impl TransferSource for IndexerTableSource {
    async fn list_transfers(&self, treasury: &str) -> Result<Vec<TreasuryTransfer>, ChainError> {
        let sql = format!(
            "SELECT tx_hash, from_address, to_address, value::text AS value, block_hash, \
                    block_number, block_timestamp, log_index, payload \
             FROM {} WHERE lower(to_address) = lower($1) \
             ORDER BY block_number ASC, log_index ASC, tx_hash ASC",
            self.table()
        );
        let rows = sqlx::query(&sql)
            .bind(treasury)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ChainError::Unavailable(e.to_string()))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let value: String = row
                .try_get("value")
                .map_err(|e| ChainError::Malformed(e.to_string()))?;
            let value: u128 = value
                .parse()
                .map_err(|_| ChainError::Malformed(format!("non-integer value {value}")))?;
            let block_number: Option<i64> = row
                .try_get("block_number")
                .map_err(|e| ChainError::Malformed(e.to_string()))?;
            let log_index: Option<i32> = row
                .try_get("log_index")
                .map_err(|e| ChainError::Malformed(e.to_string()))?;
            let payload: Option<Vec<u8>> = row
                .try_get("payload")
                .map_err(|e| ChainError::Malformed(e.to_string()))?;
            out.push(TreasuryTransfer {
                txid: row
                    .try_get("tx_hash")
                    .map_err(|e| ChainError::Malformed(e.to_string()))?,
                from_address: row
                    .try_get("from_address")
                    .map_err(|e| ChainError::Malformed(e.to_string()))?,
                to_address: row
                    .try_get("to_address")
                    .map_err(|e| ChainError::Malformed(e.to_string()))?,
                value,
                block_hash: row
                    .try_get("block_hash")
                    .map_err(|e| ChainError::Malformed(e.to_string()))?,
                block_number: block_number.map(|n| n as u64),
                block_timestamp: row
                    .try_get("block_timestamp")
                    .map_err(|e| ChainError::Malformed(e.to_string()))?,
                log_index: log_index.map(|i| i as u32),
                payload,
            });
        }
        Ok(out)
    }

    async fn current_tip(&self) -> Result<u64, ChainError> {
        let sql = format!("SELECT max(block_number) AS tip FROM {}", self.table());
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ChainError::Unavailable(e.to_string()))?;
        let tip: Option<i64> = row
            .try_get("tip")
            .map_err(|e| ChainError::Malformed(e.to_string()))?;
        Ok(tip.unwrap_or(0).max(0) as u64)
    }
}

#[async_trait]
impl AcceptanceSource for IndexerTableSource {
    async fn transaction_acceptance(
        &self,
        txids: &[String],
    ) -> Result<Vec<TxAcceptance>, ChainError> {
        if txids.is_empty() {
            return Ok(Vec::new());
        }
        let tip = self.current_tip().await?;
        let sql = format!(
            "SELECT tx_hash, block_hash, block_number FROM {} WHERE tx_hash = ANY($1)",
            self.table()
        );
        let rows = sqlx::query(&sql)
            .bind(txids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ChainError::Unavailable(e.to_string()))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let block_number: Option<i64> = row
                .try_get("block_number")
                .map_err(|e| ChainError::Malformed(e.to_string()))?;
            let confirmations = block_number
                .map(|n| confirmations_from_tip(tip, n.max(0) as u64))
                .unwrap_or(0);
            out.push(TxAcceptance {
                txid: row
                    .try_get("tx_hash")
                    .map_err(|e| ChainError::Malformed(e.to_string()))?,
                is_accepted: true,
                accepting_block_hash: row
                    .try_get("block_hash")
                    .map_err(|e| ChainError::Malformed(e.to_string()))?,
                confirmations,
            });
        }
        Ok(out)
    }

    async fn block_blue_score(&self, _block_hash: &str) -> Result<Option<u64>, ChainError> {
        // The EVM-style table has no blue score; ordering in this mode uses
        // (blockNumber, logIndex, txid).
        Ok(None)
    }
}
