//! Wire-level codecs for the purchase flow: the binary payload envelope a
//! buyer attaches to their payment, the proof-of-work bound to it, and the
//! signed QR format used at the venue door.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub const PAYLOAD_LEN: usize = 59;
pub const PAYLOAD_MAGIC: [u8; 4] = *b"GPS1";
pub const PAYLOAD_VERSION: u8 = 0x01;
pub const POW_ALGO_SHA256: u8 = 0x01;
pub const BUYER_ADDR_HASH_LEN: usize = 20;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload must be {PAYLOAD_LEN} bytes, got {0}")]
    Length(usize),
    #[error("payload magic mismatch")]
    Magic,
    #[error("unsupported payload version {0:#04x}")]
    Version(u8),
    #[error("buyer address hash must be {BUYER_ADDR_HASH_LEN} bytes, got {0}")]
    BuyerHashLength(usize),
}

/// The v1 purchase envelope: sale binding, buyer fingerprint and proof of
/// work, packed into exactly 59 bytes, numeric fields big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchasePayload {
    pub sale_id: Uuid,
    pub buyer_addr_hash: [u8; BUYER_ADDR_HASH_LEN],
    pub client_time_ms: u64,
    pub pow_algo: u8,
    pub pow_difficulty: u8,
    pub pow_nonce: u64,
}

impl PurchasePayload {
    pub fn new(
        sale_id: Uuid,
        buyer_addr_hash: &[u8],
        client_time_ms: u64,
        pow_difficulty: u8,
        pow_nonce: u64,
    ) -> Result<Self, PayloadError> {
        let hash: [u8; BUYER_ADDR_HASH_LEN] = buyer_addr_hash
            .try_into()
            .map_err(|_| PayloadError::BuyerHashLength(buyer_addr_hash.len()))?;
        Ok(Self {
            sale_id,
            buyer_addr_hash: hash,
            client_time_ms,
            pow_algo: POW_ALGO_SHA256,
            pow_difficulty,
            pow_nonce,
        })
    }

    pub fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let mut out = [0u8; PAYLOAD_LEN];
        out[0..4].copy_from_slice(&PAYLOAD_MAGIC);
        out[4] = PAYLOAD_VERSION;
        out[5..21].copy_from_slice(self.sale_id.as_bytes());
        out[21..41].copy_from_slice(&self.buyer_addr_hash);
        out[41..49].copy_from_slice(&self.client_time_ms.to_be_bytes());
        out[49] = self.pow_algo;
        out[50] = self.pow_difficulty;
        out[51..59].copy_from_slice(&self.pow_nonce.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        if bytes.len() != PAYLOAD_LEN {
            return Err(PayloadError::Length(bytes.len()));
        }
        if bytes[0..4] != PAYLOAD_MAGIC {
            return Err(PayloadError::Magic);
        }
        if bytes[4] != PAYLOAD_VERSION {
            return Err(PayloadError::Version(bytes[4]));
        }
        let mut sale_bytes = [0u8; 16];
        sale_bytes.copy_from_slice(&bytes[5..21]);
        let sale_id = Uuid::from_bytes(sale_bytes);
        let mut buyer_addr_hash = [0u8; BUYER_ADDR_HASH_LEN];
        buyer_addr_hash.copy_from_slice(&bytes[21..41]);
        let client_time_ms = u64::from_be_bytes(bytes[41..49].try_into().unwrap_or_default());
        let pow_nonce = u64::from_be_bytes(bytes[51..59].try_into().unwrap_or_default());
        Ok(Self {
            sale_id,
            buyer_addr_hash,
            client_time_ms,
            pow_algo: bytes[49],
            pow_difficulty: bytes[50],
            pow_nonce,
        })
    }
}

/// 20-byte deterministic fingerprint of a buyer address: the trailing bytes
/// of Keccak-256 over the trimmed, lowercased address string. Binds a payload
/// to a buyer without revealing the address.
pub fn buyer_addr_hash(address: &str) -> [u8; BUYER_ADDR_HASH_LEN] {
    let normalized = address.trim().to_ascii_lowercase();
    let digest = Keccak256::digest(normalized.as_bytes());
    let mut out = [0u8; BUYER_ADDR_HASH_LEN];
    out.copy_from_slice(&digest[12..32]);
    out
}

/// Canonical message whose SHA-256 digest must clear the difficulty target.
pub fn pow_message(sale_id: &Uuid, buyer_addr_hash: &[u8; BUYER_ADDR_HASH_LEN], nonce: u64) -> String {
    format!(
        "GhostPassPoW|v1|{sale_id}|{}|{nonce}",
        hex::encode(buyer_addr_hash)
    )
}

/// Number of leading zero bits in a digest, MSB-first per byte.
pub fn leading_zero_bits(digest: &[u8]) -> u32 {
    let mut bits = 0u32;
    for byte in digest {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// Verifies a nonce with a single hash of the canonical message.
pub fn verify_pow(
    sale_id: &Uuid,
    buyer_addr_hash: &[u8; BUYER_ADDR_HASH_LEN],
    difficulty: u8,
    nonce: u64,
) -> bool {
    let digest = Sha256::digest(pow_message(sale_id, buyer_addr_hash, nonce).as_bytes());
    leading_zero_bits(&digest) >= u32::from(difficulty)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowSolution {
    pub nonce: u64,
    pub digest: [u8; 32],
    pub attempts: u64,
}

pub struct SolveOptions {
    /// Nonces tried between cooperative yields and progress reports.
    pub batch_size: u64,
    /// Checked between batches; a raised flag aborts the search.
    pub cancel: Arc<AtomicBool>,
    /// Called after every batch with the number of nonces tried so far.
    pub progress: Option<Box<dyn FnMut(u64) + Send>>,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }
}

/// Iterates nonces from 0 upward until one clears the difficulty target.
/// Yields to the runtime between batches so the search never starves I/O;
/// returns `None` when cancelled.
pub async fn solve_pow(
    sale_id: &Uuid,
    buyer_addr_hash: &[u8; BUYER_ADDR_HASH_LEN],
    difficulty: u8,
    mut opts: SolveOptions,
) -> Option<PowSolution> {
    let batch = opts.batch_size.max(1);
    let mut nonce = 0u64;
    loop {
        for _ in 0..batch {
            let digest = Sha256::digest(pow_message(sale_id, buyer_addr_hash, nonce).as_bytes());
            if leading_zero_bits(&digest) >= u32::from(difficulty) {
                return Some(PowSolution {
                    nonce,
                    digest: digest.into(),
                    attempts: nonce + 1,
                });
            }
            nonce = nonce.checked_add(1)?;
        }
        if let Some(progress) = opts.progress.as_mut() {
            progress(nonce);
        }
        if opts.cancel.load(Ordering::Relaxed) {
            return None;
        }
        tokio::task::yield_now().await;
    }
}

pub const QR_MAGIC: &str = "TK1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QrError {
    #[error("qr code is not in the expected format")]
    Format,
    #[error("unknown qr prefix")]
    Magic,
    #[error("qr field {0} is empty")]
    MissingField(&'static str),
    #[error("qr signature mismatch")]
    Signature,
}

/// The QR binding between an issued ticket and the winning purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketQr {
    pub ticket_id: String,
    pub sale_id: String,
    pub txid: String,
}

fn qr_mac(data: &TicketQr, secret: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(data.ticket_id.as_bytes());
    mac.update(b"|");
    mac.update(data.sale_id.as_bytes());
    mac.update(b"|");
    mac.update(data.txid.as_bytes());
    mac
}

/// `TK1|{ticketId}|{saleId}|{txid}|{sig}` with an HMAC-SHA256 signature.
pub fn encode_ticket_qr(data: &TicketQr, secret: &str) -> String {
    let sig = qr_mac(data, secret).finalize().into_bytes();
    format!(
        "{QR_MAGIC}|{}|{}|{}|{}",
        data.ticket_id,
        data.sale_id,
        data.txid,
        hex::encode(sig)
    )
}

/// Parses and authenticates a ticket QR. Signature comparison is constant
/// time.
pub fn decode_ticket_qr(raw: &str, secret: &str) -> Result<TicketQr, QrError> {
    let parts: Vec<&str> = raw.split('|').collect();
    if parts.len() != 5 {
        return Err(QrError::Format);
    }
    if parts[0] != QR_MAGIC {
        return Err(QrError::Magic);
    }
    let fields = [
        ("ticketId", parts[1]),
        ("saleId", parts[2]),
        ("txid", parts[3]),
        ("sig", parts[4]),
    ];
    for (name, value) in fields {
        if value.is_empty() {
            return Err(QrError::MissingField(name));
        }
    }
    let data = TicketQr {
        ticket_id: parts[1].to_string(),
        sale_id: parts[2].to_string(),
        txid: parts[3].to_string(),
    };
    let sig = hex::decode(parts[4]).map_err(|_| QrError::Signature)?;
    qr_mac(&data, secret)
        .verify_slice(&sig)
        .map_err(|_| QrError::Signature)?;
    Ok(data)
}
