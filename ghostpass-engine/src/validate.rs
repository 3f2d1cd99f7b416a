//! Classification of raw treasury transfers into purchase attempts. Pure
//! over `(sale, allowed amounts, transfer)`: re-running on the same pair
//! always yields the same verdict.

use ghostpass_chain::TreasuryTransfer;
use ghostpass_codec::{verify_pow, PurchasePayload, BUYER_ADDR_HASH_LEN};
use ghostpass_core::{Sale, Sompi, ValidationStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Outside the sale window: not materialized as an attempt at all.
    Drop,
    Materialize {
        status: ValidationStatus,
        reason: Option<String>,
        buyer_addr_hash: Option<[u8; BUYER_ADDR_HASH_LEN]>,
    },
}

impl Verdict {
    fn invalid(status: ValidationStatus, reason: impl Into<String>) -> Self {
        Verdict::Materialize {
            status,
            reason: Some(reason.into()),
            buyer_addr_hash: None,
        }
    }
}

fn pays_allowed_amount(sale: &Sale, allowed: &[Sompi], transfer: &TreasuryTransfer) -> bool {
    transfer
        .to_address
        .eq_ignore_ascii_case(&sale.treasury_address)
        && allowed.contains(&transfer.value)
}

/// Runs the validation pipeline: window, payload presence, codec, sale
/// binding, proof of work, amount.
pub fn validate_transfer(sale: &Sale, allowed: &[Sompi], transfer: &TreasuryTransfer) -> Verdict {
    if let Some(ts) = transfer.block_timestamp {
        if !sale.accepts_timestamp(ts) {
            return Verdict::Drop;
        }
    }

    let payload_bytes = match &transfer.payload {
        Some(bytes) => bytes,
        None if sale.fallback_enabled => {
            // Fallback accepts bare transfers on amount alone; the buyer
            // fingerprint stays null because there is no payload to carry it.
            if !pays_allowed_amount(sale, allowed, transfer) {
                return Verdict::invalid(
                    ValidationStatus::InvalidWrongAmount,
                    format!("transfer of {} sompi matches no allowed amount", transfer.value),
                );
            }
            return Verdict::Materialize {
                status: ValidationStatus::ValidFallback,
                reason: None,
                buyer_addr_hash: None,
            };
        }
        None => {
            return Verdict::invalid(
                ValidationStatus::InvalidMissingPayload,
                "transfer carries no purchase payload",
            );
        }
    };

    let payload = match PurchasePayload::decode(payload_bytes) {
        Ok(payload) => payload,
        Err(err) => {
            return Verdict::invalid(ValidationStatus::InvalidBadPayload, err.to_string());
        }
    };

    if payload.sale_id != sale.id {
        return Verdict::invalid(
            ValidationStatus::InvalidWrongSale,
            format!("payload bound to sale {}", payload.sale_id),
        );
    }

    if !verify_pow(
        &sale.id,
        &payload.buyer_addr_hash,
        sale.pow_difficulty,
        payload.pow_nonce,
    ) {
        return Verdict::invalid(
            ValidationStatus::InvalidPow,
            format!("nonce {} misses difficulty {}", payload.pow_nonce, sale.pow_difficulty),
        );
    }

    if !pays_allowed_amount(sale, allowed, transfer) {
        return Verdict::invalid(
            ValidationStatus::InvalidWrongAmount,
            format!("transfer of {} sompi matches no allowed amount", transfer.value),
        );
    }

    Verdict::Materialize {
        status: ValidationStatus::Valid,
        reason: None,
        buyer_addr_hash: Some(payload.buyer_addr_hash),
    }
}
