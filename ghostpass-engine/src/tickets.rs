//! Ticket issuance against winning attempts and the QR scan flow at the
//! venue door. Scan denials are business outcomes, not errors; the HTTP
//! layer reports them with a 200.

use crate::allocation::fetch_sale;
use anyhow::Result;
use ghostpass_codec::{decode_ticket_qr, encode_ticket_qr, QrError, TicketQr};
use ghostpass_core::{CoreError, TicketArtifact, TicketStatus};
use ghostpass_storage::{AttemptStore, SaleStore, TicketStore};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedTicket {
    pub ticket: TicketArtifact,
    pub qr: String,
}

/// Issues (or re-issues) the ticket bound to a winning attempt. Idempotent:
/// a second issue returns the stored artifact with a freshly encoded QR.
pub async fn issue_ticket<S>(
    store: &S,
    sale_id: Uuid,
    txid: &str,
    secret: &str,
) -> Result<IssuedTicket>
where
    S: SaleStore + AttemptStore + TicketStore,
{
    let sale = fetch_sale(store, sale_id).await?;
    let attempt = store
        .get_attempt(sale_id, txid)
        .await?
        .ok_or(CoreError::NotFound("purchase attempt"))?;
    if !attempt.is_winner(sale.supply_total) {
        return Err(CoreError::NotAWinner.into());
    }

    if let Some(existing) = store.ticket_for_attempt(sale_id, txid).await? {
        let qr = ticket_qr(&existing, secret);
        return Ok(IssuedTicket {
            ticket: existing,
            qr,
        });
    }

    let types = store.ticket_types(sale_id).await?;
    let ticket_type_code = types
        .iter()
        .find(|t| t.price_sompi == attempt.amount)
        .map(|t| t.code.clone());
    let owner_address = attempt
        .buyer_address
        .clone()
        .or_else(|| attempt.buyer_addr_hash.clone())
        .unwrap_or_default();
    let ticket = TicketArtifact {
        id: Uuid::new_v4(),
        sale_id,
        txid: txid.to_string(),
        ticket_type_code,
        owner_address,
        metadata: serde_json::json!({
            "finalRank": attempt.final_rank,
            "amount": attempt.amount.to_string(),
        }),
        status: TicketStatus::Issued,
    };
    store.insert_ticket(&ticket).await?;
    info!(sale = %sale_id, txid, ticket = %ticket.id, "ticket issued");
    let qr = ticket_qr(&ticket, secret);
    Ok(IssuedTicket { ticket, qr })
}

fn ticket_qr(ticket: &TicketArtifact, secret: &str) -> String {
    encode_ticket_qr(
        &TicketQr {
            ticket_id: ticket.id.to_string(),
            sale_id: ticket.sale_id.to_string(),
            txid: ticket.txid.clone(),
        },
        secret,
    )
}

fn qr_denial(err: &QrError) -> &'static str {
    match err {
        QrError::Format => "invalid_format",
        QrError::Magic => "invalid_magic",
        QrError::MissingField(_) => "missing_field",
        QrError::Signature => "invalid_signature",
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    pub valid: bool,
    pub result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<TicketArtifact>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemOutcome {
    pub success: bool,
    pub result: &'static str,
}

async fn lookup_ticket<S: TicketStore>(
    store: &S,
    qr: &TicketQr,
) -> Result<Option<TicketArtifact>> {
    let Ok(ticket_id) = qr.ticket_id.parse::<Uuid>() else {
        return Ok(None);
    };
    let Some(ticket) = store.get_ticket(ticket_id).await? else {
        return Ok(None);
    };
    if ticket.sale_id.to_string() != qr.sale_id || ticket.txid != qr.txid {
        return Ok(None);
    }
    Ok(Some(ticket))
}

/// Signature, binding and status check without touching state.
pub async fn verify_scan<S: TicketStore>(
    store: &S,
    raw: &str,
    secret: &str,
) -> Result<VerifyOutcome> {
    let qr = match decode_ticket_qr(raw, secret) {
        Ok(qr) => qr,
        Err(err) => {
            return Ok(VerifyOutcome {
                valid: false,
                result: qr_denial(&err),
                ticket: None,
            });
        }
    };
    let Some(ticket) = lookup_ticket(store, &qr).await? else {
        return Ok(VerifyOutcome {
            valid: false,
            result: "unknown_ticket",
            ticket: None,
        });
    };
    let (valid, result) = match ticket.status {
        TicketStatus::Issued => (true, "ok"),
        TicketStatus::Redeemed => (false, "already_redeemed"),
        TicketStatus::Cancelled => (false, "cancelled"),
    };
    Ok(VerifyOutcome {
        valid,
        result,
        ticket: Some(ticket),
    })
}

/// Marks the ticket redeemed. Idempotent: a repeat redeem succeeds without
/// changing state and reports `already_redeemed`.
pub async fn redeem_scan<S: TicketStore>(
    store: &S,
    raw: &str,
    secret: &str,
) -> Result<RedeemOutcome> {
    let qr = match decode_ticket_qr(raw, secret) {
        Ok(qr) => qr,
        Err(err) => {
            return Ok(RedeemOutcome {
                success: false,
                result: qr_denial(&err),
            });
        }
    };
    let Some(ticket) = lookup_ticket(store, &qr).await? else {
        return Ok(RedeemOutcome {
            success: false,
            result: "unknown_ticket",
        });
    };
    match ticket.status {
        TicketStatus::Cancelled => Ok(RedeemOutcome {
            success: false,
            result: "cancelled",
        }),
        TicketStatus::Redeemed => {
            store
                .record_scan(ticket.id, ticket.sale_id, "already_redeemed")
                .await?;
            Ok(RedeemOutcome {
                success: true,
                result: "already_redeemed",
            })
        }
        TicketStatus::Issued => {
            let flipped = store
                .set_ticket_status(ticket.id, TicketStatus::Issued, TicketStatus::Redeemed)
                .await?;
            let result = if flipped {
                "redeemed"
            } else {
                // A concurrent scanner beat us to it.
                "already_redeemed"
            };
            store.record_scan(ticket.id, ticket.sale_id, result).await?;
            info!(ticket = %ticket.id, result, "ticket scan");
            Ok(RedeemOutcome {
                success: true,
                result,
            })
        }
    }
}
