use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;

use crate::db::queries;
use crate::error::{AppError, ErrorCode, OptionExt, Result, msg};
use crate::id::{EntityType, gen_order_no};
use crate::models::{AuditAction, CreateOrder, Order, OrderStatus, SkuKind};
use crate::payments::PaymentProviders;
use crate::util::{Actor, AuditTrail};

pub const MAX_QUANTITY: i64 = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct OrderOutcome {
    pub order: Order,
    /// False when the idempotency key matched an existing order
    pub created: bool,
}

/// Create a purchase intent, idempotent on `(org_id, provider, idempotency_key)`.
///
/// A replay returns the stored order unchanged, even if the request body
/// differs or the SKU was since deactivated.
pub fn create_order(
    conn: &Connection,
    providers: &PaymentProviders,
    audit: &AuditTrail,
    actor: &Actor,
    input: &CreateOrder,
) -> Result<OrderOutcome> {
    let idempotency_key = input.idempotency_key.trim();
    if idempotency_key.is_empty() {
        return Err(AppError::BadRequest(msg::IDEMPOTENCY_KEY_REQUIRED.into()));
    }
    let provider = input.provider.trim();
    if !providers.is_enabled(provider) {
        return Err(AppError::BadRequest(msg::UNKNOWN_PROVIDER.into()));
    }

    if let Some(order) =
        queries::get_order_by_idempotency_key(conn, input.org_id, provider, idempotency_key)?
    {
        tracing::debug!(order_no = %order.order_no, org_id = order.org_id, "Order replay absorbed");
        return Ok(OrderOutcome {
            order,
            created: false,
        });
    }

    let user_id = non_blank(input.user_id.as_deref());
    let anon_id = non_blank(input.anon_id.as_deref());
    if user_id.is_none() && anon_id.is_none() {
        return Err(AppError::BadRequest(msg::BUYER_REQUIRED.into()));
    }
    if !(1..=MAX_QUANTITY).contains(&input.quantity) {
        return Err(AppError::BadRequest(msg::INVALID_QUANTITY.into()));
    }

    let sku = queries::resolve_sku(conn, input.org_id, input.sku.trim())?
        .or_not_found(msg::SKU_NOT_FOUND)?;
    let target_attempt_id = non_blank(input.target_attempt_id.as_deref());
    if sku.kind == SkuKind::ReportUnlock && target_attempt_id.is_none() {
        return Err(AppError::Unprocessable {
            code: ErrorCode::AttemptRequired,
            message: format!("SKU {} unlocks an attempt; target_attempt_id is required", sku.sku),
        });
    }

    let amount_cents = sku
        .price_cents
        .checked_mul(input.quantity)
        .ok_or_else(|| AppError::BadRequest(msg::AMOUNT_OVERFLOW.into()))?;
    if let Some(claimed) = input.amount_cents {
        if claimed != amount_cents {
            return Err(AppError::Unprocessable {
                code: ErrorCode::AmountMismatch,
                message: format!("amount_cents {} does not match SKU price {}", claimed, amount_cents),
            });
        }
    }
    if let Some(currency) = input.currency.as_deref() {
        if !currency.trim().eq_ignore_ascii_case(&sku.currency) {
            return Err(AppError::Unprocessable {
                code: ErrorCode::CurrencyMismatch,
                message: format!("currency {} does not match SKU currency {}", currency, sku.currency),
            });
        }
    }

    let now = queries::now();
    let order = Order {
        id: EntityType::Order.gen_id(),
        order_no: gen_order_no(),
        org_id: input.org_id,
        user_id,
        anon_id,
        sku: sku.sku.clone(),
        quantity: input.quantity,
        target_attempt_id,
        amount_cents,
        currency: sku.currency.clone(),
        status: OrderStatus::Created,
        provider: provider.to_string(),
        provider_order_id: None,
        idempotency_key: idempotency_key.to_string(),
        paid_at: None,
        fulfilled_at: None,
        refunded_at: None,
        refund_amount_cents: 0,
        refund_reason: None,
        created_at: now,
        updated_at: now,
    };

    if !queries::insert_order(conn, &order)? {
        // Lost a race against a concurrent request with the same key.
        let existing =
            queries::get_order_by_idempotency_key(conn, input.org_id, provider, idempotency_key)?
                .ok_or_else(|| AppError::Internal("order vanished after conflict".into()))?;
        return Ok(OrderOutcome {
            order: existing,
            created: false,
        });
    }

    tracing::info!(
        order_no = %order.order_no,
        org_id = order.org_id,
        provider = %order.provider,
        sku = %order.sku,
        amount_cents = order.amount_cents,
        "Order created"
    );

    audit
        .entry(actor)
        .action(AuditAction::CreateOrder)
        .resource("order", &order.order_no)
        .details(json!({
            "sku": order.sku,
            "quantity": order.quantity,
            "amount_cents": order.amount_cents,
            "currency": order.currency,
            "provider": order.provider,
        }))
        .org(order.org_id)
        .record();

    Ok(OrderOutcome {
        order,
        created: true,
    })
}

/// Order lookup scoped to its org; other orgs' orders read as missing.
pub fn get_order(conn: &Connection, org_id: i64, order_no: &str) -> Result<Order> {
    queries::get_order_in_org(conn, org_id, order_no)?.or_not_found(msg::ORDER_NOT_FOUND)
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}
