use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Order lifecycle. Refunds only reduce entitlements; rows are never deleted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Paid,
    Fulfilled,
    Refunded,
    Failed,
}

impl OrderStatus {
    /// Position along `created -> paid -> fulfilled -> refunded`.
    /// `Failed` is terminal and sits outside the progression.
    pub fn progress(self) -> Option<u8> {
        match self {
            OrderStatus::Created => Some(0),
            OrderStatus::Paid => Some(1),
            OrderStatus::Fulfilled => Some(2),
            OrderStatus::Refunded => Some(3),
            OrderStatus::Failed => None,
        }
    }

    /// Direct edges of the state machine.
    pub fn can_transition_to(self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, to),
            (Created, Paid)
                | (Created, Failed)
                | (Paid, Fulfilled)
                | (Paid, Refunded)
                | (Fulfilled, Refunded)
        )
    }

    /// True when the order already moved beyond `target`, so a late
    /// transition request is a replay and can be absorbed.
    pub fn is_past(self, target: OrderStatus) -> bool {
        match (self.progress(), target.progress()) {
            (Some(current), Some(target)) => current > target,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub order_no: String,
    pub org_id: i64,
    pub user_id: Option<String>,
    pub anon_id: Option<String>,
    pub sku: String,
    pub quantity: i64,
    pub target_attempt_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub provider: String,
    pub provider_order_id: Option<String>,
    pub idempotency_key: String,
    pub paid_at: Option<i64>,
    pub fulfilled_at: Option<i64>,
    pub refunded_at: Option<i64>,
    pub refund_amount_cents: i64,
    pub refund_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Order {
    /// Holder key used for grants issued from this order.
    pub fn benefit_ref(&self) -> String {
        self.anon_id
            .clone()
            .or_else(|| self.user_id.clone())
            .or_else(|| self.target_attempt_id.as_ref().map(|a| format!("attempt:{}", a)))
            .unwrap_or_else(|| format!("order:{}", self.order_no))
    }

    /// Amount still refundable.
    pub fn refundable_cents(&self) -> i64 {
        (self.amount_cents - self.refund_amount_cents).max(0)
    }
}

/// Purchase intent from the authenticated order endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrder {
    #[serde(default)]
    pub org_id: i64,
    pub provider: String,
    pub idempotency_key: String,
    pub sku: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    pub user_id: Option<String>,
    pub anon_id: Option<String>,
    pub target_attempt_id: Option<String>,
    /// Optional client-side price; must agree with the SKU when given.
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
}

fn default_quantity() -> i64 {
    1
}
