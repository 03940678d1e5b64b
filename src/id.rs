//! Prefixed ID generation for ledger entities.
//!
//! Row ids use a `bl_` prefix so they never collide with provider ids
//! (Stripe's `evt_`, `pi_`, `ch_`, ...). Order numbers are the public
//! display key and use a bare `ord_` prefix.
//!
//! Format: `bl_{entity}_{uuid_simple}` (32 hex chars, no hyphens)

use uuid::Uuid;

const ALL_PREFIXES: &[&str] = &[
    "bl_ord_", "bl_evt_", "bl_grt_", "bl_con_", "bl_idk_", "bl_rcs_", "bl_aud_",
];

/// Cheap format check used to reject garbage ids before hitting the database.
pub fn is_valid_prefixed_id(s: &str) -> bool {
    let Some(prefix) = ALL_PREFIXES.iter().find(|p| s.starts_with(*p)) else {
        return false;
    };
    let hex_part = &s[prefix.len()..];
    hex_part.len() == 32 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Clone, Copy)]
pub enum EntityType {
    Order,
    PaymentEvent,
    BenefitGrant,
    Consumption,
    IdempotencyKey,
    ReconcileSnapshot,
    AuditLog,
}

impl EntityType {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Order => "bl_ord",
            Self::PaymentEvent => "bl_evt",
            Self::BenefitGrant => "bl_grt",
            Self::Consumption => "bl_con",
            Self::IdempotencyKey => "bl_idk",
            Self::ReconcileSnapshot => "bl_rcs",
            Self::AuditLog => "bl_aud",
        }
    }

    pub fn gen_id(&self) -> String {
        format!("{}_{}", self.prefix(), Uuid::new_v4().as_simple())
    }
}

/// New public order number.
pub fn gen_order_no() -> String {
    format!("ord_{}", Uuid::new_v4().as_simple())
}
