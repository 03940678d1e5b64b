use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::GrantScope;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SkuKind {
    /// Tops up a wallet by `unit_qty * quantity`
    CreditPack,
    /// Unlocks the report of the order's target attempt
    ReportUnlock,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkuMeta {
    /// Grant lifetime; `None` means the grant never expires
    pub duration_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sku {
    pub org_id: i64,
    pub sku: String,
    pub kind: SkuKind,
    pub unit_qty: i64,
    pub benefit_code: String,
    pub scope: GrantScope,
    pub price_cents: i64,
    pub currency: String,
    pub is_active: bool,
    pub meta: SkuMeta,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertSku {
    #[serde(default)]
    pub org_id: i64,
    pub sku: String,
    pub kind: SkuKind,
    #[serde(default = "default_unit_qty")]
    pub unit_qty: i64,
    pub benefit_code: String,
    pub scope: Option<GrantScope>,
    pub price_cents: i64,
    pub currency: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub meta: SkuMeta,
}

fn default_unit_qty() -> i64 {
    1
}

fn default_active() -> bool {
    true
}
