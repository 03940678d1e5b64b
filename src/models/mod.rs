mod audit_log;
mod benefit_grant;
mod consumption;
mod idempotency_key;
mod order;
mod payment_event;
mod reconcile;
mod sku;
mod wallet;

pub use audit_log::*;
pub use benefit_grant::*;
pub use consumption::*;
pub use idempotency_key::*;
pub use order::*;
pub use payment_event::*;
pub use reconcile::*;
pub use sku::*;
pub use wallet::*;
