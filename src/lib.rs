//! benefit-ledger: turns verified payment-provider webhooks into exactly-once
//! entitlements (benefit grants and wallet credits), with refunds, retries,
//! an operator queue and daily reconciliation.

pub mod commerce;
pub mod config;
pub mod db;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod id;
pub mod middleware;
pub mod models;
pub mod pagination;
pub mod payments;
pub mod util;
