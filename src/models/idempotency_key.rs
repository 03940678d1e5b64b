use serde::{Deserialize, Serialize};

/// Generic ingestion dedup record, identity `(provider, external_id, recorded_at)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub id: String,
    pub provider: String,
    pub external_id: String,
    pub recorded_at: i64,
    pub hash: String,
    pub batch_id: Option<String>,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordIdempotencyKey {
    pub provider: String,
    pub external_id: String,
    pub recorded_at: i64,
    pub hash: String,
    pub batch_id: Option<String>,
}
