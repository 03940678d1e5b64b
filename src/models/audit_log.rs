use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::pagination::PageWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActorType {
    /// Payment provider webhook (verified)
    Provider,
    /// Human operator via the ops API or CLI
    Operator,
    /// Downstream collaborator such as the report engine
    Collaborator,
    /// Background sweep, reconciler, startup tasks
    System,
}

/// Every money-affecting decision the pipeline makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditAction {
    CreateOrder,
    IssueGrant,
    RevokeGrant,
    AppendLedgerEntry,
    RefundOrder,
    RejectRefund,
    RecordConsumption,
    EscalateEvent,
    ReprocessEvent,
    ReconcileDay,
    UpsertSku,
    SeedSkus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: String,
    pub timestamp: i64,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub details: Option<serde_json::Value>,
    pub org_id: Option<i64>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditLogQuery {
    pub actor_type: Option<ActorType>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub org_id: Option<i64>,
    pub from_timestamp: Option<i64>,
    pub to_timestamp: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuditLogQuery {
    pub fn window(&self) -> PageWindow {
        PageWindow::new(self.limit, self.offset)
    }
}

impl AuditLog {
    /// One-line rendering for CLI output and log shipping.
    ///
    /// Format: `[TIMESTAMP] [ActorType] actor VERB RESOURCE (id) in org N`
    pub fn formatted(&self) -> String {
        use chrono::{TimeZone, Utc};

        let timestamp = Utc
            .timestamp_opt(self.timestamp, 0)
            .single()
            .map(|dt| format!("[{}]", dt.format("%Y-%m-%d %H:%M:%S")))
            .unwrap_or_else(|| format!("[{}]", self.timestamp));

        let actor_type = match self.actor_type {
            ActorType::Provider => "[Provider]    ",
            ActorType::Operator => "[Operator]    ",
            ActorType::Collaborator => "[Collaborator]",
            ActorType::System => "[System]      ",
        };

        let actor = self
            .actor_id
            .as_ref()
            .map(|id| format!("{} ", id))
            .unwrap_or_default();

        let org_context = self
            .org_id
            .map(|org| format!(" in org {}", org))
            .unwrap_or_default();

        format!(
            "{} {} {}{} {} ({}){}",
            timestamp,
            actor_type,
            actor,
            Self::action_to_verb_phrase(&self.action),
            self.resource_type.replace('_', " "),
            self.resource_id,
            org_context
        )
    }

    fn action_to_verb_phrase(action: &str) -> String {
        let (verb, _) = action.split_once('_').unwrap_or((action, ""));
        match verb {
            "create" => "created",
            "issue" => "issued",
            "revoke" => "revoked",
            "append" => "appended",
            "refund" => "refunded",
            "reject" => "rejected",
            "record" => "recorded",
            "escalate" => "escalated",
            "reprocess" => "reprocessed",
            "reconcile" => "reconciled",
            "upsert" => "upserted",
            "seed" => "seeded",
            other => other,
        }
        .to_string()
    }
}
