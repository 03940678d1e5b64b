//! Shared helpers: request metadata, payload digests, and the audit trail.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::db::{DbPool, queries};
use crate::error::AppError;
use crate::models::{ActorType, AuditAction, AuditLog, RequestMeta};

/// Stored excerpt of a webhook body, in bytes.
pub const PAYLOAD_EXCERPT_BYTES: usize = 8192;

/// Extract client IP address and user-agent from request headers.
///
/// Tries `x-forwarded-for` first (for proxied requests), then `x-real-ip`.
pub fn extract_request_info(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let ip = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    (ip, user_agent)
}

/// Request metadata captured with every webhook and operator action.
pub fn request_meta(headers: &HeaderMap) -> RequestMeta {
    let (ip_address, user_agent) = extract_request_info(headers);
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    RequestMeta {
        request_id,
        ip_address,
        user_agent,
    }
}

/// Extract a Bearer token from the Authorization header.
///
/// Returns the token without the "Bearer " prefix, or None if the header is
/// missing, malformed, or empty after the prefix.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// First `PAYLOAD_EXCERPT_BYTES` of the body as text, cut on a char boundary.
pub fn payload_excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= PAYLOAD_EXCERPT_BYTES {
        return text.into_owned();
    }
    let mut end = PAYLOAD_EXCERPT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Who performed an audited action.
#[derive(Debug, Clone)]
pub struct Actor {
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
}

impl Actor {
    pub fn provider(name: &str) -> Self {
        Self {
            actor_type: ActorType::Provider,
            actor_id: Some(name.to_string()),
        }
    }

    pub fn operator(id: Option<&str>) -> Self {
        Self {
            actor_type: ActorType::Operator,
            actor_id: id.map(String::from),
        }
    }

    pub fn collaborator(id: &str) -> Self {
        Self {
            actor_type: ActorType::Collaborator,
            actor_id: Some(id.to_string()),
        }
    }

    pub fn system(task: &str) -> Self {
        Self {
            actor_type: ActorType::System,
            actor_id: Some(task.to_string()),
        }
    }
}

/// Append-only audit sink backed by the audit database.
///
/// Entries are written after the ledger transaction they describe has
/// committed. A failed audit write is logged and never undoes ledger work.
#[derive(Clone)]
pub struct AuditTrail {
    pool: Option<DbPool>,
    enabled: bool,
}

impl AuditTrail {
    pub fn new(pool: DbPool, enabled: bool) -> Self {
        Self {
            pool: Some(pool),
            enabled,
        }
    }

    /// A trail that records nothing (CLI one-shots with auditing off, unit tests).
    pub fn disabled() -> Self {
        Self {
            pool: None,
            enabled: false,
        }
    }

    /// Start an audit entry.
    ///
    /// ```ignore
    /// audit
    ///     .entry(&actor)
    ///     .action(AuditAction::IssueGrant)
    ///     .resource("benefit_grant", &grant.id)
    ///     .details(json!({ "order_no": order.order_no }))
    ///     .org(grant.org_id)
    ///     .record();
    /// ```
    pub fn entry<'a>(&'a self, actor: &'a Actor) -> AuditEntry<'a> {
        AuditEntry {
            trail: self,
            actor,
            action: None,
            resource_type: "",
            resource_id: "",
            details: None,
            org_id: None,
            meta: None,
        }
    }
}

pub struct AuditEntry<'a> {
    trail: &'a AuditTrail,
    actor: &'a Actor,
    action: Option<AuditAction>,
    resource_type: &'a str,
    resource_id: &'a str,
    details: Option<serde_json::Value>,
    org_id: Option<i64>,
    meta: Option<&'a RequestMeta>,
}

impl<'a> AuditEntry<'a> {
    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn resource(mut self, resource_type: &'a str, resource_id: &'a str) -> Self {
        self.resource_type = resource_type;
        self.resource_id = resource_id;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn org(mut self, org_id: i64) -> Self {
        self.org_id = Some(org_id);
        self
    }

    pub fn request(mut self, meta: &'a RequestMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Write the entry. Returns None when auditing is off or the write failed.
    pub fn record(self) -> Option<AuditLog> {
        let pool = self.trail.pool.as_ref().filter(|_| self.trail.enabled)?;
        let Some(action) = self.action else {
            tracing::warn!(resource_type = self.resource_type, "Audit entry without action dropped");
            return None;
        };

        let result = pool.get().map_err(AppError::from).and_then(|conn| {
            queries::create_audit_log(
                &conn,
                self.actor.actor_type,
                self.actor.actor_id.as_deref(),
                action.as_ref(),
                self.resource_type,
                self.resource_id,
                self.details.as_ref(),
                self.org_id,
                self.meta.and_then(|m| m.ip_address.as_deref()),
                self.meta.and_then(|m| m.user_agent.as_deref()),
            )
        });

        match result {
            Ok(log) => Some(log),
            Err(e) => {
                tracing::warn!(
                    action = action.as_ref(),
                    resource_id = self.resource_id,
                    "Failed to write audit log: {}",
                    e
                );
                None
            }
        }
    }
}
