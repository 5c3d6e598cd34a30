use crate::store::{AuditLogEntry, CredentialStore};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Longest request/response body we keep per entry; anything bigger is
/// truncated before it hits the store.
const BODY_CAP: usize = 2048;

/// One protected API call, as seen by the boundary.
#[derive(Debug, Clone)]
pub struct ApiCall {
    pub user_id: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
}

/// Appends one hot audit-log entry per protected call. Callers treat this
/// as fire-and-forget: a failed write is reported at error level and never
/// fails the API response it describes.
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn CredentialStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, call: ApiCall) {
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            user_id: call.user_id,
            endpoint: call.endpoint.clone(),
            method: call.method.clone(),
            status_code: call.status_code,
            request_body: call.request_body.map(truncate_body),
            response_body: call.response_body.map(truncate_body),
            error_message: call.error_message,
            created_at: Utc::now(),
            archived_at: None,
        };

        if let Err(e) = self.store.append_audit_log(entry).await {
            // the call itself already succeeded or failed on its own terms;
            // a hole in the audit trail is an operational incident, not a
            // caller-visible one
            tracing::error!(
                "failed to record audit log for {} {}: {}",
                call.method,
                call.endpoint,
                e
            );
        }
    }
}

fn truncate_body(body: String) -> String {
    if body.len() <= BODY_CAP {
        return body;
    }
    let mut cut = BODY_CAP;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...[truncated]", &body[..cut])
}
