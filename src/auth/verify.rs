use super::OAuthError;
use crate::store::CredentialStore;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

/// Who the bearer token belongs to, and what it may touch. Attached to the
/// request for downstream handlers (scope gating is per endpoint).
#[derive(Debug, Clone, Serialize)]
pub struct AccessContext {
    pub user_id: String,
    pub scope: String,
}

/// Resolves a raw Authorization header into an authenticated identity.
/// Read-only and side-effect-free: it sits on the hot path of every
/// protected request, and recording the call is the caller's job.
#[derive(Clone)]
pub struct TokenVerifier {
    store: Arc<dyn CredentialStore>,
}

impl TokenVerifier {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub async fn verify(&self, authorization: Option<&str>) -> Result<AccessContext, OAuthError> {
        let token = authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .filter(|t| !t.is_empty())
            .ok_or(OAuthError::Unauthorized)?;

        // revoked rows are filtered out at the store, so a revoked token is
        // indistinguishable from an unknown one
        let record = self
            .store
            .token_by_access(token)
            .await?
            .ok_or(OAuthError::InvalidToken)?;

        if record.expires_at < Utc::now() {
            return Err(OAuthError::TokenExpired);
        }

        Ok(AccessContext {
            user_id: record.user_id,
            scope: record.scope,
        })
    }
}
