use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Store-layer failure. Everything the HTTP surface can't express more
/// precisely maps onto `server_error`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record already exists: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A registered client application (e.g. a third-party AI agent).
/// Provisioned out-of-band; read-only to the token machinery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    pub client_secret: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Single-use authorization code written by the consent step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub user_id: String,
    /// space-delimited permission strings, e.g. "profile connections"
    pub scope: String,
    pub redirect_uri: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

/// Access/refresh token pair. The access token rotates on refresh; the
/// refresh token is the stable identity of the grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
    pub user_id: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    /// Only set when a refresh-token TTL is configured; None means the
    /// refresh token never expires.
    pub refresh_expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

/// One protected API call, as recorded by the audit logger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub user_id: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set once the entry has been moved to the archive store.
    pub archived_at: Option<DateTime<Utc>>,
}

/// Persistence seam for the whole core: clients, codes, tokens, and the
/// hot/archive audit log tables. Implementations must provide row-level
/// atomicity for the conditional updates (`consume_code`,
/// `replace_access_token`, `revoke_token`) - those are the only places
/// where concurrent requests can race for the same row.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn insert_client(&self, client: Client) -> Result<(), StoreError>;
    async fn client_by_id(&self, client_id: &str) -> Result<Option<Client>, StoreError>;

    async fn insert_code(&self, code: AuthorizationCode) -> Result<(), StoreError>;
    /// Look up a code by (code, client_id) where `used = false`.
    async fn unused_code(
        &self,
        code: &str,
        client_id: &str,
    ) -> Result<Option<AuthorizationCode>, StoreError>;
    /// Compare-and-swap `used` false -> true. Returns false if the code is
    /// missing or was already consumed; this is the single-redemption
    /// guarantee under concurrent exchange attempts.
    async fn consume_code(&self, code: &str) -> Result<bool, StoreError>;

    async fn insert_token(&self, token: TokenRecord) -> Result<(), StoreError>;
    /// Look up by access token where `revoked = false`.
    async fn token_by_access(&self, access_token: &str) -> Result<Option<TokenRecord>, StoreError>;
    /// Look up by (refresh_token, client_id) where `revoked = false`.
    async fn token_by_refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
    ) -> Result<Option<TokenRecord>, StoreError>;
    /// Rotate the access token of an existing grant in place. Returns false
    /// if no live row matched the refresh token.
    async fn replace_access_token(
        &self,
        refresh_token: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// One-way `revoked` false -> true. Returns false if nothing matched.
    async fn revoke_token(&self, access_token: &str) -> Result<bool, StoreError>;

    async fn append_audit_log(&self, entry: AuditLogEntry) -> Result<(), StoreError>;
    /// Hot entries with `created_at` before the cutoff, oldest first,
    /// capped at `limit`.
    async fn hot_logs_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditLogEntry>, StoreError>;
    /// Idempotent archive insert keyed by entry id: re-inserting an already
    /// archived entry is a no-op, so a crashed run can be retried safely.
    async fn upsert_archived_logs(
        &self,
        entries: Vec<AuditLogEntry>,
        archived_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    /// Which of the given ids are present in the archive.
    async fn archived_ids(&self, ids: &[Uuid]) -> Result<Vec<Uuid>, StoreError>;
    async fn delete_hot_logs(&self, ids: &[Uuid]) -> Result<usize, StoreError>;
    /// Delete up to `limit` archive entries with `created_at` before the
    /// cutoff, returning how many went away.
    async fn purge_archived_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError>;
    async fn count_hot_logs(&self) -> Result<usize, StoreError>;
    async fn count_archived_logs(&self) -> Result<usize, StoreError>;
}
