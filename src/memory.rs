use crate::store::{
    AuditLogEntry, AuthorizationCode, Client, CredentialStore, StoreError, TokenRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory credential store. One `RwLock`ed map per logical table; the
/// conditional updates take the write lock for the whole read-modify-write,
/// which gives us the row-level CAS semantics the trait demands.
///
/// Doesn't persist across restarts - it's the dev/test store and the seam
/// where a SQL-backed implementation would plug in.
#[derive(Clone, Default)]
pub struct MemoryStore {
    clients: Arc<RwLock<HashMap<String, Client>>>,
    codes: Arc<RwLock<HashMap<String, AuthorizationCode>>>,
    /// keyed by access_token
    tokens: Arc<RwLock<HashMap<String, TokenRecord>>>,
    hot_logs: Arc<RwLock<HashMap<Uuid, AuditLogEntry>>>,
    archived_logs: Arc<RwLock<HashMap<Uuid, AuditLogEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn insert_client(&self, client: Client) -> Result<(), StoreError> {
        let mut clients = self.clients.write().await;
        if clients.contains_key(&client.client_id) {
            return Err(StoreError::Conflict(format!(
                "client '{}' already registered",
                client.client_id
            )));
        }
        clients.insert(client.client_id.clone(), client);
        Ok(())
    }

    async fn client_by_id(&self, client_id: &str) -> Result<Option<Client>, StoreError> {
        Ok(self.clients.read().await.get(client_id).cloned())
    }

    async fn insert_code(&self, code: AuthorizationCode) -> Result<(), StoreError> {
        let mut codes = self.codes.write().await;
        if codes.contains_key(&code.code) {
            return Err(StoreError::Conflict(format!(
                "authorization code '{}' already exists",
                code.code
            )));
        }
        codes.insert(code.code.clone(), code);
        Ok(())
    }

    async fn unused_code(
        &self,
        code: &str,
        client_id: &str,
    ) -> Result<Option<AuthorizationCode>, StoreError> {
        let codes = self.codes.read().await;
        Ok(codes
            .get(code)
            .filter(|c| c.client_id == client_id && !c.used)
            .cloned())
    }

    async fn consume_code(&self, code: &str) -> Result<bool, StoreError> {
        // write lock held across the check-and-set; this is the CAS
        let mut codes = self.codes.write().await;
        match codes.get_mut(code) {
            Some(c) if !c.used => {
                c.used = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_token(&self, token: TokenRecord) -> Result<(), StoreError> {
        let mut tokens = self.tokens.write().await;
        if tokens.contains_key(&token.access_token) {
            return Err(StoreError::Conflict("access token collision".into()));
        }
        tokens.insert(token.access_token.clone(), token);
        Ok(())
    }

    async fn token_by_access(&self, access_token: &str) -> Result<Option<TokenRecord>, StoreError> {
        let tokens = self.tokens.read().await;
        Ok(tokens.get(access_token).filter(|t| !t.revoked).cloned())
    }

    async fn token_by_refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
    ) -> Result<Option<TokenRecord>, StoreError> {
        let tokens = self.tokens.read().await;
        Ok(tokens
            .values()
            .find(|t| t.refresh_token == refresh_token && t.client_id == client_id && !t.revoked)
            .cloned())
    }

    async fn replace_access_token(
        &self,
        refresh_token: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tokens = self.tokens.write().await;
        let old_key = tokens
            .values()
            .find(|t| t.refresh_token == refresh_token && !t.revoked)
            .map(|t| t.access_token.clone());
        match old_key {
            Some(key) => {
                let mut record = tokens.remove(&key).expect("row present under write lock");
                record.access_token = access_token.to_string();
                record.expires_at = expires_at;
                tokens.insert(record.access_token.clone(), record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_token(&self, access_token: &str) -> Result<bool, StoreError> {
        let mut tokens = self.tokens.write().await;
        match tokens.get_mut(access_token) {
            Some(t) if !t.revoked => {
                t.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_audit_log(&self, entry: AuditLogEntry) -> Result<(), StoreError> {
        self.hot_logs.write().await.insert(entry.id, entry);
        Ok(())
    }

    async fn hot_logs_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditLogEntry>, StoreError> {
        let logs = self.hot_logs.read().await;
        let mut aged: Vec<AuditLogEntry> = logs
            .values()
            .filter(|e| e.created_at < cutoff)
            .cloned()
            .collect();
        aged.sort_by_key(|e| e.created_at);
        aged.truncate(limit);
        Ok(aged)
    }

    async fn upsert_archived_logs(
        &self,
        entries: Vec<AuditLogEntry>,
        archived_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut archive = self.archived_logs.write().await;
        for mut entry in entries {
            // keep the original archived_at if a retried run re-inserts
            archive.entry(entry.id).or_insert_with(|| {
                entry.archived_at = Some(archived_at);
                entry
            });
        }
        Ok(())
    }

    async fn archived_ids(&self, ids: &[Uuid]) -> Result<Vec<Uuid>, StoreError> {
        let archive = self.archived_logs.read().await;
        Ok(ids
            .iter()
            .filter(|id| archive.contains_key(*id))
            .copied()
            .collect())
    }

    async fn delete_hot_logs(&self, ids: &[Uuid]) -> Result<usize, StoreError> {
        let mut logs = self.hot_logs.write().await;
        let before = logs.len();
        for id in ids {
            logs.remove(id);
        }
        Ok(before - logs.len())
    }

    async fn purge_archived_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let mut archive = self.archived_logs.write().await;
        let mut victims: Vec<(DateTime<Utc>, Uuid)> = archive
            .values()
            .filter(|e| e.created_at < cutoff)
            .map(|e| (e.created_at, e.id))
            .collect();
        victims.sort();
        victims.truncate(limit);
        for (_, id) in &victims {
            archive.remove(id);
        }
        Ok(victims.len())
    }

    async fn count_hot_logs(&self) -> Result<usize, StoreError> {
        Ok(self.hot_logs.read().await.len())
    }

    async fn count_archived_logs(&self) -> Result<usize, StoreError> {
        Ok(self.archived_logs.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn code(code: &str, used: bool) -> AuthorizationCode {
        AuthorizationCode {
            code: code.to_string(),
            client_id: "cid1".to_string(),
            user_id: "user-1".to_string(),
            scope: "profile".to_string(),
            redirect_uri: "https://example.com/cb".to_string(),
            expires_at: Utc::now() + Duration::minutes(10),
            used,
        }
    }

    #[tokio::test]
    async fn consume_code_is_single_shot() {
        let store = MemoryStore::new();
        store.insert_code(code("abc", false)).await.unwrap();

        assert!(store.consume_code("abc").await.unwrap());
        assert!(!store.consume_code("abc").await.unwrap());
        assert!(store.unused_code("abc", "cid1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unused_code_filters_on_client() {
        let store = MemoryStore::new();
        store.insert_code(code("abc", false)).await.unwrap();

        assert!(store.unused_code("abc", "cid1").await.unwrap().is_some());
        assert!(store.unused_code("abc", "other").await.unwrap().is_none());
        assert!(store.unused_code("nope", "cid1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn archive_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            endpoint: "/api/profile".to_string(),
            method: "GET".to_string(),
            status_code: 200,
            request_body: None,
            response_body: None,
            error_message: None,
            created_at: Utc::now() - Duration::days(100),
            archived_at: None,
        };
        let first = Utc::now() - Duration::hours(1);

        store
            .upsert_archived_logs(vec![entry.clone()], first)
            .await
            .unwrap();
        store
            .upsert_archived_logs(vec![entry.clone()], Utc::now())
            .await
            .unwrap();

        assert_eq!(store.count_archived_logs().await.unwrap(), 1);
        let confirmed = store.archived_ids(&[entry.id]).await.unwrap();
        assert_eq!(confirmed, vec![entry.id]);
    }
}
