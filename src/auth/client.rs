use super::OAuthError;
use crate::store::{Client, CredentialStore};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Stand-in secret for unknown clients; fixed length so the comparison
/// takes the same path whether or not the client exists.
const DUMMY_SECRET: &[u8] = &[0u8; 32];

/// Validates presented client credentials against the client table.
/// Stateless given the store; no side effects.
#[derive(Clone)]
pub struct ClientAuthenticator {
    store: Arc<dyn CredentialStore>,
}

impl ClientAuthenticator {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub async fn authenticate(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Client, OAuthError> {
        let client = self.store.client_by_id(client_id).await?;

        // Constant-time comparison to prevent timing attacks. An unknown
        // client is compared against a fixed-length dummy so the miss path
        // is length-uniform and a wrong id takes as long as a wrong secret
        // (ct_eq bails on the length check, so the dummy must not vary).
        let expected = client
            .as_ref()
            .map_or(DUMMY_SECRET, |c| c.client_secret.as_bytes());
        let secret_matches: bool = client_secret.as_bytes().ct_eq(expected).into();

        match client {
            Some(c) if secret_matches => Ok(c),
            _ => {
                tracing::warn!(
                    "Invalid client credentials attempted for client_id: {}",
                    client_id
                );
                Err(OAuthError::InvalidClient)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::Utc;

    async fn store_with_client() -> Arc<dyn CredentialStore> {
        let store = MemoryStore::new();
        store
            .insert_client(Client {
                client_id: "cid1".to_string(),
                client_secret: "secret1".to_string(),
                name: Some("test agent".to_string()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn accepts_matching_credentials() {
        let auth = ClientAuthenticator::new(store_with_client().await);
        let client = auth.authenticate("cid1", "secret1").await.unwrap();
        assert_eq!(client.client_id, "cid1");
    }

    #[tokio::test]
    async fn rejects_wrong_secret_and_unknown_client() {
        let auth = ClientAuthenticator::new(store_with_client().await);
        assert!(matches!(
            auth.authenticate("cid1", "wrong").await,
            Err(OAuthError::InvalidClient)
        ));
        assert!(matches!(
            auth.authenticate("nobody", "secret1").await,
            Err(OAuthError::InvalidClient)
        ));
    }

    #[tokio::test]
    async fn unknown_client_is_rejected_even_if_the_dummy_would_match() {
        let auth = ClientAuthenticator::new(store_with_client().await);
        // 32 NUL bytes equals the stand-in secret byte-for-byte; the guard
        // on the row still has to win
        let zeroed = "\0".repeat(32);
        assert!(matches!(
            auth.authenticate("nobody", &zeroed).await,
            Err(OAuthError::InvalidClient)
        ));
    }
}
