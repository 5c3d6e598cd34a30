use super::{ClientAuthenticator, OAuthError};
use crate::store::{CredentialStore, TokenRecord};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// OAuth 2.0 token request (supports both grant types)
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Authorization code (authorization_code grant)
    pub code: Option<String>,
    /// Optional; when present it must match the URI the code was issued for
    pub redirect_uri: Option<String>,
    /// Refresh token (refresh_token grant)
    pub refresh_token: Option<String>,
}

/// Successful token response body
#[derive(Debug, Clone, Serialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_token: String,
    pub scope: String,
}

/// Token lifetimes. Refresh tokens are long-lived credentials by default;
/// setting `refresh_ttl` opts into expiring them (see --refresh-token-ttl).
#[derive(Debug, Clone, Copy)]
pub struct TokenPolicy {
    pub access_ttl: Duration,
    pub refresh_ttl: Option<Duration>,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            access_ttl: Duration::hours(1),
            refresh_ttl: None,
        }
    }
}

/// The grant-handling state machine behind the token endpoint: exchanges
/// authorization codes for fresh token pairs and rotates access tokens on
/// refresh. All coordination happens through the store's row-level
/// conditional updates; there is no shared mutable state here.
#[derive(Clone)]
pub struct TokenService {
    store: Arc<dyn CredentialStore>,
    authenticator: ClientAuthenticator,
    policy: TokenPolicy,
}

impl TokenService {
    pub fn new(store: Arc<dyn CredentialStore>, policy: TokenPolicy) -> Self {
        let authenticator = ClientAuthenticator::new(store.clone());
        Self {
            store,
            authenticator,
            policy,
        }
    }

    /// Single entry point for the token endpoint: authenticates the client,
    /// then dispatches on grant_type.
    pub async fn grant(&self, req: &TokenRequest) -> Result<TokenGrant, OAuthError> {
        let (client_id, client_secret) = match (&req.client_id, &req.client_secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => (id, secret),
            _ => return Err(OAuthError::InvalidRequest("Missing client credentials")),
        };

        let client = self
            .authenticator
            .authenticate(client_id, client_secret)
            .await?;

        match req.grant_type.as_str() {
            "authorization_code" => self.exchange_code(&client.client_id, req).await,
            "refresh_token" => self.refresh(&client.client_id, req).await,
            other => Err(OAuthError::UnsupportedGrantType(other.to_string())),
        }
    }

    /// authorization_code grant: validate the code, consume it exactly once,
    /// mint a fresh access/refresh pair.
    async fn exchange_code(
        &self,
        client_id: &str,
        req: &TokenRequest,
    ) -> Result<TokenGrant, OAuthError> {
        let code = req
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(OAuthError::InvalidRequest("Missing authorization code"))?;

        let pending = self
            .store
            .unused_code(code, client_id)
            .await?
            .ok_or(OAuthError::InvalidGrant("Invalid or expired authorization code"))?;

        if pending.expires_at < Utc::now() {
            tracing::warn!("Expired authorization code presented by client {}", client_id);
            return Err(OAuthError::InvalidGrant("Authorization code expired"));
        }

        if let Some(redirect_uri) = req.redirect_uri.as_deref()
            && redirect_uri != pending.redirect_uri
        {
            tracing::warn!(
                "redirect_uri mismatch for client {}: expected '{}', got '{}'",
                client_id,
                pending.redirect_uri,
                redirect_uri
            );
            return Err(OAuthError::InvalidGrant("Redirect URI mismatch"));
        }

        // The conditional update is the single-redemption guarantee: of N
        // concurrent exchanges of the same code, exactly one wins this CAS.
        // Losers see the same invalid_grant as a stale lookup.
        if !self.store.consume_code(code).await? {
            return Err(OAuthError::InvalidGrant("Invalid or expired authorization code"));
        }

        let now = Utc::now();
        let token = TokenRecord {
            access_token: opaque_token(),
            refresh_token: opaque_token(),
            client_id: client_id.to_string(),
            user_id: pending.user_id,
            scope: pending.scope,
            expires_at: now + self.policy.access_ttl,
            refresh_expires_at: self.policy.refresh_ttl.map(|ttl| now + ttl),
            revoked: false,
            created_at: now,
        };

        // If this insert fails the code is already burned - we don't retry,
        // the client has to go back through consent.
        self.store.insert_token(token.clone()).await?;

        tracing::info!(
            "Issued token pair via authorization_code for user {} (client {})",
            token.user_id,
            client_id
        );

        Ok(self.grant_response(token))
    }

    /// refresh_token grant: rotate the access token in place. The refresh
    /// token itself and the user/scope identity are preserved.
    async fn refresh(&self, client_id: &str, req: &TokenRequest) -> Result<TokenGrant, OAuthError> {
        let refresh_token = req
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(OAuthError::InvalidRequest("Missing refresh token"))?;

        let mut record = self
            .store
            .token_by_refresh(refresh_token, client_id)
            .await?
            .ok_or(OAuthError::InvalidGrant("Invalid refresh token"))?;

        // Only enforced when a refresh TTL is configured; same coarse error
        // as a miss, on purpose.
        if let Some(deadline) = record.refresh_expires_at
            && deadline < Utc::now()
        {
            tracing::warn!("Expired refresh token presented by client {}", client_id);
            return Err(OAuthError::InvalidGrant("Invalid refresh token"));
        }

        let new_access = opaque_token();
        let expires_at = Utc::now() + self.policy.access_ttl;
        if !self
            .store
            .replace_access_token(refresh_token, &new_access, expires_at)
            .await?
        {
            // row revoked or deleted between lookup and update
            return Err(OAuthError::InvalidGrant("Invalid refresh token"));
        }

        record.access_token = new_access;
        record.expires_at = expires_at;

        tracing::info!(
            "Rotated access token via refresh_token for user {} (client {})",
            record.user_id,
            client_id
        );

        Ok(self.grant_response(record))
    }

    fn grant_response(&self, token: TokenRecord) -> TokenGrant {
        TokenGrant {
            access_token: token.access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.policy.access_ttl.num_seconds(),
            refresh_token: token.refresh_token,
            scope: token.scope,
        }
    }
}

/// 32 bytes from the OS-seeded CSPRNG, base64url without padding. Opaque,
/// unguessable, and safe to put in form bodies and headers.
fn opaque_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::{AuthorizationCode, Client, CredentialStore};
    use std::collections::HashSet;

    fn request(grant_type: &str) -> TokenRequest {
        TokenRequest {
            grant_type: grant_type.to_string(),
            client_id: Some("cid1".to_string()),
            client_secret: Some("secret1".to_string()),
            code: None,
            redirect_uri: None,
            refresh_token: None,
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_client(Client {
                client_id: "cid1".to_string(),
                client_secret: "secret1".to_string(),
                name: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .insert_code(AuthorizationCode {
                code: "abc123".to_string(),
                client_id: "cid1".to_string(),
                user_id: "user-1".to_string(),
                scope: "profile connections".to_string(),
                redirect_uri: "https://agent.example/cb".to_string(),
                expires_at: Utc::now() + Duration::minutes(10),
                used: false,
            })
            .await
            .unwrap();
        store
    }

    fn service(store: Arc<MemoryStore>) -> TokenService {
        TokenService::new(store, TokenPolicy::default())
    }

    #[tokio::test]
    async fn exchanges_a_valid_code() {
        let svc = service(seeded_store().await);
        let mut req = request("authorization_code");
        req.code = Some("abc123".to_string());

        let grant = svc.grant(&req).await.unwrap();
        assert_eq!(grant.token_type, "Bearer");
        assert_eq!(grant.expires_in, 3600);
        assert_eq!(grant.scope, "profile connections");
        assert!(!grant.access_token.is_empty());
        assert!(!grant.refresh_token.is_empty());
        assert_ne!(grant.access_token, grant.refresh_token);
    }

    #[tokio::test]
    async fn a_code_is_redeemable_at_most_once() {
        let svc = service(seeded_store().await);
        let mut req = request("authorization_code");
        req.code = Some("abc123".to_string());

        svc.grant(&req).await.unwrap();
        let second = svc.grant(&req).await.unwrap_err();
        assert!(matches!(second, OAuthError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn concurrent_exchanges_admit_exactly_one_winner() {
        let store = seeded_store().await;
        let svc = service(store);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                let mut req = request("authorization_code");
                req.code = Some("abc123".to_string());
                svc.grant(&req).await
            }));
        }

        let mut winners = 0;
        let mut tokens = HashSet::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(grant) => {
                    winners += 1;
                    tokens.insert(grant.access_token);
                }
                Err(e) => assert!(matches!(e, OAuthError::InvalidGrant(_))),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(tokens.len(), 1);
    }

    #[tokio::test]
    async fn expired_codes_are_rejected_without_being_consumed() {
        let store = seeded_store().await;
        store
            .insert_code(AuthorizationCode {
                code: "stale".to_string(),
                client_id: "cid1".to_string(),
                user_id: "user-1".to_string(),
                scope: "profile".to_string(),
                redirect_uri: "https://agent.example/cb".to_string(),
                expires_at: Utc::now() - Duration::minutes(1),
                used: false,
            })
            .await
            .unwrap();
        let svc = service(store.clone());
        let mut req = request("authorization_code");
        req.code = Some("stale".to_string());

        for _ in 0..2 {
            let err = svc.grant(&req).await.unwrap_err();
            assert!(matches!(err, OAuthError::InvalidGrant("Authorization code expired")));
        }
        // success path never ran, so the row is still marked unused
        assert!(store.unused_code("stale", "cid1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn redirect_uri_must_match_when_supplied() {
        let svc = service(seeded_store().await);
        let mut req = request("authorization_code");
        req.code = Some("abc123".to_string());
        req.redirect_uri = Some("https://evil.example/cb".to_string());

        let err = svc.grant(&req).await.unwrap_err();
        assert!(matches!(err, OAuthError::InvalidGrant("Redirect URI mismatch")));

        // omitting the redirect_uri is fine
        req.redirect_uri = None;
        svc.grant(&req).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_preserves_identity_and_rotates_access() {
        let store = seeded_store().await;
        let svc = service(store.clone());
        let mut req = request("authorization_code");
        req.code = Some("abc123".to_string());
        let first = svc.grant(&req).await.unwrap();
        let before = store
            .token_by_access(&first.access_token)
            .await
            .unwrap()
            .unwrap();

        let mut refresh = request("refresh_token");
        refresh.refresh_token = Some(first.refresh_token.clone());
        let second = svc.grant(&refresh).await.unwrap();

        assert_eq!(second.refresh_token, first.refresh_token);
        assert_ne!(second.access_token, first.access_token);
        assert_eq!(second.scope, first.scope);

        // old access token is gone, the new one carries the same identity
        // and a strictly later expiry
        assert!(
            store
                .token_by_access(&first.access_token)
                .await
                .unwrap()
                .is_none()
        );
        let after = store
            .token_by_access(&second.access_token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.user_id, before.user_id);
        assert_eq!(after.scope, before.scope);
        assert!(after.expires_at > before.expires_at);
    }

    #[tokio::test]
    async fn missing_fields_fail_as_invalid_request() {
        let svc = service(seeded_store().await);

        let mut no_secret = request("authorization_code");
        no_secret.client_secret = None;
        assert!(matches!(
            svc.grant(&no_secret).await.unwrap_err(),
            OAuthError::InvalidRequest(_)
        ));

        let no_code = request("authorization_code");
        assert!(matches!(
            svc.grant(&no_code).await.unwrap_err(),
            OAuthError::InvalidRequest("Missing authorization code")
        ));

        let no_refresh = request("refresh_token");
        assert!(matches!(
            svc.grant(&no_refresh).await.unwrap_err(),
            OAuthError::InvalidRequest("Missing refresh token")
        ));
    }

    #[tokio::test]
    async fn unknown_grant_type_is_rejected() {
        let svc = service(seeded_store().await);
        let err = svc.grant(&request("password")).await.unwrap_err();
        assert!(matches!(err, OAuthError::UnsupportedGrantType(_)));
    }

    #[tokio::test]
    async fn revoked_tokens_cannot_be_refreshed() {
        let store = seeded_store().await;
        let svc = service(store.clone());
        let mut req = request("authorization_code");
        req.code = Some("abc123".to_string());
        let grant = svc.grant(&req).await.unwrap();

        assert!(store.revoke_token(&grant.access_token).await.unwrap());

        let mut refresh = request("refresh_token");
        refresh.refresh_token = Some(grant.refresh_token);
        assert!(matches!(
            svc.grant(&refresh).await.unwrap_err(),
            OAuthError::InvalidGrant("Invalid refresh token")
        ));

        // revoking the token does not resurrect the consumed code
        assert!(matches!(
            svc.grant(&req).await.unwrap_err(),
            OAuthError::InvalidGrant(_)
        ));
    }

    #[tokio::test]
    async fn configured_refresh_ttl_expires_the_grant() {
        let store = seeded_store().await;
        let svc = TokenService::new(
            store.clone(),
            TokenPolicy {
                access_ttl: Duration::hours(1),
                refresh_ttl: Some(Duration::zero()),
            },
        );
        let mut req = request("authorization_code");
        req.code = Some("abc123".to_string());
        let grant = svc.grant(&req).await.unwrap();

        let mut refresh = request("refresh_token");
        refresh.refresh_token = Some(grant.refresh_token);
        assert!(matches!(
            svc.grant(&refresh).await.unwrap_err(),
            OAuthError::InvalidGrant("Invalid refresh token")
        ));
    }

    #[test]
    fn opaque_tokens_are_long_and_distinct() {
        let a = opaque_token();
        let b = opaque_token();
        assert_ne!(a, b);
        // 32 random bytes -> 43 chars of base64url
        assert_eq!(a.len(), 43);
    }
}
