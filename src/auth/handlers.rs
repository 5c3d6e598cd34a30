use super::{OAuthError, TokenService};
use axum::{
    body::Bytes,
    extract::{FromRequest, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// State for the token endpoint
#[derive(Clone)]
pub struct OAuthAppState {
    pub tokens: Arc<TokenService>,
}

/// Body extractor tolerant of both encodings agent platforms actually send:
/// form-urlencoded per the OAuth spec, JSON because half of them do it
/// anyway. Anything without a JSON content-type gets the form parser.
pub struct TolerantBody<T>(pub T);

impl<S, T> FromRequest<S> for TolerantBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = OAuthError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));

        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|_| OAuthError::InvalidRequest("Unable to parse request body"))?;

        let parsed = if is_json {
            serde_json::from_slice(&bytes)
                .map_err(|_| OAuthError::InvalidRequest("Unable to parse request body"))?
        } else {
            serde_urlencoded::from_bytes(&bytes)
                .map_err(|_| OAuthError::InvalidRequest("Unable to parse request body"))?
        };
        Ok(Self(parsed))
    }
}

/// Handler for POST /oauth/token
pub async fn oauth_token_handler(
    State(state): State<OAuthAppState>,
    TolerantBody(req): TolerantBody<super::TokenRequest>,
) -> Response {
    tracing::info!(
        "Token request: grant_type={} client_id={:?}",
        req.grant_type,
        req.client_id
    );

    match state.tokens.grant(&req).await {
        Ok(grant) => (StatusCode::OK, Json(grant)).into_response(),
        Err(e) => e.into_response(),
    }
}
