mod client;
mod grants;
mod handlers;
mod middleware;
mod verify;

pub use client::ClientAuthenticator;
pub use grants::{TokenGrant, TokenPolicy, TokenRequest, TokenService};
pub use handlers::{OAuthAppState, oauth_token_handler};
pub use middleware::{GuardState, bearer_auth_middleware};
pub use verify::{AccessContext, TokenVerifier};

use crate::store::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Everything that can go wrong between a caller and a credential, with the
/// OAuth error code and HTTP status each case maps to.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("{0}")]
    InvalidRequest(&'static str),
    #[error("Client authentication failed")]
    InvalidClient,
    /// Deliberately coarse: "not found", "already used" and "wrong client"
    /// all surface as the same invalid_grant so the endpoint can't be used
    /// as an oracle for which codes/tokens exist.
    #[error("{0}")]
    InvalidGrant(&'static str),
    #[error("Grant type '{0}' not supported")]
    UnsupportedGrantType(String),
    #[error("missing or malformed bearer credential")]
    Unauthorized,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OAuthError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::Unauthorized => "unauthorized",
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::Store(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::InvalidGrant(_) | Self::UnsupportedGrantType(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::InvalidClient
            | Self::Unauthorized
            | Self::InvalidToken
            | Self::TokenExpired => StatusCode::UNAUTHORIZED,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Request-auth failures carry only the bare error code; the token
    /// endpoint's failures get a human-readable description.
    fn description(&self) -> Option<String> {
        match self {
            Self::Unauthorized | Self::InvalidToken | Self::TokenExpired => None,
            Self::Store(_) => Some("Internal server error".to_string()),
            other => Some(other.to_string()),
        }
    }
}

/// OAuth 2.0 error response body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        if let Self::Store(e) = &self {
            tracing::error!("store failure surfaced to caller: {}", e);
        }
        let body = ErrorBody {
            error: self.error_code().to_string(),
            error_description: self.description(),
        };
        (self.status(), Json(body)).into_response()
    }
}
