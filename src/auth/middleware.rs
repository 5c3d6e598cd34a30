use super::TokenVerifier;
use crate::audit::{ApiCall, AuditLogger};
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

/// State for the bearer-auth middleware: the verifier that gates the
/// request and the audit logger that records it afterwards.
#[derive(Clone)]
pub struct GuardState {
    pub verifier: TokenVerifier,
    pub audit: AuditLogger,
}

/// Bearer-token middleware for protected routes. Verification happens
/// before any business logic; on success the resolved `AccessContext` is
/// attached to the request and the call is audit-logged with its final
/// status. Unauthenticated failures have no user to attribute, so they only
/// show up in the tracing output.
pub async fn bearer_auth_middleware(
    State(state): State<GuardState>,
    mut req: Request,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let endpoint = req.uri().path().to_string();

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(str::to_owned);

    let ctx = match state.verifier.verify(auth_header.as_deref()).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::warn!("rejected {} {}: {}", method, endpoint, e);
            return e.into_response();
        }
    };

    req.extensions_mut().insert(ctx.clone());
    let response = next.run(req).await;

    let call = ApiCall {
        user_id: ctx.user_id,
        endpoint,
        method,
        status_code: response.status().as_u16(),
        request_body: None,
        response_body: None,
        error_message: response
            .status()
            .canonical_reason()
            .filter(|_| response.status().is_client_error() || response.status().is_server_error())
            .map(str::to_owned),
    };
    // off the response path; a slow or failing store write must not delay
    // the reply
    let audit = state.audit.clone();
    tokio::spawn(async move { audit.record(call).await });

    response
}
