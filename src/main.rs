mod audit;
mod auth;
mod memory;
mod retention;
mod store;

use anyhow::Result;
use auth::AccessContext;
use axum::{
    Extension, Router,
    middleware,
    response::Json,
    routing::{get, post},
};
use clap::Parser;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "agentgate")]
#[command(about = "OAuth 2.0 authorization server for delegated AI-agent access")]
struct Args {
    /// Host to bind to
    #[arg(long, env = "AGENTGATE_HOST", default_value = "localhost")]
    host: String,

    /// Port to bind to
    #[arg(short, long, env = "AGENTGATE_PORT", default_value = "3000")]
    port: u16,

    /// Client ID to seed at startup (admin provisioning stand-in)
    #[arg(long, env = "OAUTH_CLIENT_ID")]
    client_id: Option<String>,

    /// Client secret for the seeded client
    #[arg(long, env = "OAUTH_CLIENT_SECRET")]
    client_secret: Option<String>,

    /// Access token lifetime in seconds
    #[arg(long, env = "OAUTH_ACCESS_TOKEN_TTL", default_value = "3600")]
    access_token_ttl: u64,

    /// Refresh token lifetime in seconds (0 = refresh tokens never expire)
    #[arg(long, env = "OAUTH_REFRESH_TOKEN_TTL", default_value = "0")]
    refresh_token_ttl: u64,

    /// Days before hot audit logs move to the archive
    #[arg(long, env = "AUDIT_RETENTION_PERIOD_DAYS", default_value = "90")]
    retention_period_days: i64,

    /// Days (from creation) before archived audit logs are purged
    #[arg(long, env = "AUDIT_ARCHIVE_DELETION_DAYS", default_value = "365")]
    archive_deletion_days: i64,

    /// Max audit-log rows handled per archival batch
    #[arg(long, env = "AUDIT_RETENTION_BATCH_SIZE", default_value = "1000")]
    retention_batch_size: usize,

    /// Hours between in-process archival runs (0 = external trigger only)
    #[arg(long, env = "AUDIT_RETENTION_INTERVAL_HOURS", default_value = "24")]
    retention_interval_hours: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentgate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let store: Arc<dyn store::CredentialStore> = Arc::new(memory::MemoryStore::new());

    match (&args.client_id, &args.client_secret) {
        (Some(id), Some(secret)) => {
            store
                .insert_client(store::Client {
                    client_id: id.clone(),
                    client_secret: secret.clone(),
                    name: None,
                    created_at: chrono::Utc::now(),
                })
                .await?;
            tracing::info!("Seeded OAuth client '{}'", id);
        }
        (None, None) => {
            tracing::warn!(
                "No OAuth client seeded; token exchanges will fail until one is provisioned"
            );
        }
        _ => anyhow::bail!("OAUTH_CLIENT_ID and OAUTH_CLIENT_SECRET must be set together"),
    }

    let policy = auth::TokenPolicy {
        access_ttl: chrono::Duration::seconds(args.access_token_ttl as i64),
        refresh_ttl: if args.refresh_token_ttl == 0 {
            None
        } else {
            Some(chrono::Duration::seconds(args.refresh_token_ttl as i64))
        },
    };

    let oauth_state = auth::OAuthAppState {
        tokens: Arc::new(auth::TokenService::new(store.clone(), policy)),
    };

    let guard = auth::GuardState {
        verifier: auth::TokenVerifier::new(store.clone()),
        audit: audit::AuditLogger::new(store.clone()),
    };

    let retention_job = Arc::new(retention::RetentionJob::new(
        store.clone(),
        retention::RetentionConfig {
            retention_period_days: args.retention_period_days,
            archive_deletion_days: args.archive_deletion_days,
            batch_size: args.retention_batch_size,
        },
    ));
    if args.retention_interval_hours > 0 {
        retention_job
            .clone()
            .spawn_interval(std::time::Duration::from_secs(
                args.retention_interval_hours * 3600,
            ));
        tracing::info!(
            "In-process archival timer enabled (every {}h)",
            args.retention_interval_hours
        );
    }

    // token endpoint is hit cross-origin by agent platforms; the CORS layer
    // also answers the OPTIONS preflight
    let oauth_routes = Router::new()
        .route("/oauth/token", post(auth::oauth_token_handler))
        .layer(CorsLayer::permissive())
        .with_state(oauth_state);

    let job_routes = Router::new()
        .route(
            "/jobs/archive-audit-logs",
            post(retention::run_retention_handler),
        )
        .with_state(retention_job);

    // protected resource routes - bearer token required, every call audited
    let protected_routes = Router::new()
        .route("/api/profile", get(profile_handler))
        .layer(middleware::from_fn_with_state(
            guard,
            auth::bearer_auth_middleware,
        ));

    let app = oauth_routes.merge(job_routes).merge(protected_routes);

    let bind_addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("agentgate listening on http://{}", bind_addr);
    tracing::info!("Token endpoint: http://{}/oauth/token", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Minimal protected resource: echoes back who the token resolved to.
async fn profile_handler(Extension(ctx): Extension<AccessContext>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "user_id": ctx.user_id,
        "scope": ctx.scope,
    }))
}
