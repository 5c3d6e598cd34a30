use crate::store::{CredentialStore, StoreError};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Retention horizons and batch cap for the archival job.
#[derive(Debug, Clone, Copy)]
pub struct RetentionConfig {
    /// hot entries older than this move to the archive
    pub retention_period_days: i64,
    /// archive entries older than this (by created_at) are purged
    pub archive_deletion_days: i64,
    pub batch_size: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_period_days: 90,
            archive_deletion_days: 365,
            batch_size: 1000,
        }
    }
}

/// What a run did, plus the store sizes afterwards.
#[derive(Debug, Serialize)]
pub struct RetentionSummary {
    pub logs_archived: usize,
    pub old_logs_deleted: usize,
    pub active_logs_count: usize,
    pub archived_logs_count: usize,
    pub retention_period_days: i64,
    pub archive_deletion_days: i64,
}

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("archival run already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The audit-log archival job. Three phases per run - archive, purge,
/// report - each an individually committed step: a failure aborts the run
/// without rolling back completed phases, and the next run resumes from
/// whatever state the store is in (all selection is by created_at, so
/// re-runs simply find less work).
pub struct RetentionJob {
    store: Arc<dyn CredentialStore>,
    config: RetentionConfig,
    /// single-flight: concurrent triggers are rejected, not queued
    running: Mutex<()>,
}

impl RetentionJob {
    pub fn new(store: Arc<dyn CredentialStore>, config: RetentionConfig) -> Self {
        Self {
            store,
            config,
            running: Mutex::new(()),
        }
    }

    pub async fn run(&self) -> Result<RetentionSummary, RetentionError> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| RetentionError::AlreadyRunning)?;

        let now = Utc::now();
        let archive_cutoff = now - Duration::days(self.config.retention_period_days);
        let deletion_cutoff = now - Duration::days(self.config.archive_deletion_days);
        tracing::info!(
            "Starting audit log archival: archive cutoff {}, deletion cutoff {}",
            archive_cutoff,
            deletion_cutoff
        );

        // Phase A: move aged hot entries into the archive. The insert is an
        // idempotent upsert keyed by entry id, and we only delete hot rows
        // confirmed present in the archive afterwards, so a crash between
        // the two steps is retried safely instead of losing entries.
        let aged = self
            .store
            .hot_logs_before(archive_cutoff, self.config.batch_size)
            .await?;
        let logs_archived = aged.len();
        if logs_archived > 0 {
            let ids: Vec<Uuid> = aged.iter().map(|e| e.id).collect();
            self.store.upsert_archived_logs(aged, now).await?;
            let confirmed = self.store.archived_ids(&ids).await?;
            if confirmed.len() < ids.len() {
                tracing::warn!(
                    "{} of {} archived entries not readable back; leaving them in the hot store",
                    ids.len() - confirmed.len(),
                    ids.len()
                );
            }
            self.store.delete_hot_logs(&confirmed).await?;
            tracing::info!("Archived {} audit log entries", logs_archived);
        }

        // Phase B: purge aged archive entries, bounded per round so a large
        // backlog never turns into one unbounded delete.
        let mut old_logs_deleted = 0;
        loop {
            let purged = self
                .store
                .purge_archived_before(deletion_cutoff, self.config.batch_size)
                .await?;
            old_logs_deleted += purged;
            if purged < self.config.batch_size {
                break;
            }
        }
        if old_logs_deleted > 0 {
            tracing::info!("Purged {} archived audit log entries", old_logs_deleted);
        }

        // Phase C: report
        let summary = RetentionSummary {
            logs_archived,
            old_logs_deleted,
            active_logs_count: self.store.count_hot_logs().await?,
            archived_logs_count: self.store.count_archived_logs().await?,
            retention_period_days: self.config.retention_period_days,
            archive_deletion_days: self.config.archive_deletion_days,
        };
        tracing::info!(
            "Archival run complete: {} archived, {} purged, {} active, {} in archive",
            summary.logs_archived,
            summary.old_logs_deleted,
            summary.active_logs_count,
            summary.archived_logs_count
        );
        Ok(summary)
    }

    /// Background timer for deployments without an external cron.
    pub fn spawn_interval(self: Arc<Self>, every: std::time::Duration) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                match self.run().await {
                    Ok(summary) => tracing::debug!(
                        "scheduled archival run: {} archived, {} purged",
                        summary.logs_archived,
                        summary.old_logs_deleted
                    ),
                    Err(e) => tracing::error!("scheduled archival run failed: {}", e),
                }
            }
        });
    }
}

#[derive(Debug, Serialize)]
struct JobError {
    error: &'static str,
    message: String,
}

/// Handler for POST /jobs/archive-audit-logs - the external scheduler's
/// trigger. Returns the Phase-C summary, or 409 when a run is in flight.
pub async fn run_retention_handler(State(job): State<Arc<RetentionJob>>) -> Response {
    match job.run().await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(RetentionError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(JobError {
                error: "conflict",
                message: "archival run already in progress".to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("archival run failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(JobError {
                    error: "Internal server error",
                    message: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}
