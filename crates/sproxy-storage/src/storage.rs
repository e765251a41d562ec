use async_trait::async_trait;
use time::OffsetDateTime;

use sproxy_common::{CredentialId, GatewaySettings};

use crate::records::{CredentialRecord, NewRequestLog, NewTask, StatsRecord, TaskRecord, TaskStatus};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persistence interface the gateway core consumes.
///
/// The store exclusively owns credential rows, stats, tasks, logs and config
/// rows. In-memory counters (lock map, limiter slots) are process-owned and
/// reseeded from here at startup.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync (SeaORM 2.0). Enabled by default at bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    /// Create missing singleton config rows with their defaults.
    async fn ensure_default_settings(&self, defaults: &GatewaySettings) -> StorageResult<()>;
    async fn load_settings(&self) -> StorageResult<GatewaySettings>;
    /// Bootstrap-time override of the caller API key.
    async fn set_api_key(&self, api_key: &str) -> StorageResult<()>;

    // Credentials
    async fn list_credentials(&self) -> StorageResult<Vec<CredentialRecord>>;
    async fn get_credential(&self, id: CredentialId)
    -> StorageResult<Option<CredentialRecord>>;
    /// use_count += 1, last_used_at = now.
    async fn record_credential_use(&self, id: CredentialId) -> StorageResult<()>;
    /// Upstream 401: expired = true, enabled = false.
    async fn mark_credential_expired(&self, id: CredentialId) -> StorageResult<()>;
    async fn set_access_token(
        &self,
        id: CredentialId,
        access_token: &str,
        expiry: Option<OffsetDateTime>,
    ) -> StorageResult<()>;
    async fn set_sora2_remaining(&self, id: CredentialId, remaining: i32) -> StorageResult<()>;
    async fn set_sora2_cooldown(
        &self,
        id: CredentialId,
        until: Option<OffsetDateTime>,
    ) -> StorageResult<()>;

    // Stats
    async fn get_stats(&self, id: CredentialId) -> StorageResult<Option<StatsRecord>>;
    /// Resets consecutive_error_count and bumps the feature counter.
    async fn record_success(&self, id: CredentialId, video: bool) -> StorageResult<()>;
    /// Bumps lifetime/today error counters; advances the consecutive counter
    /// only when `count_consecutive`, disabling the credential once the
    /// threshold is reached (threshold <= 0 disables auto-ban).
    async fn record_error(
        &self,
        id: CredentialId,
        count_consecutive: bool,
        ban_threshold: i32,
    ) -> StorageResult<()>;

    // Tasks
    async fn insert_task(&self, task: NewTask) -> StorageResult<i64>;
    async fn update_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: f64,
        result_urls: Option<&[String]>,
        error_message: Option<&str>,
    ) -> StorageResult<()>;
    async fn get_task(&self, task_id: &str) -> StorageResult<Option<TaskRecord>>;

    // Request logs
    /// Inserts with sentinel status -1 / duration -1.0; returns the row id.
    async fn open_request_log(&self, log: NewRequestLog) -> StorageResult<i64>;
    async fn close_request_log(
        &self,
        log_id: i64,
        response_body: &str,
        status_code: i32,
        duration_secs: f64,
    ) -> StorageResult<()>;
}
