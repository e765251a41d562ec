use time::OffsetDateTime;

use sproxy_common::CredentialId;

/// Plain credential row handed to the scheduler and pipeline. Runtime code
/// never touches sea-orm models directly.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub id: CredentialId,
    pub email: String,
    pub access_token: String,
    pub session_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub proxy_url: Option<String>,
    pub expiry_time: Option<OffsetDateTime>,
    pub enabled: bool,
    pub expired: bool,
    pub cooled_until: Option<OffsetDateTime>,
    pub plan_type: Option<String>,
    pub subscription_end: Option<OffsetDateTime>,
    pub sora2_supported: bool,
    pub sora2_remaining_count: i32,
    pub sora2_cooldown_until: Option<OffsetDateTime>,
    pub image_enabled: bool,
    pub video_enabled: bool,
    pub image_concurrency: i32,
    pub video_concurrency: i32,
}

impl CredentialRecord {
    pub fn is_pro(&self) -> bool {
        self.plan_type.as_deref() == Some("chatgpt_pro")
    }

    /// enabled, not expired, not cooled, token not past expiry.
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        if !self.enabled || self.expired {
            return false;
        }
        if let Some(cooled_until) = self.cooled_until
            && cooled_until > now
        {
            return false;
        }
        match self.expiry_time {
            Some(expiry) => expiry > now,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub credential_id: CredentialId,
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub credential_id: CredentialId,
    pub model: String,
    pub prompt: String,
    pub status: String,
    pub progress: f64,
    pub result_urls: Option<Vec<String>>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct StatsRecord {
    pub credential_id: CredentialId,
    pub image_count: i64,
    pub video_count: i64,
    pub error_count: i64,
    pub today_image_count: i64,
    pub today_video_count: i64,
    pub today_error_count: i64,
    pub today_date: Option<String>,
    pub consecutive_error_count: i32,
    pub last_error_at: Option<OffsetDateTime>,
}

/// Opened with sentinel status/duration (-1 / -1.0) and closed exactly once.
#[derive(Debug, Clone)]
pub struct NewRequestLog {
    pub credential_id: Option<CredentialId>,
    pub task_id: Option<String>,
    pub operation: String,
    pub request_body: String,
}
