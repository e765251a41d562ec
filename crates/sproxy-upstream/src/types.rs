use serde::Deserialize;

/// Entry from `/nf/pending/v2`.
#[derive(Debug, Clone, Deserialize)]
pub struct PendingTask {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    /// Null at the very beginning, then 0..1.
    #[serde(default)]
    pub progress_pct: Option<f64>,
}

impl PendingTask {
    pub fn progress_percent(&self) -> i64 {
        (self.progress_pct.unwrap_or(0.0) * 100.0) as i64
    }
}

/// Response of `/v2/recent_tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct RecentImageTasks {
    #[serde(default)]
    pub task_responses: Vec<ImageTask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageTask {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress_pct: Option<f64>,
    #[serde(default)]
    pub generations: Vec<ImageGeneration>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageGeneration {
    #[serde(default)]
    pub url: Option<String>,
}

/// Response of `/project_y/profile/drafts`.
#[derive(Debug, Clone, Deserialize)]
pub struct DraftList {
    #[serde(default)]
    pub items: Vec<DraftItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DraftItem {
    /// Back-pointer to the create task.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Generation id, used by the publish flow.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub reason_str: Option<String>,
    #[serde(default)]
    pub markdown_reason_str: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub downloadable_url: Option<String>,
}

impl DraftItem {
    pub fn violation_reason(&self) -> Option<&str> {
        self.reason_str
            .as_deref()
            .or(self.markdown_reason_str.as_deref())
            .filter(|reason| !reason.trim().is_empty())
    }

    /// Violation indicators: violation kind, a populated reason, or a draft
    /// with no playable asset at all.
    pub fn is_content_violation(&self) -> bool {
        if self.kind.as_deref() == Some("sora_content_violation") {
            return true;
        }
        if self.violation_reason().is_some() {
            return true;
        }
        self.result_url().is_none()
    }

    pub fn result_url(&self) -> Option<&str> {
        self.downloadable_url
            .as_deref()
            .or(self.url.as_deref())
            .filter(|url| !url.is_empty())
    }
}

/// Cameo (character) processing status.
#[derive(Debug, Clone, Deserialize)]
pub struct CameoStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub username_hint: Option<String>,
    #[serde(default)]
    pub display_name_hint: Option<String>,
    #[serde(default)]
    pub profile_asset_url: Option<String>,
    #[serde(default)]
    pub instruction_set_hint: Option<String>,
}

impl CameoStatus {
    pub fn is_failed(&self) -> bool {
        self.status.as_deref() == Some("failed")
    }

    pub fn is_completed(&self) -> bool {
        self.status_message.as_deref() == Some("Completed")
            || self.status.as_deref() == Some("finalized")
    }
}

/// Response of the sentinel endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SentinelChallenge {
    #[serde(default)]
    pub proofofwork: ProofOfWork,
    #[serde(default)]
    pub turnstile: Turnstile,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProofOfWork {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub seed: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Turnstile {
    #[serde(default)]
    pub dx: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_without_any_url_is_a_violation() {
        let item: DraftItem = serde_json::from_str(
            r#"{"task_id": "task_1", "id": "gen_1", "kind": "video"}"#,
        )
        .unwrap();
        assert!(item.is_content_violation());
    }

    #[test]
    fn violation_kind_wins_even_with_url() {
        let item: DraftItem = serde_json::from_str(
            r#"{"task_id":"t","kind":"sora_content_violation","url":"https://x/v.mp4"}"#,
        )
        .unwrap();
        assert!(item.is_content_violation());
    }

    #[test]
    fn downloadable_url_preferred_over_url() {
        let item: DraftItem = serde_json::from_str(
            r#"{"task_id":"t","kind":"video","url":"https://x/wm.mp4","downloadable_url":"https://x/clean.mp4"}"#,
        )
        .unwrap();
        assert!(!item.is_content_violation());
        assert_eq!(item.result_url(), Some("https://x/clean.mp4"));
    }

    #[test]
    fn blank_reason_is_not_a_violation() {
        let item: DraftItem = serde_json::from_str(
            r#"{"task_id":"t","kind":"video","reason_str":"  ","url":"https://x/v.mp4"}"#,
        )
        .unwrap();
        assert!(!item.is_content_violation());
    }

    #[test]
    fn pending_progress_handles_null() {
        let task: PendingTask = serde_json::from_str(r#"{"id":"t","status":"processing"}"#).unwrap();
        assert_eq!(task.progress_percent(), 0);
        let task: PendingTask =
            serde_json::from_str(r#"{"id":"t","progress_pct":0.42}"#).unwrap();
        assert_eq!(task.progress_percent(), 42);
    }

    #[test]
    fn cameo_completion_conditions() {
        let status: CameoStatus =
            serde_json::from_str(r#"{"status":"processing","status_message":"Completed"}"#)
                .unwrap();
        assert!(status.is_completed());
        let status: CameoStatus = serde_json::from_str(r#"{"status":"finalized"}"#).unwrap();
        assert!(status.is_completed());
        let status: CameoStatus = serde_json::from_str(r#"{"status":"failed"}"#).unwrap();
        assert!(status.is_failed());
    }
}
