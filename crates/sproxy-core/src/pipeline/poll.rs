use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use sproxy_common::UpstreamError;
use sproxy_storage::{CredentialRecord, TaskStatus};

use crate::cache::MediaType;
use crate::state::AppState;

use super::emit::Emitter;
use super::{PipelineError, watermark};

/// Terminal result of a polling loop. `Violation` and `Shielded` have
/// already emitted their chunk stream; only accounting is left to the
/// caller.
#[derive(Debug)]
pub(super) enum PollOutcome {
    Completed { urls: Vec<String> },
    Violation { reason: String },
    Shielded,
}

const VIDEO_STATUS_INTERVAL: Duration = Duration::from_secs(30);
const IMAGE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

const SHIELD_TASK_ERROR: &str = "Cloudflare challenge or rate limit (429) triggered";
const SHIELD_CONTENT: &str = "❌ Generation failed: Cloudflare challenge or rate limit (429) \
    triggered. Please change proxy or reduce request frequency.";

async fn fail_task_for_shield(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    task_id: &str,
) -> Result<PollOutcome, PipelineError> {
    let _ = state
        .storage
        .update_task(task_id, TaskStatus::Failed, 0.0, None, Some(SHIELD_TASK_ERROR))
        .await;
    emitter
        .reasoning(format!("**CF Shield/429 Error**\n\n{SHIELD_TASK_ERROR}\n"))
        .await?;
    emitter.content(SHIELD_CONTENT).await?;
    Ok(PollOutcome::Shielded)
}

fn timeout_error(budget: Duration) -> PipelineError {
    PipelineError::Timeout(format!(
        "Upstream API timeout: Generation exceeded {} seconds limit",
        budget.as_secs()
    ))
}

/// Drives a video task to a terminal state: progress from the pending list,
/// terminal resolution from the drafts list.
pub(super) async fn poll_video(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    cred: &CredentialRecord,
    task_id: &str,
) -> Result<PollOutcome, PipelineError> {
    let settings = state.settings();
    let budget = Duration::from_secs(settings.generation.video_timeout_secs);
    let interval = Duration::from_secs(settings.generation.poll_interval_secs.max(1));
    let started = Instant::now();
    let mut last_status_emit = Instant::now();

    info!(
        event = "poll_video_started",
        %task_id,
        credential_id = cred.id,
        budget_secs = budget.as_secs(),
    );

    loop {
        if started.elapsed() > budget {
            let _ = state
                .storage
                .update_task(
                    task_id,
                    TaskStatus::Failed,
                    0.0,
                    None,
                    Some(&format!(
                        "Generation timeout after {} seconds",
                        started.elapsed().as_secs()
                    )),
                )
                .await;
            return Err(timeout_error(budget));
        }
        tokio::time::sleep(interval).await;

        match poll_video_once(state, emitter, cred, task_id, &mut last_status_emit).await {
            Ok(Some(outcome)) => return Ok(outcome),
            Ok(None) => {}
            Err(PipelineError::Upstream(UpstreamError::CfShield429)) => {
                return fail_task_for_shield(state, emitter, task_id).await;
            }
            Err(PipelineError::Upstream(err @ UpstreamError::AuthExpired))
            | Err(PipelineError::Upstream(err @ UpstreamError::UnsupportedCountry { .. })) => {
                return Err(PipelineError::Upstream(err));
            }
            Err(PipelineError::Upstream(err)) => {
                // Transient poll failures retry until the budget runs out.
                warn!(event = "poll_video_retry", %task_id, error = %err);
            }
            Err(other) => return Err(other),
        }
    }
}

async fn poll_video_once(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    cred: &CredentialRecord,
    task_id: &str,
    last_status_emit: &mut Instant,
) -> Result<Option<PollOutcome>, PipelineError> {
    let pending = state.client.pending_tasks(&cred.access_token).await?;
    if let Some(task) = pending.iter().find(|task| task.id == task_id) {
        let progress = task.progress_percent();
        let status = task.status.as_deref().unwrap_or("processing");
        // Progress is reported no more often than every 30 seconds.
        if last_status_emit.elapsed() >= VIDEO_STATUS_INTERVAL {
            *last_status_emit = Instant::now();
            emitter
                .reasoning(format!(
                    "**Video Generation Progress**: {progress}% ({status})\n"
                ))
                .await?;
        }
        return Ok(None);
    }

    // Not pending anymore: the draft list holds the terminal state.
    let drafts = state.client.video_drafts(&cred.access_token).await?;
    let Some(item) = drafts
        .items
        .iter()
        .find(|item| item.task_id.as_deref() == Some(task_id))
    else {
        return Ok(None);
    };

    if item.is_content_violation() {
        let reason = item
            .violation_reason()
            .unwrap_or("Content violates guardrails")
            .to_string();
        let _ = state
            .storage
            .update_task(
                task_id,
                TaskStatus::Failed,
                0.0,
                None,
                Some(&format!("Content policy violation: {reason}")),
            )
            .await;
        emitter
            .reasoning(format!("**Content Policy Violation**\n\n{reason}\n"))
            .await?;
        emitter.content(format!("❌ 生成失败: {reason}")).await?;
        return Ok(Some(PollOutcome::Violation { reason }));
    }

    let local_url = watermark::final_video_url(state, emitter, item, cred).await?;
    state
        .storage
        .update_task(
            task_id,
            TaskStatus::Completed,
            100.0,
            Some(std::slice::from_ref(&local_url)),
            None,
        )
        .await?;
    emitter
        .content(format!(
            "```html\n<video src='{local_url}' controls></video>\n```"
        ))
        .await?;
    Ok(Some(PollOutcome::Completed {
        urls: vec![local_url],
    }))
}

/// Drives an image task to a terminal state via the recent-tasks list.
pub(super) async fn poll_image(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    cred: &CredentialRecord,
    task_id: &str,
) -> Result<PollOutcome, PipelineError> {
    let settings = state.settings();
    let budget = Duration::from_secs(settings.generation.image_timeout_secs);
    let interval = Duration::from_secs(settings.generation.poll_interval_secs.max(1));
    let max_attempts = (budget.as_secs() / interval.as_secs()).max(1);
    let started = Instant::now();
    let mut last_heartbeat = Instant::now();
    let mut last_progress = 0.0_f64;
    let mut attempt = 0_u64;

    info!(
        event = "poll_image_started",
        %task_id,
        credential_id = cred.id,
        budget_secs = budget.as_secs(),
    );

    loop {
        if started.elapsed() > budget {
            let _ = state
                .storage
                .update_task(
                    task_id,
                    TaskStatus::Failed,
                    0.0,
                    None,
                    Some(&format!(
                        "Generation timeout after {} seconds",
                        started.elapsed().as_secs()
                    )),
                )
                .await;
            return Err(timeout_error(budget));
        }
        tokio::time::sleep(interval).await;
        attempt += 1;

        let outcome = poll_image_once(
            state,
            emitter,
            cred,
            task_id,
            started,
            &mut last_heartbeat,
            &mut last_progress,
        )
        .await;

        match outcome {
            Ok(Some(result)) => return Ok(result),
            Ok(None) => {}
            Err(PipelineError::Upstream(UpstreamError::CfShield429)) => {
                return fail_task_for_shield(state, emitter, task_id).await;
            }
            Err(PipelineError::Upstream(err @ UpstreamError::AuthExpired))
            | Err(PipelineError::Upstream(err @ UpstreamError::UnsupportedCountry { .. })) => {
                return Err(PipelineError::Upstream(err));
            }
            Err(PipelineError::Upstream(err)) => {
                warn!(event = "poll_image_retry", %task_id, error = %err);
            }
            Err(other) => return Err(other),
        }

        // Estimated-progress fallback when the upstream reports nothing.
        if attempt % 10 == 0 {
            let estimated = ((attempt as f64 / max_attempts as f64) * 100.0).min(90.0);
            if estimated > last_progress + 20.0 {
                last_progress = estimated;
                emitter
                    .reasoning(format!(
                        "**Processing**\n\nGeneration in progress: {estimated:.0}% completed (estimated)...\n"
                    ))
                    .await?;
            }
        }
    }
}

async fn poll_image_once(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    cred: &CredentialRecord,
    task_id: &str,
    started: Instant,
    last_heartbeat: &mut Instant,
    last_progress: &mut f64,
) -> Result<Option<PollOutcome>, PipelineError> {
    let recent = state.client.recent_image_tasks(&cred.access_token).await?;
    let found = recent.task_responses.iter().find(|task| task.id == task_id);

    if let Some(task) = found {
        let progress = task.progress_pct.unwrap_or(0.0) * 100.0;
        match task.status.as_deref() {
            Some("succeeded") => {
                let urls: Vec<String> = task
                    .generations
                    .iter()
                    .filter_map(|generation| generation.url.clone())
                    .filter(|url| !url.is_empty())
                    .collect();
                if !urls.is_empty() {
                    let local_urls = localize_image_urls(state, emitter, cred, &urls).await?;
                    state
                        .storage
                        .update_task(
                            task_id,
                            TaskStatus::Completed,
                            100.0,
                            Some(&local_urls),
                            None,
                        )
                        .await?;
                    let markdown = local_urls
                        .iter()
                        .map(|url| format!("![Generated Image]({url})"))
                        .collect::<Vec<_>>()
                        .join("\n");
                    emitter.content(markdown).await?;
                    return Ok(Some(PollOutcome::Completed { urls: local_urls }));
                }
            }
            Some("failed") => {
                let message = task
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Generation failed".to_string());
                state
                    .storage
                    .update_task(task_id, TaskStatus::Failed, progress, None, Some(&message))
                    .await?;
                return Err(PipelineError::Internal(message));
            }
            _ => {
                // Persist progress only when it moved meaningfully.
                if progress > *last_progress + 20.0 {
                    *last_progress = progress;
                    state
                        .storage
                        .update_task(task_id, TaskStatus::Processing, progress, None, None)
                        .await?;
                    emitter
                        .reasoning(format!(
                            "**Processing**\n\nGeneration in progress: {progress:.0}% completed...\n"
                        ))
                        .await?;
                }
            }
        }
    }

    // Heartbeat at most every 10 seconds while nothing moved.
    if last_heartbeat.elapsed() >= IMAGE_HEARTBEAT_INTERVAL {
        *last_heartbeat = Instant::now();
        let elapsed = started.elapsed().as_secs();
        emitter
            .reasoning(format!(
                "Image generation in progress... ({elapsed}s elapsed)\n"
            ))
            .await?;
    }
    Ok(None)
}

async fn localize_image_urls(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    cred: &CredentialRecord,
    urls: &[String],
) -> Result<Vec<String>, PipelineError> {
    let settings = state.settings();
    if !settings.cache.enabled {
        emitter
            .reasoning("Cache is disabled. Using original URLs directly...\n")
            .await?;
        return Ok(urls.to_vec());
    }

    emitter
        .reasoning(format!(
            "**Image Generation Completed**\n\nImage generation successful. Now caching {} image(s)...\n",
            urls.len()
        ))
        .await?;

    let base = state.cache_base_url();
    let proxy = state.resolve_proxy(cred);
    let ttl = settings.cache.timeout_secs;
    let mut local_urls = Vec::with_capacity(urls.len());
    for (idx, url) in urls.iter().enumerate() {
        match state
            .cache
            .download_and_cache(&state.client, url, MediaType::Image, proxy.as_deref(), ttl)
            .await
        {
            Ok(filename) => {
                local_urls.push(format!("{base}/tmp/{filename}"));
                if urls.len() > 1 {
                    emitter
                        .reasoning(format!("Cached image {}/{}...\n", idx + 1, urls.len()))
                        .await?;
                }
            }
            Err(err) => {
                local_urls.push(url.clone());
                emitter
                    .reasoning(format!(
                        "Warning: Failed to cache image {} - {err}\nUsing original URL instead...\n",
                        idx + 1
                    ))
                    .await?;
            }
        }
    }
    if local_urls.iter().all(|url| url.starts_with(&base)) {
        emitter
            .reasoning("All images cached successfully. Preparing final response...\n")
            .await?;
    }
    Ok(local_urls)
}
