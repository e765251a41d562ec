mod character;
mod emit;
mod poll;
mod watermark;

use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::{Value as JsonValue, json};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};

use sproxy_common::{CredentialId, UpstreamError};
use sproxy_protocol::chat::CompletionChunk;
use sproxy_protocol::error::ApiErrorBody;
use sproxy_storage::{
    CredentialRecord, NewRequestLog, NewTask, StorageError, TaskStatus,
};
use sproxy_upstream::client::CreateVideoParams;
use sproxy_upstream::{UploadImageParams, format_storyboard_prompt, is_storyboard_prompt};

use crate::limiter::ConcurrencyLimiter;
use crate::models::{ModelKind, ModelSpec, find_model};
use crate::prompt::{clean_remix_link, extract_style};
use crate::scheduler::SelectRequest;
use crate::state::AppState;
use crate::token_lock::TokenLock;

use emit::Emitter;
use poll::PollOutcome;

/// Typed pipeline output; the router formats SSE frames at the boundary.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(CompletionChunk),
    /// Full error body for a single SSE error frame.
    Error(JsonValue),
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    /// Base64 image attachment, optionally as a data: URI.
    pub image: Option<String>,
    /// Base64 video, data: URI, or plain URL.
    pub video: Option<String>,
    pub remix_target_id: Option<String>,
}

#[derive(Debug)]
pub(crate) enum PipelineError {
    /// Caller closed the stream; abort quietly, guards release on unwind.
    Closed,
    NoCredential(String),
    Acquisition(String),
    Upstream(UpstreamError),
    Storage(StorageError),
    Timeout(String),
    Internal(String),
}

impl From<UpstreamError> for PipelineError {
    fn from(err: UpstreamError) -> Self {
        PipelineError::Upstream(err)
    }
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        PipelineError::Storage(err)
    }
}

impl PipelineError {
    pub(crate) fn message(&self) -> String {
        match self {
            PipelineError::Closed => "client disconnected".to_string(),
            PipelineError::NoCredential(msg)
            | PipelineError::Acquisition(msg)
            | PipelineError::Timeout(msg)
            | PipelineError::Internal(msg) => msg.clone(),
            PipelineError::Upstream(err) => err.to_string(),
            PipelineError::Storage(err) => err.to_string(),
        }
    }

    fn log_status(&self) -> i32 {
        match self {
            PipelineError::Upstream(err) => err.log_status(),
            PipelineError::Timeout(_) => 408,
            _ => 500,
        }
    }

    fn client_payload(&self) -> JsonValue {
        match self {
            PipelineError::Upstream(err) => err.client_payload(),
            other => serde_json::to_value(ApiErrorBody::server_error(other.message()))
                .unwrap_or(JsonValue::Null),
        }
    }
}

/// Spawns the pipeline for one request and hands back its event stream.
pub fn run_generation(state: Arc<AppState>, request: GenerationRequest) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut emitter = Emitter::new(tx);
        match generate(&state, &mut emitter, request).await {
            Ok(()) => {}
            Err(PipelineError::Closed) => {
                info!(event = "generation_abandoned");
                return;
            }
            Err(err) => {
                warn!(event = "generation_failed", error = %err.message());
                emitter.error(err.client_payload()).await;
            }
        }
        emitter.done().await;
    });
    rx
}

/// Availability-only answer for `stream = false`; a scheduler dry-run that
/// acquires nothing.
pub async fn availability_message(
    state: &Arc<AppState>,
    spec: &ModelSpec,
) -> Result<String, StorageError> {
    let is_video = spec.is_video();
    let selected = state
        .scheduler()
        .select(
            SelectRequest {
                for_image: !is_video,
                for_video: is_video,
                require_pro: false,
            },
            state.lock_timeout(),
        )
        .await?;
    let modality = if is_video { "video" } else { "image" };
    Ok(match selected {
        Some(_) => format!(
            "All credentials available for {modality} generation. Please enable streaming to use the generation feature."
        ),
        None => format!("No available models for {modality} generation"),
    })
}

async fn generate(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    request: GenerationRequest,
) -> Result<(), PipelineError> {
    let spec = find_model(&request.model)
        .ok_or_else(|| PipelineError::Internal(format!("Invalid model: {}", request.model)))?;

    if spec.is_video() {
        if let Some(remix_id) = request
            .remix_target_id
            .clone()
            .filter(|id| !id.trim().is_empty())
        {
            return generate_remix(state, emitter, &request, spec, &remix_id).await;
        }
        if let Some(video) = request.video.clone().filter(|v| !v.trim().is_empty()) {
            return character::generate_with_character(state, emitter, &request, spec, video)
                .await;
        }
    }
    generate_standard(state, emitter, &request, spec).await
}

/// Mutable run bookkeeping shared between the create step and the terminal
/// accounting, so every exit path can settle the same rows.
#[derive(Default)]
struct RunState {
    log_id: Option<i64>,
    task_id: Option<String>,
}

/// Scoped release of the image lock and limiter slots: dropped exactly once
/// on every exit path, including panics and caller disconnects.
#[derive(Default)]
struct ReleaseGuard {
    lock: Option<(Arc<TokenLock>, CredentialId)>,
    image_slot: Option<(Arc<ConcurrencyLimiter>, CredentialId)>,
    video_slot: Option<(Arc<ConcurrencyLimiter>, CredentialId)>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some((lock, id)) = self.lock.take() {
            lock.release(id);
        }
        if let Some((limiter, id)) = self.image_slot.take() {
            limiter.release_image(id);
        }
        if let Some((limiter, id)) = self.video_slot.take() {
            limiter.release_video(id);
        }
    }
}

fn acquire_resources(
    state: &Arc<AppState>,
    credential_id: CredentialId,
    for_image: bool,
    for_video: bool,
) -> Result<ReleaseGuard, PipelineError> {
    let mut guard = ReleaseGuard::default();
    if for_image {
        if !state.lock.try_acquire(credential_id, state.lock_timeout()) {
            return Err(PipelineError::Acquisition(format!(
                "Failed to acquire lock for credential {credential_id}"
            )));
        }
        guard.lock = Some((state.lock.clone(), credential_id));
        if !state.limiter.acquire_image(credential_id) {
            // Guard drop releases the lock we just took.
            return Err(PipelineError::Acquisition(format!(
                "Failed to acquire image slot for credential {credential_id}"
            )));
        }
        guard.image_slot = Some((state.limiter.clone(), credential_id));
    }
    if for_video {
        if !state.limiter.acquire_video(credential_id) {
            return Err(PipelineError::Acquisition(format!(
                "Failed to acquire video slot for credential {credential_id}"
            )));
        }
        guard.video_slot = Some((state.limiter.clone(), credential_id));
    }
    Ok(guard)
}

async fn select_credential(
    state: &Arc<AppState>,
    request: SelectRequest,
) -> Result<CredentialRecord, PipelineError> {
    let selected = state
        .scheduler()
        .select(request, state.lock_timeout())
        .await?;
    selected.ok_or_else(|| {
        let message = if request.require_pro {
            "No available Pro credentials. Pro models require a ChatGPT Pro subscription."
                .to_string()
        } else if request.for_image {
            "No available credentials for image generation. All credentials are either disabled, cooling down, locked, or expired."
                .to_string()
        } else {
            "No available credentials for video generation. All credentials are either disabled, cooling down, Sora2 quota exhausted, unsupported, or expired."
                .to_string()
        };
        PipelineError::NoCredential(message)
    })
}

async fn generate_standard(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    request: &GenerationRequest,
    spec: &ModelSpec,
) -> Result<(), PipelineError> {
    let started = Instant::now();
    let is_video = spec.is_video();

    let cred = select_credential(
        state,
        SelectRequest {
            for_image: !is_video,
            for_video: is_video,
            require_pro: spec.require_pro,
        },
    )
    .await?;
    let _guard = acquire_resources(state, cred.id, !is_video, is_video)?;

    let mut run = RunState::default();
    let result = create_and_poll(state, emitter, request, spec, &cred, &mut run).await;
    finish_run(state, &cred, is_video, started, run, result).await
}

async fn create_and_poll(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    request: &GenerationRequest,
    spec: &ModelSpec,
    cred: &CredentialRecord,
    run: &mut RunState,
) -> Result<PollOutcome, PipelineError> {
    let mut media_id = None;
    if let Some(image) = request.image.as_deref().filter(|data| !data.is_empty()) {
        emitter
            .reasoning("**Image Upload Begins**\n\nUploading image to server...\n")
            .await?;
        let data = decode_base64_attachment(image)?;
        let uploaded = state
            .client
            .upload_image(
                UploadImageParams {
                    data,
                    file_name: "image.png",
                },
                &cred.access_token,
            )
            .await?;
        media_id = Some(uploaded);
        emitter
            .reasoning("Image uploaded successfully. Proceeding to generation...\n")
            .await?;
    }

    emitter
        .reasoning("**Generation Process Begins**\n\nInitializing generation request...\n")
        .await?;

    let proxy = state.resolve_proxy(cred);
    let task_id = match spec.kind {
        ModelKind::Image { width, height } => {
            state
                .client
                .create_image(
                    &request.prompt,
                    width,
                    height,
                    media_id.as_deref(),
                    &cred.access_token,
                    proxy.as_deref(),
                )
                .await?
        }
        ModelKind::Video {
            orientation,
            n_frames,
            upstream_model,
            size,
        } => {
            let (clean_prompt, style_id) = extract_style(&request.prompt);
            if is_storyboard_prompt(&clean_prompt) {
                emitter
                    .reasoning("Detected storyboard format. Converting to storyboard API format...\n")
                    .await?;
                let formatted = format_storyboard_prompt(&clean_prompt);
                state
                    .client
                    .create_storyboard(
                        CreateVideoParams {
                            prompt: &formatted,
                            orientation,
                            size,
                            n_frames,
                            model: upstream_model,
                            media_id: media_id.as_deref(),
                            style_id: style_id.as_deref(),
                        },
                        &cred.access_token,
                        proxy.as_deref(),
                    )
                    .await?
            } else {
                state
                    .client
                    .create_video(
                        CreateVideoParams {
                            prompt: &clean_prompt,
                            orientation,
                            size,
                            n_frames,
                            model: upstream_model,
                            media_id: media_id.as_deref(),
                            style_id: style_id.as_deref(),
                        },
                        &cred.access_token,
                        proxy.as_deref(),
                    )
                    .await?
            }
        }
    };

    persist_new_task(
        state,
        run,
        cred.id,
        &task_id,
        spec.name,
        &request.prompt,
        if spec.is_video() {
            "generate_video"
        } else {
            "generate_image"
        },
        json!({
            "model": spec.name,
            "prompt": request.prompt,
            "has_image": request.image.is_some(),
        }),
    )
    .await?;

    if spec.is_video() {
        poll::poll_video(state, emitter, cred, &task_id).await
    } else {
        poll::poll_image(state, emitter, cred, &task_id).await
    }
}

async fn generate_remix(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    request: &GenerationRequest,
    spec: &ModelSpec,
    remix_target_id: &str,
) -> Result<(), PipelineError> {
    let started = Instant::now();
    let cred = select_credential(
        state,
        SelectRequest {
            for_video: true,
            ..Default::default()
        },
    )
    .await?;
    let _guard = acquire_resources(state, cred.id, false, true)?;

    let mut run = RunState::default();
    let result =
        remix_create_and_poll(state, emitter, request, spec, remix_target_id, &cred, &mut run)
            .await;
    finish_run(state, &cred, true, started, run, result).await
}

async fn remix_create_and_poll(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    request: &GenerationRequest,
    spec: &ModelSpec,
    remix_target_id: &str,
    cred: &CredentialRecord,
    run: &mut RunState,
) -> Result<PollOutcome, PipelineError> {
    emitter
        .reasoning("**Remix Generation Process Begins**\n\nInitializing remix request...\n")
        .await?;

    // The share link is stripped so it does not leak into the new prompt.
    let clean_prompt = clean_remix_link(&request.prompt);
    let (clean_prompt, style_id) = extract_style(&clean_prompt);

    let ModelKind::Video {
        orientation,
        n_frames,
        ..
    } = spec.kind
    else {
        return Err(PipelineError::Internal("remix requires a video model".to_string()));
    };

    emitter
        .reasoning("Sending remix request to server...\n")
        .await?;
    let proxy = state.resolve_proxy(cred);
    let task_id = state
        .client
        .create_remix(
            remix_target_id,
            &clean_prompt,
            orientation,
            n_frames,
            style_id.as_deref(),
            &cred.access_token,
            proxy.as_deref(),
        )
        .await?;

    persist_new_task(
        state,
        run,
        cred.id,
        &task_id,
        &format!("sora2-video-{orientation}"),
        &format!("remix:{remix_target_id} {clean_prompt}"),
        "generate_remix",
        json!({
            "model": spec.name,
            "prompt": clean_prompt,
            "remix_target_id": remix_target_id,
        }),
    )
    .await?;

    poll::poll_video(state, emitter, cred, &task_id).await
}

#[allow(clippy::too_many_arguments)]
async fn persist_new_task(
    state: &Arc<AppState>,
    run: &mut RunState,
    credential_id: CredentialId,
    task_id: &str,
    model_label: &str,
    prompt: &str,
    operation: &str,
    request_body: JsonValue,
) -> Result<(), PipelineError> {
    run.task_id = Some(task_id.to_string());
    state
        .storage
        .insert_task(NewTask {
            task_id: task_id.to_string(),
            credential_id,
            model: model_label.to_string(),
            prompt: prompt.to_string(),
        })
        .await?;
    let log_id = state
        .storage
        .open_request_log(NewRequestLog {
            credential_id: Some(credential_id),
            task_id: Some(task_id.to_string()),
            operation: operation.to_string(),
            request_body: request_body.to_string(),
        })
        .await?;
    run.log_id = Some(log_id);
    state.storage.record_credential_use(credential_id).await?;
    Ok(())
}

/// Terminal bookkeeping for every create-and-poll run: stats, Sora2 quota,
/// task row and request log settle here exactly once per request.
async fn finish_run(
    state: &Arc<AppState>,
    cred: &CredentialRecord,
    is_video: bool,
    started: Instant,
    run: RunState,
    result: Result<PollOutcome, PipelineError>,
) -> Result<(), PipelineError> {
    let elapsed = started.elapsed().as_secs_f64();
    let threshold = state.settings().admin.error_ban_threshold;

    match result {
        Ok(PollOutcome::Completed { urls }) => {
            state.storage.record_success(cred.id, is_video).await?;
            if is_video {
                settle_sora2_quota(state, cred).await;
            }
            if let Some(log_id) = run.log_id {
                let body = json!({
                    "task_id": run.task_id,
                    "status": "success",
                    "result_urls": urls,
                });
                state
                    .storage
                    .close_request_log(log_id, &body.to_string(), 200, elapsed)
                    .await?;
            }
            Ok(())
        }
        Ok(PollOutcome::Violation { reason }) => {
            // The violation chunk stream is already on the wire; only the
            // accounting is left.
            state.storage.record_error(cred.id, true, threshold).await?;
            if let Some(log_id) = run.log_id {
                let body = json!({"error": format!("Content policy violation: {reason}")});
                state
                    .storage
                    .close_request_log(log_id, &body.to_string(), 500, elapsed)
                    .await?;
            }
            Ok(())
        }
        Ok(PollOutcome::Shielded) => {
            // Shield events are never debited against the credential.
            if let Some(log_id) = run.log_id {
                let body =
                    json!({"error": "Cloudflare challenge or rate limit (429) triggered"});
                state
                    .storage
                    .close_request_log(log_id, &body.to_string(), 429, elapsed)
                    .await?;
            }
            Ok(())
        }
        Err(err) => {
            if let Some(task_id) = &run.task_id {
                let _ = state
                    .storage
                    .update_task(task_id, TaskStatus::Failed, 0.0, None, Some(&err.message()))
                    .await;
            }
            match &err {
                PipelineError::Closed => {}
                PipelineError::Upstream(upstream) => {
                    if matches!(upstream, UpstreamError::AuthExpired) {
                        let _ = state.storage.mark_credential_expired(cred.id).await;
                    }
                    if upstream.counts_error() {
                        let _ = state
                            .storage
                            .record_error(cred.id, upstream.counts_consecutive(), threshold)
                            .await;
                    }
                }
                _ => {
                    let _ = state.storage.record_error(cred.id, true, threshold).await;
                }
            }
            if let Some(log_id) = run.log_id {
                let _ = state
                    .storage
                    .close_request_log(
                        log_id,
                        &err.client_payload().to_string(),
                        err.log_status(),
                        elapsed,
                    )
                    .await;
            }
            Err(err)
        }
    }
}

/// A successful video generation consumes one Sora2 credit; hitting zero
/// arms the quota cooldown.
async fn settle_sora2_quota(state: &Arc<AppState>, cred: &CredentialRecord) {
    if cred.sora2_remaining_count <= 0 {
        return;
    }
    let remaining = cred.sora2_remaining_count - 1;
    let _ = state.storage.set_sora2_remaining(cred.id, remaining).await;
    if remaining == 0 {
        let until = OffsetDateTime::now_utc() + time::Duration::hours(24);
        let _ = state.storage.set_sora2_cooldown(cred.id, Some(until)).await;
    }
}

pub(crate) fn decode_base64_attachment(data: &str) -> Result<Bytes, PipelineError> {
    let encoded = match data.split_once(',') {
        Some((_, rest)) => rest,
        None => data,
    };
    BASE64
        .decode(encoded.trim())
        .map(Bytes::from)
        .map_err(|err| PipelineError::Internal(format!("invalid base64 attachment: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_decoding_strips_data_uri_prefix() {
        let plain = BASE64.encode(b"media-bytes");
        assert_eq!(
            decode_base64_attachment(&plain).unwrap(),
            Bytes::from_static(b"media-bytes")
        );
        let with_prefix = format!("data:image/png;base64,{plain}");
        assert_eq!(
            decode_base64_attachment(&with_prefix).unwrap(),
            Bytes::from_static(b"media-bytes")
        );
        assert!(decode_base64_attachment("data:image/png;base64,!!!").is_err());
    }

    #[test]
    fn guard_releases_lock_and_slots_once() {
        let lock = Arc::new(TokenLock::new());
        let limiter = Arc::new(ConcurrencyLimiter::new());
        limiter.reset(9, 1, 1);

        assert!(lock.try_acquire(9, std::time::Duration::from_secs(60)));
        assert!(limiter.acquire_image(9));
        assert!(limiter.acquire_video(9));
        {
            let _guard = ReleaseGuard {
                lock: Some((lock.clone(), 9)),
                image_slot: Some((limiter.clone(), 9)),
                video_slot: Some((limiter.clone(), 9)),
            };
        }
        assert!(!lock.is_locked(9, std::time::Duration::from_secs(60)));
        assert!(limiter.acquire_image(9));
        assert!(limiter.acquire_video(9));
    }

    #[test]
    fn upstream_statuses_map_to_log_codes() {
        let shield = PipelineError::Upstream(UpstreamError::CfShield429);
        assert_eq!(shield.log_status(), 429);
        let timeout = PipelineError::Timeout("too slow".to_string());
        assert_eq!(timeout.log_status(), 408);
        let other = PipelineError::Internal("boom".to_string());
        assert_eq!(other.log_status(), 500);
    }

    #[test]
    fn structured_country_errors_pass_through_to_the_client() {
        let payload = json!({"error": {"code": "unsupported_country_code", "message": "no"}});
        let err = PipelineError::Upstream(UpstreamError::UnsupportedCountry {
            payload: payload.clone(),
        });
        assert_eq!(err.client_payload(), payload);

        let generic = PipelineError::Internal("boom".to_string());
        assert_eq!(generic.client_payload()["error"]["type"], "server_error");
    }
}
