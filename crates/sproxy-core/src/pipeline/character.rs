use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use serde_json::json;
use tracing::{info, warn};

use sproxy_storage::{CredentialRecord, NewRequestLog, NewTask};
use sproxy_upstream::client::CreateVideoParams;

use crate::models::{ModelKind, ModelSpec};
use crate::prompt::extract_style;
use crate::scheduler::SelectRequest;
use crate::state::AppState;

use super::emit::Emitter;
use super::poll;
use super::{
    GenerationRequest, PipelineError, RunState, acquire_resources, decode_base64_attachment,
    finish_run, select_credential,
};

const CAMEO_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CAMEO_POLL_BUDGET: Duration = Duration::from_secs(600);
const CAMEO_MAX_CONSECUTIVE_ERRORS: u32 = 3;

struct CreatedCharacter {
    cameo_id: String,
    character_id: String,
    username: String,
    display_name: String,
}

pub(super) async fn generate_with_character(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    request: &GenerationRequest,
    spec: &ModelSpec,
    video: String,
) -> Result<(), PipelineError> {
    if request.prompt.trim().is_empty() {
        character_only(state, emitter, &video).await
    } else {
        character_and_video(state, emitter, request, spec, &video).await
    }
}

/// Create the character, report its handle, then remove it again.
async fn character_only(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    video: &str,
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

    let log_id = state
        .storage
        .open_request_log(NewRequestLog {
            credential_id: Some(cred.id),
            task_id: None,
            operation: "character_only".to_string(),
            request_body: json!({"type": "character_creation", "has_video": true}).to_string(),
        })
        .await?;

    emitter
        .reasoning("**Character Creation Begins**\n\nInitializing character creation...\n")
        .await?;

    let mut character_id = None;
    let result = async {
        let video_bytes = resolve_video_bytes(state, emitter, video).await?;
        let character = create_character(state, emitter, &cred, video_bytes).await?;
        character_id = Some(character.character_id.clone());

        emitter
            .reasoning("Setting character as public...\n")
            .await?;
        state
            .client
            .set_character_public(&character.cameo_id, &cred.access_token)
            .await?;
        Ok(character)
    }
    .await;

    cleanup_character(state, &cred, character_id.as_deref()).await;

    let elapsed = started.elapsed().as_secs_f64();
    let threshold = state.settings().admin.error_ban_threshold;
    match result {
        Ok(character) => {
            let body = json!({
                "success": true,
                "username": character.username,
                "display_name": character.display_name,
                "character_id": character.character_id,
                "cameo_id": character.cameo_id,
            });
            state
                .storage
                .close_request_log(log_id, &body.to_string(), 200, elapsed)
                .await?;
            emitter
                .content(format!("角色创建成功，角色名@{}", character.username))
                .await?;
            Ok(())
        }
        Err(err) => {
            if let PipelineError::Upstream(upstream) = &err {
                if upstream.counts_error() {
                    let _ = state
                        .storage
                        .record_error(cred.id, upstream.counts_consecutive(), threshold)
                        .await;
                }
            } else if !matches!(err, PipelineError::Closed) {
                let _ = state.storage.record_error(cred.id, true, threshold).await;
            }
            let body = json!({"success": false, "error": err.message()});
            let _ = state
                .storage
                .close_request_log(log_id, &body.to_string(), err.log_status(), elapsed)
                .await;
            Err(err)
        }
    }
}

/// Create a throwaway character, reference it as `@username` in the prompt,
/// run the normal video flow, then delete the character.
async fn character_and_video(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    request: &GenerationRequest,
    spec: &ModelSpec,
    video: &str,
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
    run.log_id = Some(
        state
            .storage
            .open_request_log(NewRequestLog {
                credential_id: Some(cred.id),
                task_id: None,
                operation: "character_with_video".to_string(),
                request_body: json!({
                    "type": "character_creation_with_video",
                    "has_video": true,
                    "prompt": request.prompt,
                })
                .to_string(),
            })
            .await?,
    );

    emitter
        .reasoning("**Character Creation and Video Generation Begins**\n\nInitializing...\n")
        .await?;

    let mut character_id = None;
    let result = character_video_inner(
        state,
        emitter,
        request,
        spec,
        &cred,
        video,
        &mut run,
        &mut character_id,
    )
    .await;

    cleanup_character(state, &cred, character_id.as_deref()).await;
    finish_run(state, &cred, true, started, run, result).await
}

#[allow(clippy::too_many_arguments)]
async fn character_video_inner(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    request: &GenerationRequest,
    spec: &ModelSpec,
    cred: &CredentialRecord,
    video: &str,
    run: &mut RunState,
    character_id: &mut Option<String>,
) -> Result<poll::PollOutcome, PipelineError> {
    let video_bytes = resolve_video_bytes(state, emitter, video).await?;
    let character = create_character(state, emitter, cred, video_bytes).await?;
    *character_id = Some(character.character_id.clone());

    emitter
        .reasoning("**Video Generation Process Begins**\n\nGenerating video with character...\n")
        .await?;

    let (clean_prompt, style_id) = extract_style(&request.prompt);
    let full_prompt = format!("@{} {clean_prompt}", character.username);
    info!(event = "character_prompt", username = %character.username);

    let ModelKind::Video {
        orientation,
        n_frames,
        upstream_model,
        size,
    } = spec.kind
    else {
        return Err(PipelineError::Internal(
            "character flow requires a video model".to_string(),
        ));
    };

    let proxy = state.resolve_proxy(cred);
    let task_id = state
        .client
        .create_video(
            CreateVideoParams {
                prompt: &full_prompt,
                orientation,
                size,
                n_frames,
                model: upstream_model,
                media_id: None,
                style_id: style_id.as_deref(),
            },
            &cred.access_token,
            proxy.as_deref(),
        )
        .await?;

    run.task_id = Some(task_id.clone());
    state
        .storage
        .insert_task(NewTask {
            task_id: task_id.clone(),
            credential_id: cred.id,
            model: format!("sora2-video-{orientation}"),
            prompt: full_prompt.clone(),
        })
        .await?;
    state.storage.record_credential_use(cred.id).await?;

    poll::poll_video(state, emitter, cred, &task_id).await
}

async fn create_character(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    cred: &CredentialRecord,
    video_bytes: Bytes,
) -> Result<CreatedCharacter, PipelineError> {
    emitter.reasoning("Uploading video file...\n").await?;
    let cameo_id = state
        .client
        .upload_character_video(video_bytes, &cred.access_token)
        .await?;
    info!(event = "cameo_uploaded", %cameo_id);

    emitter
        .reasoning("Processing video to extract character...\n")
        .await?;
    let status = poll_cameo(state, &cameo_id, cred).await?;

    let username_hint = status.username_hint.as_deref().unwrap_or("character");
    let display_name = status
        .display_name_hint
        .clone()
        .unwrap_or_else(|| "Character".to_string());
    let username = mangle_username(username_hint);
    emitter
        .reasoning(format!("✨ 角色已识别: {display_name} (@{username})\n"))
        .await?;

    emitter
        .reasoning("Downloading character avatar...\n")
        .await?;
    let profile_asset_url = status.profile_asset_url.as_deref().ok_or_else(|| {
        PipelineError::Internal("Profile asset URL not found in cameo status".to_string())
    })?;
    let avatar = state.client.download(profile_asset_url, None).await?;

    emitter
        .reasoning("Uploading character avatar...\n")
        .await?;
    let asset_pointer = state
        .client
        .upload_profile_image(avatar, &cred.access_token)
        .await?;

    emitter
        .reasoning("Finalizing character creation...\n")
        .await?;
    let character_id = state
        .client
        .finalize_character(
            &cameo_id,
            &username,
            &display_name,
            &asset_pointer,
            &cred.access_token,
        )
        .await?;
    info!(event = "character_finalized", %character_id);

    Ok(CreatedCharacter {
        cameo_id,
        character_id,
        username,
        display_name,
    })
}

async fn poll_cameo(
    state: &Arc<AppState>,
    cameo_id: &str,
    cred: &CredentialRecord,
) -> Result<sproxy_upstream::CameoStatus, PipelineError> {
    let started = Instant::now();
    let mut consecutive_errors = 0_u32;

    loop {
        if started.elapsed() > CAMEO_POLL_BUDGET {
            return Err(PipelineError::Timeout(format!(
                "Cameo processing timeout after {} seconds",
                CAMEO_POLL_BUDGET.as_secs()
            )));
        }
        tokio::time::sleep(CAMEO_POLL_INTERVAL).await;

        match state.client.cameo_status(cameo_id, &cred.access_token).await {
            Ok(status) => {
                consecutive_errors = 0;
                if status.is_failed() {
                    let message = status
                        .status_message
                        .clone()
                        .unwrap_or_else(|| "Character creation failed".to_string());
                    return Err(PipelineError::Internal(format!("角色创建失败: {message}")));
                }
                if status.is_completed() {
                    return Ok(status);
                }
            }
            Err(err) => {
                consecutive_errors += 1;
                warn!(
                    event = "cameo_poll_failed",
                    %cameo_id,
                    consecutive_errors,
                    error = %err
                );
                if consecutive_errors >= CAMEO_MAX_CONSECUTIVE_ERRORS {
                    return Err(PipelineError::Upstream(err));
                }
            }
        }
    }
}

/// Characters are deleted on every exit of the character branch. Runs after
/// the terminal chunk may already be on the wire, so it never emits.
async fn cleanup_character(
    state: &Arc<AppState>,
    cred: &CredentialRecord,
    character_id: Option<&str>,
) {
    let Some(character_id) = character_id else {
        return;
    };
    match state
        .client
        .delete_character(character_id, &cred.access_token)
        .await
    {
        Ok(()) => info!(event = "character_deleted", %character_id),
        Err(err) => warn!(event = "character_delete_failed", %character_id, %err),
    }
}

/// Keep the segment after the last dot and append three random digits.
fn mangle_username(hint: &str) -> String {
    let base = hint.rsplit('.').next().unwrap_or(hint);
    let digits = rand::rng().random_range(100..1000);
    format!("{base}{digits}")
}

/// A plain URL is fetched by the gateway; anything else is base64 payload.
async fn resolve_video_bytes(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    video: &str,
) -> Result<Bytes, PipelineError> {
    if video.starts_with("http://") || video.starts_with("https://") {
        emitter.reasoning("Downloading video file...\n").await?;
        return Ok(state.client.download(video, None).await?);
    }
    decode_base64_attachment(video)
}

#[cfg(test)]
mod tests {
    use super::mangle_username;

    #[test]
    fn username_keeps_last_segment_and_appends_digits() {
        let name = mangle_username("blackwill.meowliusma68");
        assert!(name.starts_with("meowliusma68"));
        let suffix = &name["meowliusma68".len()..];
        assert_eq!(suffix.len(), 3);
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn username_without_prefix_is_kept() {
        let name = mangle_username("solo");
        assert!(name.starts_with("solo"));
        assert_eq!(name.len(), "solo".len() + 3);
    }
}
