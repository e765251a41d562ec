use std::sync::Arc;

use tracing::{info, warn};

use sproxy_common::WatermarkMethod;
use sproxy_storage::CredentialRecord;
use sproxy_upstream::DraftItem;

use crate::cache::MediaType;
use crate::state::AppState;

use super::emit::Emitter;
use super::PipelineError;

/// Resolves the URL the caller finally sees for a completed video draft:
/// watermark-free when the mode is enabled (publish → parse → cache →
/// best-effort unpublish), the plain draft URL otherwise. Every
/// watermark-free sub-failure falls back to the original asset.
pub(super) async fn final_video_url(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    item: &DraftItem,
    cred: &CredentialRecord,
) -> Result<String, PipelineError> {
    let settings = state.settings();
    let cache_enabled = settings.cache.enabled;
    let ttl = settings.cache.timeout_secs;
    let proxy = state.resolve_proxy(cred);

    if settings.watermark.enabled {
        match publish_and_resolve(state, emitter, item, cred).await {
            Ok((clean_url, post_id)) => {
                emitter
                    .reasoning(format!(
                        "Video published successfully. Post ID: {post_id}\nNow {} watermark-free video...\n",
                        if cache_enabled { "caching" } else { "preparing" }
                    ))
                    .await?;
                if !cache_enabled {
                    emitter
                        .reasoning("Cache is disabled. Using watermark-free URL directly...\n")
                        .await?;
                    return Ok(clean_url);
                }
                match state
                    .cache
                    .download_and_cache(
                        &state.client,
                        &clean_url,
                        MediaType::Video,
                        proxy.as_deref(),
                        ttl,
                    )
                    .await
                {
                    Ok(filename) => {
                        emitter
                            .reasoning(
                                "Watermark-free video cached successfully. Preparing final response...\n",
                            )
                            .await?;
                        // The published post served its purpose; removal is
                        // best-effort.
                        match state.client.delete_post(&post_id, &cred.access_token).await {
                            Ok(()) => {
                                info!(event = "post_deleted", %post_id);
                                emitter
                                    .reasoning("Published post deleted successfully.\n")
                                    .await?;
                            }
                            Err(err) => {
                                warn!(event = "post_delete_failed", %post_id, %err);
                                emitter
                                    .reasoning(format!(
                                        "Warning: Failed to delete published post - {err}\n"
                                    ))
                                    .await?;
                            }
                        }
                        return Ok(format!("{}/tmp/{filename}", state.cache_base_url()));
                    }
                    Err(err) => {
                        emitter
                            .reasoning(format!(
                                "Warning: Failed to cache file - {err}\nUsing original watermark-free URL instead...\n"
                            ))
                            .await?;
                        return Ok(clean_url);
                    }
                }
            }
            Err(PipelineError::Closed) => return Err(PipelineError::Closed),
            Err(err) => {
                warn!(event = "watermark_free_failed", error = %err.message());
                emitter
                    .reasoning(format!(
                        "Warning: Failed to get watermark-free version - {}\nFalling back to normal video...\n",
                        err.message()
                    ))
                    .await?;
            }
        }
    }

    let url = item
        .result_url()
        .map(str::to_string)
        .ok_or_else(|| PipelineError::Internal("Video URL not found".to_string()))?;
    if !cache_enabled {
        emitter
            .reasoning(
                "**Video Generation Completed**\n\nCache is disabled. Using original URL directly...\n",
            )
            .await?;
        return Ok(url);
    }

    emitter
        .reasoning(
            "**Video Generation Completed**\n\nVideo generation successful. Now caching the video file...\n",
        )
        .await?;
    match state
        .cache
        .download_and_cache(&state.client, &url, MediaType::Video, proxy.as_deref(), ttl)
        .await
    {
        Ok(filename) => {
            emitter
                .reasoning("Video file cached successfully. Preparing final response...\n")
                .await?;
            Ok(format!("{}/tmp/{filename}", state.cache_base_url()))
        }
        Err(err) => {
            emitter
                .reasoning(format!(
                    "Warning: Failed to cache file - {err}\nUsing original URL instead...\n"
                ))
                .await?;
            Ok(url)
        }
    }
}

/// Publishes the generation and resolves the clean URL for it. The
/// third-party CDN pattern is the zero-config default; the custom parser is
/// used only when fully configured.
async fn publish_and_resolve(
    state: &Arc<AppState>,
    emitter: &mut Emitter,
    item: &DraftItem,
    cred: &CredentialRecord,
) -> Result<(String, String), PipelineError> {
    let generation_id = item
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            PipelineError::Internal("Generation ID not found in video draft".to_string())
        })?;

    emitter
        .reasoning(
            "**Video Generation Completed**\n\nWatermark-free mode enabled. Publishing video to get watermark-free version...\n",
        )
        .await?;
    let post_id = state
        .client
        .publish_post(generation_id, &cred.access_token)
        .await?;

    let settings = state.settings();
    let custom = match settings.watermark.method {
        WatermarkMethod::Custom => settings
            .watermark
            .custom_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .zip(
                settings
                    .watermark
                    .custom_token
                    .as_deref()
                    .filter(|token| !token.trim().is_empty()),
            ),
        WatermarkMethod::ThirdParty => None,
    };

    let clean_url = match custom {
        Some((parse_url, parse_token)) => {
            emitter
                .reasoning(format!(
                    "Video published successfully. Post ID: {post_id}\nUsing custom parse server to get watermark-free URL...\n"
                ))
                .await?;
            state
                .client
                .custom_parse(parse_url, parse_token, &post_id)
                .await?
        }
        None => format!("https://oscdn2.dyysy.com/MP4/{post_id}.mp4"),
    };
    Ok((clean_url, post_id))
}
