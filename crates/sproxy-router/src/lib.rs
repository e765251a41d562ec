//! OpenAI-compatible HTTP surface. Handlers stay thin: parse, authorize,
//! hand off to the pipeline, and format SSE at the boundary.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::{get, post};
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use sproxy_core::{
    AppState, GenerationRequest, StreamEvent, availability_message, find_model, run_generation,
};
use sproxy_protocol::chat::{
    ChatCompletionRequest, ChatCompletionResponse, ContentPart, MessageContent,
};
use sproxy_protocol::error::ApiErrorBody;
use sproxy_protocol::images::{ImageDatum, ImageGenerationRequest, ImageGenerationResponse};
use sproxy_protocol::models::{ModelEntry, ModelList};
use sproxy_protocol::sse;

pub fn openai_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/images/generations", post(images_generations))
        .route("/v1/models", get(list_models))
        .route("/tmp/{file}", get(serve_cached_file))
        .with_state(state)
}

fn json_response(status: StatusCode, value: &JsonValue) -> Response {
    let mut resp = Response::new(Body::from(value.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    resp
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::to_value(ApiErrorBody::server_error(message)).unwrap_or(JsonValue::Null);
    json_response(status, &body)
}

fn bad_request(message: impl Into<String>) -> Response {
    let body =
        serde_json::to_value(ApiErrorBody::invalid_request(message)).unwrap_or(JsonValue::Null);
    json_response(StatusCode::BAD_REQUEST, &body)
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(value.trim().to_string());
    }
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let expected = state.settings().admin.api_key.clone();
    match extract_api_key(headers) {
        Some(key) if !expected.is_empty() && key == expected => Ok(()),
        _ => Err(error_response(StatusCode::UNAUTHORIZED, "Invalid API key")),
    }
}

/// Folds the request body (top-level extensions plus the last message's
/// content parts) into the pipeline input. Parts win over top-level fields;
/// a share id embedded in the prompt backfills `remix_target_id`.
fn extract_inputs(request: &ChatCompletionRequest) -> Result<GenerationRequest, String> {
    let last = request
        .messages
        .last()
        .ok_or_else(|| "Messages cannot be empty".to_string())?;

    let mut prompt = String::new();
    let mut image = request.image.clone();
    let mut video = request.video.clone();

    match &last.content {
        MessageContent::Text(text) => prompt = text.clone(),
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        if !prompt.is_empty() {
                            prompt.push(' ');
                        }
                        prompt.push_str(text);
                    }
                    ContentPart::ImageUrl { image_url } => {
                        if image_url.url.starts_with("data:image") {
                            image = Some(strip_data_uri(&image_url.url));
                        }
                    }
                    ContentPart::VideoUrl { video_url } => {
                        let url = &video_url.url;
                        if url.starts_with("data:video") || url.starts_with("data:application") {
                            video = Some(strip_data_uri(url));
                        } else {
                            // Plain URL: downloaded lazily by the pipeline.
                            video = Some(url.clone());
                        }
                    }
                    ContentPart::Other => {}
                }
            }
        }
    }

    let remix_target_id = request
        .remix_target_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .or_else(|| sproxy_core::prompt::extract_remix_id(&prompt));

    Ok(GenerationRequest {
        model: request.model.clone(),
        prompt,
        image,
        video,
        remix_target_id,
    })
}

fn strip_data_uri(url: &str) -> String {
    match url.split_once("base64,") {
        Some((_, data)) => data.to_string(),
        None => url.to_string(),
    }
}

fn sse_response(rx: tokio::sync::mpsc::Receiver<StreamEvent>) -> Response {
    let frames = ReceiverStream::new(rx).map(|event| {
        let frame = match event {
            StreamEvent::Chunk(chunk) => sse::data_frame(&chunk),
            StreamEvent::Error(payload) => sse::data_frame(&payload),
            StreamEvent::Done => sse::DONE_FRAME.to_string(),
        };
        Ok::<_, Infallible>(frame)
    });

    let mut resp = Response::new(Body::from_stream(frames));
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        "x-accel-buffering",
        header::HeaderValue::from_static("no"),
    );
    resp
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::Json(request): axum::Json<ChatCompletionRequest>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }

    let inputs = match extract_inputs(&request) {
        Ok(inputs) => inputs,
        Err(message) => return bad_request(message),
    };
    let Some(spec) = find_model(&inputs.model) else {
        return bad_request(format!("Invalid model: {}", inputs.model));
    };

    info!(
        event = "chat_completion",
        model = %inputs.model,
        stream = request.stream,
        has_image = inputs.image.is_some(),
        has_video = inputs.video.is_some(),
        remix = inputs.remix_target_id.is_some(),
    );

    if !request.stream {
        // Availability-only: no generation is performed.
        return match availability_message(&state, spec).await {
            Ok(message) => {
                let envelope = ChatCompletionResponse::assistant(message);
                match serde_json::to_value(&envelope) {
                    Ok(value) => json_response(StatusCode::OK, &value),
                    Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
                }
            }
            Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
    }

    sse_response(run_generation(state.clone(), inputs))
}

async fn images_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::Json(request): axum::Json<ImageGenerationRequest>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    if find_model(&request.model).is_none() {
        return bad_request(format!("Invalid model: {}", request.model));
    }

    // The pipeline always streams; accumulate the final Markdown here and
    // answer in the standard image-generation shape.
    let mut rx = run_generation(
        state.clone(),
        GenerationRequest {
            model: request.model.clone(),
            prompt: request.prompt.clone(),
            ..Default::default()
        },
    );

    let mut content = String::new();
    let mut error_payload: Option<JsonValue> = None;
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Chunk(chunk) => {
                for choice in &chunk.choices {
                    if let Some(text) = &choice.delta.content {
                        content.push_str(text);
                    }
                }
            }
            StreamEvent::Error(payload) => error_payload = Some(payload),
            StreamEvent::Done => break,
        }
    }

    if let Some(payload) = error_payload {
        return json_response(StatusCode::INTERNAL_SERVER_ERROR, &payload);
    }

    let urls = sproxy_core::prompt::extract_image_urls(&content);
    if urls.is_empty() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Generation completed but no image URL could be extracted",
        );
    }

    let response = ImageGenerationResponse {
        created: time::OffsetDateTime::now_utc().unix_timestamp(),
        data: urls.into_iter().map(|url| ImageDatum { url }).collect(),
    };
    match serde_json::to_value(&response) {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn list_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let entries = sproxy_core::all_models()
        .iter()
        .map(|spec| ModelEntry::new(spec.name, spec.description()))
        .collect();
    match serde_json::to_value(&ModelList::new(entries)) {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// Serves cached artifacts under `/tmp/<md5(url)>.<ext>`.
async fn serve_cached_file(
    State(state): State<Arc<AppState>>,
    Path(file): Path<String>,
) -> Response {
    // Hash-named flat directory; anything with a separator is hostile.
    if file.contains('/') || file.contains('\\') || file.contains("..") {
        return error_response(StatusCode::NOT_FOUND, "not found");
    }
    let path = state.cache.path_for(&file);
    match tokio::fs::read(&path).await {
        Ok(data) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            let mut resp = Response::new(Body::from(data));
            if let Ok(value) = header::HeaderValue::from_str(mime.as_ref()) {
                resp.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            resp
        }
        Err(_) => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_request(body: &str) -> ChatCompletionRequest {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn plain_prompt_backfills_remix_id() {
        let request = chat_request(
            r#"{
                "model": "sora2-landscape-10s",
                "messages": [{"role": "user", "content":
                    "make it rain https://sora.chatgpt.com/p/s_68e3a06dcd888191b150971da152c1f5"}],
                "stream": true
            }"#,
        );
        let inputs = extract_inputs(&request).unwrap();
        assert_eq!(
            inputs.remix_target_id.as_deref(),
            Some("s_68e3a06dcd888191b150971da152c1f5")
        );
        assert!(inputs.prompt.starts_with("make it rain"));
    }

    #[test]
    fn multimodal_parts_win_over_top_level_fields() {
        let request = chat_request(
            r#"{
                "model": "gpt-image",
                "image": "top-level",
                "messages": [{"role": "user", "content": [
                    {"type": "text", "text": "a cat"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,QUJD"}}
                ]}]
            }"#,
        );
        let inputs = extract_inputs(&request).unwrap();
        assert_eq!(inputs.prompt, "a cat");
        assert_eq!(inputs.image.as_deref(), Some("QUJD"));
    }

    #[test]
    fn video_url_part_passes_plain_urls_through() {
        let request = chat_request(
            r#"{
                "model": "sora2-portrait-10s",
                "messages": [{"role": "user", "content": [
                    {"type": "video_url", "video_url": {"url": "https://example.com/src.mp4"}}
                ]}]
            }"#,
        );
        let inputs = extract_inputs(&request).unwrap();
        assert_eq!(inputs.video.as_deref(), Some("https://example.com/src.mp4"));
        assert!(inputs.prompt.is_empty());
    }

    #[test]
    fn empty_messages_are_rejected() {
        let request = chat_request(r#"{"model": "gpt-image", "messages": []}"#);
        assert!(extract_inputs(&request).is_err());
    }

    #[test]
    fn data_uri_stripping() {
        assert_eq!(strip_data_uri("data:video/mp4;base64,AAA"), "AAA");
        assert_eq!(strip_data_uri("AAA"), "AAA");
    }

    #[test]
    fn api_key_from_either_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-test".parse().unwrap());
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-test"));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-direct".parse().unwrap());
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-direct"));

        assert_eq!(extract_api_key(&HeaderMap::new()), None);
    }
}
