use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};
use wreq::{Client, Method, Proxy};
use wreq_util::Emulation;

use sproxy_common::{UpstreamError, UpstreamResult};

use crate::types::{CameoStatus, DraftList, PendingTask, RecentImageTasks};

pub const DEFAULT_BASE_URL: &str = "https://sora.chatgpt.com/backend";
pub(crate) const CHATGPT_BASE_URL: &str = "https://chatgpt.com";
pub(crate) const SORA_USER_AGENT: &str =
    "Sora/1.2026.007 (Android 15; 24122RKC7C; build 2600700)";

/// Only creation-class endpoints route through a proxy; polling, listing,
/// uploads, publish and deletes go direct even when one is configured.
const PROXIED_PREFIXES: [&str; 2] = ["/nf/create", "/video_gen"];

pub struct SoraClient {
    base_url: String,
    timeout: Duration,
    clients: Mutex<HashMap<Option<String>, Client>>,
}

#[derive(Debug, Clone)]
pub struct UploadImageParams<'a> {
    pub data: Bytes,
    pub file_name: &'a str,
}

#[derive(Debug, Clone)]
pub struct CreateVideoParams<'a> {
    pub prompt: &'a str,
    pub orientation: &'a str,
    pub size: &'a str,
    pub n_frames: i64,
    pub model: &'a str,
    pub media_id: Option<&'a str>,
    pub style_id: Option<&'a str>,
}

enum Payload {
    Empty,
    Json(JsonValue),
    Multipart(wreq::multipart::Form),
}

impl SoraClient {
    pub fn new(base_url: Option<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url
                .filter(|url| !url.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn http(&self, proxy: Option<&str>) -> UpstreamResult<Client> {
        let key = normalize_proxy(proxy);
        let mut guard = self
            .clients
            .lock()
            .map_err(|_| UpstreamError::Transport("client cache lock failed".to_string()))?;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(key.as_deref(), self.timeout)?;
        guard.insert(key, client.clone());
        Ok(client)
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        auth: &str,
        payload: Payload,
        with_sentinel: bool,
        proxy: Option<&str>,
    ) -> UpstreamResult<JsonValue> {
        let proxy = proxy_for_endpoint(endpoint, proxy);
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), endpoint);

        let mut builder = self
            .http(proxy.as_deref())?
            .request(method, &url)
            .header("Authorization", format!("Bearer {auth}"))
            .header("User-Agent", SORA_USER_AGENT);

        if with_sentinel {
            let header = crate::sentinel::sentinel_header(self, Some(auth), proxy.as_deref())
                .await?;
            builder = builder.header("openai-sentinel-token", header);
        }

        builder = match payload {
            Payload::Empty => builder,
            Payload::Json(body) => builder.json(&body),
            Payload::Multipart(form) => builder.multipart(form),
        };

        debug!(event = "upstream_request", %url, proxied = proxy.is_some());
        let resp = builder
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;

        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;

        if !matches!(status, 200 | 201 | 204) {
            let text = String::from_utf8_lossy(&body).to_string();
            warn!(event = "upstream_error", %url, status, body = %text);
            return Err(classify_failure(status, &text));
        }

        if body.is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_slice(&body)
            .map_err(|err| UpstreamError::Transport(format!("invalid upstream json: {err}")))
    }

    /// Multipart upload; returns the upstream media id.
    pub async fn upload_image(&self, params: UploadImageParams<'_>, auth: &str) -> UpstreamResult<String> {
        let mime = image_mime(params.file_name);
        let part = wreq::multipart::Part::bytes(params.data.to_vec())
            .file_name(params.file_name.to_string())
            .mime_str(mime)
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        let form = wreq::multipart::Form::new()
            .part("file", part)
            .text("file_name", params.file_name.to_string());

        let value = self
            .request(Method::POST, "/uploads", auth, Payload::Multipart(form), false, None)
            .await?;
        required_str(&value, "id")
    }

    /// Text- or image-to-image creation. Anti-abuse header required.
    pub async fn create_image(
        &self,
        prompt: &str,
        width: i64,
        height: i64,
        media_id: Option<&str>,
        auth: &str,
        proxy: Option<&str>,
    ) -> UpstreamResult<String> {
        let operation = if media_id.is_some() { "remix" } else { "simple_compose" };
        let inpaint_items = match media_id {
            Some(media_id) => json!([{
                "type": "image",
                "frame_index": 0,
                "upload_media_id": media_id,
            }]),
            None => json!([]),
        };
        let body = json!({
            "type": "image_gen",
            "operation": operation,
            "prompt": prompt,
            "width": width,
            "height": height,
            "n_variants": 1,
            "n_frames": 1,
            "inpaint_items": inpaint_items,
        });
        let value = self
            .request(Method::POST, "/video_gen", auth, Payload::Json(body), true, proxy)
            .await?;
        required_str(&value, "id")
    }

    /// Text- or image-to-video creation. Anti-abuse header required.
    pub async fn create_video(
        &self,
        params: CreateVideoParams<'_>,
        auth: &str,
        proxy: Option<&str>,
    ) -> UpstreamResult<String> {
        let inpaint_items = match params.media_id {
            Some(media_id) => json!([{"kind": "upload", "upload_id": media_id}]),
            None => json!([]),
        };
        let body = json!({
            "kind": "video",
            "prompt": params.prompt,
            "orientation": params.orientation,
            "size": params.size,
            "n_frames": params.n_frames,
            "model": params.model,
            "inpaint_items": inpaint_items,
            "style_id": params.style_id,
        });
        let value = self
            .request(Method::POST, "/nf/create", auth, Payload::Json(body), true, proxy)
            .await?;
        required_str(&value, "id")
    }

    /// Storyboard creation with the fixed metadata shape the endpoint expects.
    pub async fn create_storyboard(
        &self,
        params: CreateVideoParams<'_>,
        auth: &str,
        proxy: Option<&str>,
    ) -> UpstreamResult<String> {
        let inpaint_items = match params.media_id {
            Some(media_id) => json!([{"kind": "upload", "upload_id": media_id}]),
            None => json!([]),
        };
        let body = json!({
            "kind": "video",
            "prompt": params.prompt,
            "title": "Draft your video",
            "orientation": params.orientation,
            "size": "small",
            "n_frames": params.n_frames,
            "storyboard_id": null,
            "inpaint_items": inpaint_items,
            "remix_target_id": null,
            "model": "sy_8",
            "metadata": null,
            "style_id": params.style_id,
            "cameo_ids": null,
            "cameo_replacements": null,
            "audio_caption": null,
            "audio_transcript": null,
            "video_caption": null,
        });
        let value = self
            .request(
                Method::POST,
                "/nf/create/storyboard",
                auth,
                Payload::Json(body),
                true,
                proxy,
            )
            .await?;
        required_str(&value, "id")
    }

    /// Derive a new video from a shared generation. Anti-abuse header required.
    pub async fn create_remix(
        &self,
        remix_target_id: &str,
        prompt: &str,
        orientation: &str,
        n_frames: i64,
        style_id: Option<&str>,
        auth: &str,
        proxy: Option<&str>,
    ) -> UpstreamResult<String> {
        let body = json!({
            "kind": "video",
            "prompt": prompt,
            "inpaint_items": [],
            "remix_target_id": remix_target_id,
            "cameo_ids": [],
            "cameo_replacements": {},
            "model": "sy_8",
            "orientation": orientation,
            "n_frames": n_frames,
            "style_id": style_id,
        });
        let value = self
            .request(Method::POST, "/nf/create", auth, Payload::Json(body), true, proxy)
            .await?;
        required_str(&value, "id")
    }

    pub async fn pending_tasks(&self, auth: &str) -> UpstreamResult<Vec<PendingTask>> {
        let value = self
            .request(Method::GET, "/nf/pending/v2", auth, Payload::Empty, false, None)
            .await?;
        if value.is_array() {
            serde_json::from_value(value)
                .map_err(|err| UpstreamError::Transport(format!("invalid pending list: {err}")))
        } else {
            Ok(Vec::new())
        }
    }

    pub async fn recent_image_tasks(&self, auth: &str) -> UpstreamResult<RecentImageTasks> {
        let value = self
            .request(
                Method::GET,
                "/v2/recent_tasks?limit=20",
                auth,
                Payload::Empty,
                false,
                None,
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|err| UpstreamError::Transport(format!("invalid recent tasks: {err}")))
    }

    pub async fn video_drafts(&self, auth: &str) -> UpstreamResult<DraftList> {
        let value = self
            .request(
                Method::GET,
                "/project_y/profile/drafts?limit=15",
                auth,
                Payload::Empty,
                false,
                None,
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|err| UpstreamError::Transport(format!("invalid drafts list: {err}")))
    }

    /// Publish a generation; returns `post.id`. Anti-abuse header required.
    pub async fn publish_post(&self, generation_id: &str, auth: &str) -> UpstreamResult<String> {
        let body = json!({
            "attachments_to_create": [{"generation_id": generation_id, "kind": "sora"}],
            "post_text": "",
        });
        let value = self
            .request(Method::POST, "/project_y/post", auth, Payload::Json(body), true, None)
            .await?;
        value
            .pointer("/post/id")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| UpstreamError::Transport("publish returned no post id".to_string()))
    }

    pub async fn delete_post(&self, post_id: &str, auth: &str) -> UpstreamResult<()> {
        self.request(
            Method::DELETE,
            &format!("/project_y/post/{post_id}"),
            auth,
            Payload::Empty,
            false,
            None,
        )
        .await?;
        Ok(())
    }

    /// Ask the admin-configured parse server for a clean download link.
    pub async fn custom_parse(
        &self,
        parse_url: &str,
        parse_token: &str,
        post_id: &str,
    ) -> UpstreamResult<String> {
        let share_url = format!("https://sora.chatgpt.com/p/{post_id}");
        let body = json!({"url": share_url, "token": parse_token});
        let url = format!("{}/get-sora-link", parse_url.trim_end_matches('/'));

        let resp = self
            .http(None)?
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        if status != 200 {
            return Err(UpstreamError::Status {
                status,
                body: String::from_utf8_lossy(&bytes).to_string(),
            });
        }
        let value: JsonValue = serde_json::from_slice(&bytes)
            .map_err(|err| UpstreamError::Transport(format!("invalid parse response: {err}")))?;
        if let Some(error) = value.get("error") {
            return Err(UpstreamError::Status {
                status: 401,
                body: error.to_string(),
            });
        }
        value
            .get("download_link")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                UpstreamError::Transport("no download_link in parse response".to_string())
            })
    }

    // Character flow --------------------------------------------------------

    /// Upload the source video; returns the cameo id.
    pub async fn upload_character_video(&self, data: Bytes, auth: &str) -> UpstreamResult<String> {
        let part = wreq::multipart::Part::bytes(data.to_vec())
            .file_name("video.mp4".to_string())
            .mime_str("video/mp4")
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        let form = wreq::multipart::Form::new()
            .part("file", part)
            .text("timestamps", "0,3");
        let value = self
            .request(
                Method::POST,
                "/characters/upload",
                auth,
                Payload::Multipart(form),
                false,
                None,
            )
            .await?;
        required_str(&value, "id")
    }

    pub async fn cameo_status(&self, cameo_id: &str, auth: &str) -> UpstreamResult<CameoStatus> {
        let value = self
            .request(
                Method::GET,
                &format!("/project_y/cameos/in_progress/{cameo_id}"),
                auth,
                Payload::Empty,
                false,
                None,
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|err| UpstreamError::Transport(format!("invalid cameo status: {err}")))
    }

    /// Bare GET used for profile assets and cacheable artifacts.
    pub async fn download(&self, url: &str, proxy: Option<&str>) -> UpstreamResult<Bytes> {
        let resp = self
            .http(proxy)?
            .get(url)
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(UpstreamError::Status {
                status,
                body: format!("download failed for {url}"),
            });
        }
        resp.bytes()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))
    }

    /// Upload the profile image; returns the asset pointer.
    pub async fn upload_profile_image(&self, data: Bytes, auth: &str) -> UpstreamResult<String> {
        let part = wreq::multipart::Part::bytes(data.to_vec())
            .file_name("profile.webp".to_string())
            .mime_str("image/webp")
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        let form = wreq::multipart::Form::new()
            .part("file", part)
            .text("use_case", "profile");
        let value = self
            .request(
                Method::POST,
                "/project_y/file/upload",
                auth,
                Payload::Multipart(form),
                false,
                None,
            )
            .await?;
        required_str(&value, "asset_pointer")
    }

    /// `instruction_set` is always null; the endpoint rejects anything else.
    pub async fn finalize_character(
        &self,
        cameo_id: &str,
        username: &str,
        display_name: &str,
        profile_asset_pointer: &str,
        auth: &str,
    ) -> UpstreamResult<String> {
        let body = json!({
            "cameo_id": cameo_id,
            "username": username,
            "display_name": display_name,
            "profile_asset_pointer": profile_asset_pointer,
            "instruction_set": null,
            "safety_instruction_set": null,
        });
        let value = self
            .request(
                Method::POST,
                "/characters/finalize",
                auth,
                Payload::Json(body),
                false,
                None,
            )
            .await?;
        value
            .pointer("/character/character_id")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                UpstreamError::Transport("finalize returned no character id".to_string())
            })
    }

    pub async fn set_character_public(&self, cameo_id: &str, auth: &str) -> UpstreamResult<()> {
        let body = json!({"visibility": "public"});
        self.request(
            Method::POST,
            &format!("/project_y/cameos/by_id/{cameo_id}/update_v2"),
            auth,
            Payload::Json(body),
            false,
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn delete_character(&self, character_id: &str, auth: &str) -> UpstreamResult<()> {
        self.request(
            Method::DELETE,
            &format!("/project_y/characters/{character_id}"),
            auth,
            Payload::Empty,
            false,
            None,
        )
        .await?;
        Ok(())
    }

    /// Remaining Sora2 creations for the account, if the endpoint reports it.
    pub async fn video_remaining(&self, auth: &str) -> UpstreamResult<Option<i64>> {
        let value = self
            .request(Method::GET, "/nf/limits", auth, Payload::Empty, false, None)
            .await?;
        Ok(value
            .get("remaining_count")
            .or_else(|| value.get("remaining"))
            .and_then(JsonValue::as_i64))
    }
}

fn required_str(value: &JsonValue, key: &str) -> UpstreamResult<String> {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| UpstreamError::Transport(format!("missing `{key}` in upstream response")))
}

fn image_mime(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/png"
    }
}

fn normalize_proxy(value: Option<&str>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

/// Creation-class endpoints keep the proxy; everything else goes direct.
fn proxy_for_endpoint(endpoint: &str, proxy: Option<&str>) -> Option<String> {
    let proxy = normalize_proxy(proxy)?;
    PROXIED_PREFIXES
        .iter()
        .any(|prefix| endpoint.starts_with(prefix))
        .then_some(proxy)
}

fn build_client(proxy: Option<&str>, timeout: Duration) -> UpstreamResult<Client> {
    let mut builder = Client::builder()
        .emulation(Emulation::SafariIos17_2)
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout);
    if let Some(proxy) = proxy {
        builder = builder
            .proxy(Proxy::all(proxy).map_err(|err| UpstreamError::Transport(err.to_string()))?);
    }
    builder
        .build()
        .map_err(|err| UpstreamError::Transport(err.to_string()))
}

/// Maps a non-2xx upstream response onto the tagged failure taxonomy.
fn classify_failure(status: u16, body: &str) -> UpstreamError {
    if let Ok(value) = serde_json::from_str::<JsonValue>(body) {
        match value.pointer("/error/code").and_then(JsonValue::as_str) {
            Some("unsupported_country_code") => {
                return UpstreamError::UnsupportedCountry { payload: value };
            }
            Some("cf_shield_429") => return UpstreamError::CfShield429,
            _ => {}
        }
    }
    if status == 401 {
        return UpstreamError::AuthExpired;
    }
    let lower = body.to_ascii_lowercase();
    if lower.contains("heavy_load") || lower.contains("under heavy load") {
        return UpstreamError::Overload(body.to_string());
    }
    UpstreamError::Status {
        status,
        body: body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_applies_only_to_creation_endpoints() {
        let proxy = Some("http://127.0.0.1:7890");
        assert_eq!(
            proxy_for_endpoint("/nf/create", proxy).as_deref(),
            Some("http://127.0.0.1:7890")
        );
        assert_eq!(
            proxy_for_endpoint("/nf/create/storyboard", proxy).as_deref(),
            Some("http://127.0.0.1:7890")
        );
        assert_eq!(
            proxy_for_endpoint("/video_gen", proxy).as_deref(),
            Some("http://127.0.0.1:7890")
        );
        assert_eq!(proxy_for_endpoint("/nf/pending/v2", proxy), None);
        assert_eq!(proxy_for_endpoint("/uploads", proxy), None);
        assert_eq!(proxy_for_endpoint("/project_y/post", proxy), None);
    }

    #[test]
    fn blank_proxy_is_dropped() {
        assert_eq!(proxy_for_endpoint("/nf/create", Some("  ")), None);
        assert_eq!(proxy_for_endpoint("/nf/create", None), None);
    }

    #[test]
    fn classify_country_block() {
        let body = r#"{"error":{"code":"unsupported_country_code","message":"nope"}}"#;
        match classify_failure(403, body) {
            UpstreamError::UnsupportedCountry { payload } => {
                assert_eq!(
                    payload.pointer("/error/code").unwrap().as_str(),
                    Some("unsupported_country_code")
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_cf_shield() {
        let body = r#"{"error":{"code":"cf_shield_429"}}"#;
        assert!(matches!(
            classify_failure(429, body),
            UpstreamError::CfShield429
        ));
    }

    #[test]
    fn classify_auth_expired() {
        assert!(matches!(
            classify_failure(401, "token_invalidated"),
            UpstreamError::AuthExpired
        ));
    }

    #[test]
    fn classify_overload() {
        assert!(matches!(
            classify_failure(500, "server is under heavy load"),
            UpstreamError::Overload(_)
        ));
        assert!(matches!(
            classify_failure(500, r#"{"error":{"code":"heavy_load"}}"#),
            UpstreamError::Overload(_)
        ));
    }

    #[test]
    fn classify_generic() {
        assert!(matches!(
            classify_failure(500, "boom"),
            UpstreamError::Status { status: 500, .. }
        ));
    }

    #[test]
    fn image_mime_from_extension() {
        assert_eq!(image_mime("a.PNG"), "image/png");
        assert_eq!(image_mime("a.jpeg"), "image/jpeg");
        assert_eq!(image_mime("a.webp"), "image/webp");
        assert_eq!(image_mime("noext"), "image/png");
    }
}
