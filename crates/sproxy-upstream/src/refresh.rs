use serde::Deserialize;
use time::{Duration, OffsetDateTime};

use sproxy_common::{UpstreamError, UpstreamResult};

use crate::client::SoraClient;

const DEFAULT_ISSUER: &str = "https://auth.openai.com";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expiry_time: Option<OffsetDateTime>,
}

/// Refresh-token grant against the issuer. Used by the background refresh
/// worker for credentials expiring within the next 24 hours.
pub async fn refresh_access_token(
    client: &SoraClient,
    client_id: &str,
    refresh_token: &str,
) -> UpstreamResult<RefreshedTokens> {
    let body = format!(
        "grant_type=refresh_token&refresh_token={}&client_id={}",
        urlencoding::encode(refresh_token),
        urlencoding::encode(client_id),
    );

    let resp = client
        .http(None)?
        .post(format!("{DEFAULT_ISSUER}/oauth/token"))
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await
        .map_err(|err| UpstreamError::Transport(err.to_string()))?;

    let status = resp.status().as_u16();
    let bytes = resp
        .bytes()
        .await
        .map_err(|err| UpstreamError::Transport(err.to_string()))?;
    if status == 401 {
        return Err(UpstreamError::AuthExpired);
    }
    if !matches!(status, 200 | 201) {
        return Err(UpstreamError::Status {
            status,
            body: format!("refresh_token_failed: {}", String::from_utf8_lossy(&bytes)),
        });
    }

    let tokens: TokenResponse = serde_json::from_slice(&bytes)
        .map_err(|err| UpstreamError::Transport(format!("invalid token response: {err}")))?;
    let expiry_time = tokens
        .expires_in
        .map(|secs| OffsetDateTime::now_utc() + Duration::seconds(secs));

    Ok(RefreshedTokens {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        expiry_time,
    })
}
