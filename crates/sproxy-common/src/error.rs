use serde_json::Value as JsonValue;

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Failure classes surfaced by upstream calls.
///
/// Decisions downstream (error counting, auto-ban, log status codes) key off
/// the variant, never off message text.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// Structured `unsupported_country_code` body, forwarded verbatim.
    #[error("unsupported country")]
    UnsupportedCountry { payload: JsonValue },

    /// Cloudflare shield / rate-limit event. Not the credential's fault:
    /// never counted against it, and polling must stop immediately.
    #[error("cloudflare challenge or rate limit (429) triggered")]
    CfShield429,

    /// HTTP 401 on a credential-bearing call.
    #[error("upstream authentication expired")]
    AuthExpired,

    /// "heavy_load" class errors: counted in totals, never in the
    /// consecutive-error counter.
    #[error("upstream under heavy load: {0}")]
    Overload(String),

    /// Terminal content-policy violation detected at draft-fetch time.
    #[error("content policy violation: {reason}")]
    ContentViolation { reason: String },

    /// Any other non-2xx upstream response.
    #[error("upstream request failed: {status} - {body}")]
    Status { status: u16, body: String },

    /// Connection-level failure (DNS, TLS, timeout, reset).
    #[error("upstream transport error: {0}")]
    Transport(String),
}

impl UpstreamError {
    /// Whether this failure should advance the credential's
    /// consecutive-error counter (and thus the auto-ban threshold).
    pub fn counts_consecutive(&self) -> bool {
        !matches!(
            self,
            UpstreamError::CfShield429 | UpstreamError::Overload(_)
        )
    }

    /// Whether the credential is debited an error at all.
    pub fn counts_error(&self) -> bool {
        !matches!(self, UpstreamError::CfShield429)
    }

    /// Status code recorded on the request log for this failure.
    pub fn log_status(&self) -> i32 {
        match self {
            UpstreamError::CfShield429 => 429,
            UpstreamError::UnsupportedCountry { .. } => 400,
            UpstreamError::AuthExpired => 401,
            _ => 500,
        }
    }

    /// Body forwarded to the caller inside the streamed error chunk.
    pub fn client_payload(&self) -> JsonValue {
        match self {
            UpstreamError::UnsupportedCountry { payload } => payload.clone(),
            other => serde_json::json!({
                "error": {
                    "message": other.to_string(),
                    "type": "server_error",
                    "param": null,
                    "code": null,
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::UpstreamError;

    #[test]
    fn shield_and_overload_do_not_count_consecutive() {
        assert!(!UpstreamError::CfShield429.counts_consecutive());
        assert!(!UpstreamError::Overload("heavy_load".into()).counts_consecutive());
        assert!(
            UpstreamError::Status {
                status: 500,
                body: "boom".into()
            }
            .counts_consecutive()
        );
    }

    #[test]
    fn shield_is_never_debited() {
        assert!(!UpstreamError::CfShield429.counts_error());
        assert!(UpstreamError::Overload("heavy_load".into()).counts_error());
    }

    #[test]
    fn log_status_mapping() {
        assert_eq!(UpstreamError::CfShield429.log_status(), 429);
        assert_eq!(UpstreamError::AuthExpired.log_status(), 401);
        assert_eq!(
            UpstreamError::Transport("reset".into()).log_status(),
            500
        );
    }

    #[test]
    fn country_payload_is_forwarded_verbatim() {
        let payload = serde_json::json!({"error": {"code": "unsupported_country_code"}});
        let err = UpstreamError::UnsupportedCountry {
            payload: payload.clone(),
        };
        assert_eq!(err.client_payload(), payload);
    }
}
