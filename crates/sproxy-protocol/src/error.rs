use serde::{Deserialize, Serialize};

/// OpenAI-style error body: `{"error": {message, type, param, code}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub param: Option<String>,
    pub code: Option<String>,
}

impl ApiErrorBody {
    pub fn server_error(message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                message: message.into(),
                kind: "server_error".to_string(),
                param: None,
                code: None,
            },
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                message: message.into(),
                kind: "invalid_request_error".to_string(),
                param: None,
                code: None,
            },
        }
    }
}
