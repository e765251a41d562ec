use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One `chat.completion.chunk` frame.
///
/// `content`, `reasoning_content` and `tool_calls` are serialized even when
/// null; existing clients key off their presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    pub usage: ChunkUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: i64,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
    pub native_finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkUsage {
    pub prompt_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<i64>,
}

pub const CHUNK_MODEL: &str = "sora";

impl CompletionChunk {
    fn base(delta: ChunkDelta, finish_reason: Option<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        let millis = (now.unix_timestamp_nanos() / 1_000_000) as i64;
        let usage = if finish_reason.is_some() {
            ChunkUsage {
                prompt_tokens: 0,
                completion_tokens: Some(1),
                total_tokens: Some(1),
            }
        } else {
            ChunkUsage::default()
        };
        Self {
            id: format!("chatcmpl-{millis}"),
            object: "chat.completion.chunk".to_string(),
            created: now.unix_timestamp(),
            model: CHUNK_MODEL.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.clone(),
                native_finish_reason: finish_reason,
            }],
            usage,
        }
    }

    /// Progress/thinking chunk. `first` additionally carries the role.
    pub fn reasoning(text: impl Into<String>, first: bool) -> Self {
        Self::base(
            ChunkDelta {
                role: first.then(|| "assistant".to_string()),
                content: None,
                reasoning_content: Some(text.into()),
                tool_calls: None,
            },
            None,
        )
    }

    /// Terminal content chunk with `finish_reason: "STOP"`.
    pub fn content(text: impl Into<String>) -> Self {
        Self::base(
            ChunkDelta {
                role: None,
                content: Some(text.into()),
                reasoning_content: None,
                tool_calls: None,
            },
            Some("STOP".to_string()),
        )
    }
}
