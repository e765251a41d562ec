use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Base64 image attachment (gateway extension).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Base64 video or plain URL (gateway extension, character flow).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    /// Sora share id for the remix flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remix_target_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

/// Message content in either the plain-string or the multimodal array form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    VideoUrl { video_url: VideoUrl },
    /// Parts this gateway has no use for (audio, refusal, ...) are kept
    /// opaque rather than rejected.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoUrl {
    pub url: String,
}

impl MessageContent {
    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => {
                let mut out = String::new();
                for part in parts {
                    if let ContentPart::Text { text } = part {
                        if !out.is_empty() {
                            out.push(' ');
                        }
                        out.push_str(text);
                    }
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_content_deserializes() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"gpt-image","messages":[{"role":"user","content":"cat astronaut"}],"stream":true}"#,
        )
        .unwrap();
        assert_eq!(req.messages[0].content.text(), "cat astronaut");
        assert!(req.stream);
    }

    #[test]
    fn multimodal_content_deserializes() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{
                "model": "sora2-landscape-10s",
                "messages": [{"role": "user", "content": [
                    {"type": "text", "text": "a rainy street"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}},
                    {"type": "video_url", "video_url": {"url": "https://example.com/a.mp4"}}
                ]}]
            }"#,
        )
        .unwrap();
        let MessageContent::Parts(parts) = &req.messages[0].content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(req.messages[0].content.text(), "a rainy street");
    }

    #[test]
    fn unknown_part_kind_is_tolerated() {
        let content: MessageContent = serde_json::from_str(
            r#"[{"type":"input_audio","input_audio":{"data":"x"}},{"type":"text","text":"hi"}]"#,
        )
        .unwrap();
        assert_eq!(content.text(), "hi");
    }
}
