pub mod request;
pub mod response;
pub mod stream;

pub use request::{
    ChatCompletionRequest, ChatMessage, ContentPart, ImageUrl, MessageContent, VideoUrl,
};
pub use response::{ChatCompletionChoice, ChatCompletionMessage, ChatCompletionResponse};
pub use stream::{ChunkChoice, ChunkDelta, ChunkUsage, CompletionChunk};
