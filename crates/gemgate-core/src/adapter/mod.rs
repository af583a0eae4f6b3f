//! OpenAI <-> Gemini translation.
//!
//! Requests translate eagerly at the gate; responses translate as they
//! stream back (one stateless translator instance per request).

mod request;
mod response;
mod stream;


pub use request::openai_to_gemini;
pub use response::{gemini_to_chat_completion, inline_images, model_list_to_openai};
pub use stream::StreamTranslator;

use gemgate_protocol::gemini::FinishReason;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("unsupported message role: {0}")]
    UnknownRole(String),
    #[error("image_url must be a base64 data URL")]
    UnsupportedImageUrl,
    #[error("messages must not be empty")]
    EmptyMessages,
}

pub(crate) fn map_finish_reason(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::MaxTokens => "length",
        FinishReason::Safety
        | FinishReason::Recitation
        | FinishReason::Blocklist
        | FinishReason::ProhibitedContent
        | FinishReason::Spii
        | FinishReason::ImageSafety => "content_filter",
        FinishReason::Other => "stop",
    }
}

pub(crate) fn markdown_image(mime_type: &str, data: &str) -> String {
    format!("![Generated Image](data:{mime_type};base64,{data})")
}
