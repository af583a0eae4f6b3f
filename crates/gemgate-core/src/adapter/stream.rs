use gemgate_protocol::gemini::GenerateContentResponse;
use gemgate_protocol::openai::{ChatCompletionChunk, ChunkChoice, Delta};

use super::response::unix_now;
use super::{map_finish_reason, markdown_image};

/// Translates Gemini SSE data payloads into OpenAI chat chunks for one
/// request. The chunk id/model/created stay stable across the stream.
#[derive(Debug)]
pub struct StreamTranslator {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
}

impl StreamTranslator {
    pub fn new(request_id: &str, model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{request_id}"),
            model: model.to_string(),
            created: unix_now(),
            role_sent: false,
        }
    }

    /// One SSE data payload in, at most one OpenAI chunk out. Returns None
    /// for `[DONE]`, undecodable payloads, and empty deltas.
    pub fn translate_data(&mut self, data: &str) -> Option<ChatCompletionChunk> {
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return None;
        }
        let response: GenerateContentResponse = match serde_json::from_str(data) {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(error = %err, "skipping undecodable upstream stream payload");
                return None;
            }
        };

        if let Some(feedback) = &response.prompt_feedback
            && let Some(reason) = feedback.block_reason
        {
            let mut delta = Delta::default();
            delta.push_content(&format!(
                "\n\n[Response blocked by upstream: {reason:?}]"
            ));
            return Some(self.chunk(delta, Some("stop".to_string())));
        }

        let mut delta = Delta::default();
        let mut finish_reason = None;

        if let Some(candidate) = response.candidates.first() {
            for part in &candidate.content.parts {
                if let Some(blob) = &part.inline_data {
                    delta.push_content(&markdown_image(&blob.mime_type, &blob.data));
                    continue;
                }
                let Some(text) = &part.text else { continue };
                if part.is_thought() {
                    delta.push_reasoning(text);
                } else {
                    delta.push_content(text);
                }
            }
            finish_reason = candidate
                .finish_reason
                .map(|reason| map_finish_reason(reason).to_string());
        }

        if delta.is_empty() && finish_reason.is_none() {
            return None;
        }
        Some(self.chunk(delta, finish_reason))
    }

    fn chunk(&mut self, mut delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
        if !self.role_sent {
            self.role_sent = true;
            delta.role = Some("assistant".to_string());
        }
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}
