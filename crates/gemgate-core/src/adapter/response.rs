use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use gemgate_protocol::gemini::{GenerateContentResponse, ListModelsResponse};
use gemgate_protocol::openai::{ChatCompletion, Choice, ModelEntry, ModelList, ResponseMessage};

use super::{map_finish_reason, markdown_image};

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Assemble a buffered Gemini response into a single `chat.completion`.
pub fn gemini_to_chat_completion(
    response: &GenerateContentResponse,
    request_id: &str,
    model: &str,
) -> ChatCompletion {
    let mut content = String::new();
    let mut reasoning = String::new();

    if let Some(candidate) = response.candidates.first() {
        for part in &candidate.content.parts {
            if let Some(blob) = &part.inline_data {
                content.push_str(&markdown_image(&blob.mime_type, &blob.data));
                continue;
            }
            let Some(text) = &part.text else { continue };
            if part.is_thought() {
                reasoning.push_str(text);
            } else {
                content.push_str(text);
            }
        }
    }

    let finish_reason = response
        .primary_finish_reason()
        .map(|reason| map_finish_reason(reason).to_string());

    ChatCompletion {
        id: format!("chatcmpl-{request_id}"),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: Some(content),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
            },
            finish_reason,
        }],
    }
}

/// Translate a Gemini model listing into the OpenAI list shape.
pub fn model_list_to_openai(list: &ListModelsResponse) -> ModelList {
    ModelList {
        object: "list".to_string(),
        data: list
            .models
            .iter()
            .map(|model| ModelEntry {
                id: model
                    .name
                    .strip_prefix("models/")
                    .unwrap_or(&model.name)
                    .to_string(),
                object: "model".to_string(),
                owned_by: "google".to_string(),
                created: None,
            })
            .collect(),
    }
}

/// Replace `candidates[0].content.parts[i].inlineData` with a Markdown
/// image text part, in place. Returns true when anything was replaced so
/// the caller re-serializes only if needed.
pub fn inline_images(value: &mut Value) -> bool {
    let Some(parts) = value
        .get_mut("candidates")
        .and_then(|c| c.get_mut(0))
        .and_then(|c| c.get_mut("content"))
        .and_then(|c| c.get_mut("parts"))
        .and_then(Value::as_array_mut)
    else {
        return false;
    };

    let mut replaced = false;
    for part in parts {
        let Some(inline) = part.get("inlineData") else {
            continue;
        };
        let (Some(mime_type), Some(data)) = (
            inline.get("mimeType").and_then(Value::as_str),
            inline.get("data").and_then(Value::as_str),
        ) else {
            continue;
        };
        *part = serde_json::json!({ "text": markdown_image(mime_type, data) });
        replaced = true;
    }
    replaced
}
