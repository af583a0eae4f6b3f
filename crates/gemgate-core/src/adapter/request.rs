use gemgate_protocol::gemini::{
    Blob, Content, GenerateContentRequestBody, GenerationConfig, HarmBlockThreshold, HarmCategory,
    Part, SafetySetting, ThinkingConfig,
};
use gemgate_protocol::openai::{ChatCompletionRequestBody, ContentPart, MessageContent};

use super::AdapterError;

/// Translate an OpenAI chat-completions body into a Gemini
/// generateContent body. `include_thoughts` reflects the operator's
/// reasoning toggle.
pub fn openai_to_gemini(
    body: &ChatCompletionRequestBody,
    include_thoughts: bool,
) -> Result<GenerateContentRequestBody, AdapterError> {
    if body.messages.is_empty() {
        return Err(AdapterError::EmptyMessages);
    }

    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();

    for message in &body.messages {
        match message.role.as_str() {
            "system" => system_texts.push(flatten_text(&message.content)),
            "user" => contents.push(Content::user(content_parts(&message.content)?)),
            "assistant" => contents.push(Content::model(content_parts(&message.content)?)),
            other => return Err(AdapterError::UnknownRole(other.to_string())),
        }
    }

    let system_instruction = (!system_texts.is_empty()).then(|| Content {
        parts: vec![Part::text(system_texts.join("\n"))],
        role: None,
    });

    let generation_config = build_generation_config(body, include_thoughts);

    Ok(GenerateContentRequestBody {
        contents,
        system_instruction,
        generation_config,
        safety_settings: Some(block_none_safety_settings()),
        extra: Default::default(),
    })
}

fn flatten_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn content_parts(content: &MessageContent) -> Result<Vec<Part>, AdapterError> {
    match content {
        MessageContent::Text(text) => Ok(vec![Part::text(text.clone())]),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => Ok(Part::text(text.clone())),
                ContentPart::ImageUrl { image_url } => {
                    let blob = parse_data_url(&image_url.url)
                        .ok_or(AdapterError::UnsupportedImageUrl)?;
                    Ok(Part {
                        inline_data: Some(blob),
                        ..Default::default()
                    })
                }
            })
            .collect(),
    }
}

fn parse_data_url(url: &str) -> Option<Blob> {
    let rest = url.strip_prefix("data:")?;
    let (mime_type, data) = rest.split_once(";base64,")?;
    if mime_type.is_empty() || data.is_empty() {
        return None;
    }
    Some(Blob {
        mime_type: mime_type.to_string(),
        data: data.to_string(),
    })
}

fn build_generation_config(
    body: &ChatCompletionRequestBody,
    include_thoughts: bool,
) -> Option<GenerationConfig> {
    let mut config = GenerationConfig {
        temperature: body.temperature,
        top_p: body.top_p,
        top_k: body.top_k,
        max_output_tokens: body.max_tokens,
        stop_sequences: body.stop.clone().map(|stop| stop.into_vec()),
        thinking_config: include_thoughts.then_some(ThinkingConfig {
            include_thoughts: true,
        }),
        ..Default::default()
    };
    if config == GenerationConfig::default() {
        return None;
    }
    if config.stop_sequences.as_ref().is_some_and(Vec::is_empty) {
        config.stop_sequences = None;
    }
    Some(config)
}

fn block_none_safety_settings() -> Vec<SafetySetting> {
    [
        HarmCategory::Harassment,
        HarmCategory::HateSpeech,
        HarmCategory::SexuallyExplicit,
        HarmCategory::DangerousContent,
    ]
    .into_iter()
    .map(|category| SafetySetting {
        category,
        threshold: HarmBlockThreshold::BlockNone,
    })
    .collect()
}
