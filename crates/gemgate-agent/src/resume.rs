//! Context-concatenation auto-resume.
//!
//! When the upstream cuts a stream short for a safety/prohibited reason,
//! the partial assistant output accumulated so far is appended to the
//! request as a trailing model turn and the request is re-dispatched. The
//! helpers here are pure so the loop in `fetch` stays readable.

use serde_json::Value;

use gemgate_protocol::gemini::{FinishReason, GenerateContentResponse};

/// Outcome of inspecting one upstream SSE data payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Forward the event to the gateway.
    Forward,
    /// Truncated for a resumable reason; suppress the event and re-dispatch.
    ResumeTruncation,
}

/// Accumulate candidate text and classify the event. Undecodable payloads
/// are forwarded untouched.
pub fn scan_event(data: &str, accumulated: &mut String) -> ScanOutcome {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return ScanOutcome::Forward;
    }
    let Ok(response) = serde_json::from_str::<GenerateContentResponse>(data) else {
        return ScanOutcome::Forward;
    };

    let truncated = response
        .primary_finish_reason()
        .is_some_and(FinishReason::is_prohibited);
    if !truncated {
        accumulated.push_str(&response.primary_text());
        return ScanOutcome::Forward;
    }
    // The truncation chunk may still carry a final sliver of text; keep it
    // for the resumed request even though the chunk itself is suppressed.
    accumulated.push_str(&response.primary_text());
    ScanOutcome::ResumeTruncation
}

/// Append the accumulated assistant text to the request body as a model
/// turn, concatenating into an existing trailing model turn when present.
/// Returns None when the body is not a JSON object with a contents array.
pub fn append_model_turn(body: &str, accumulated: &str) -> Option<String> {
    let mut value: Value = serde_json::from_str(body).ok()?;
    let contents = value.get_mut("contents")?.as_array_mut()?;

    let reuse_last = contents
        .last()
        .and_then(|content| content.get("role"))
        .and_then(Value::as_str)
        == Some("model");

    if reuse_last {
        let last = contents.last_mut()?;
        let parts = last.get_mut("parts")?.as_array_mut()?;
        match parts
            .last_mut()
            .and_then(|part| part.get_mut("text"))
            .and_then(|text| text.as_str())
            .map(str::to_string)
        {
            Some(existing) => {
                let parts_len = parts.len();
                parts[parts_len - 1]["text"] = Value::String(format!("{existing}{accumulated}"));
            }
            None => parts.push(serde_json::json!({ "text": accumulated })),
        }
    } else {
        contents.push(serde_json::json!({
            "role": "model",
            "parts": [{ "text": accumulated }]
        }));
    }

    Some(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, finish: Option<&str>) -> String {
        let mut candidate = serde_json::json!({
            "content": { "role": "model", "parts": [{ "text": text }] }
        });
        if let Some(finish) = finish {
            candidate["finishReason"] = Value::String(finish.to_string());
        }
        serde_json::json!({ "candidates": [candidate] }).to_string()
    }

    #[test]
    fn plain_chunks_accumulate_and_forward() {
        let mut acc = String::new();
        assert_eq!(scan_event(&chunk("AAA", None), &mut acc), ScanOutcome::Forward);
        assert_eq!(
            scan_event(&chunk("BBB", Some("STOP")), &mut acc),
            ScanOutcome::Forward
        );
        assert_eq!(acc, "AAABBB");
    }

    #[test]
    fn prohibited_finish_triggers_resume_and_is_suppressed() {
        let mut acc = String::new();
        assert_eq!(
            scan_event(&chunk("partial", Some("PROHIBITED_CONTENT")), &mut acc),
            ScanOutcome::ResumeTruncation
        );
        assert_eq!(acc, "partial");
        assert_eq!(
            scan_event(&chunk("x", Some("SAFETY")), &mut String::new()),
            ScanOutcome::ResumeTruncation
        );
    }

    #[test]
    fn undecodable_payloads_forward_untouched() {
        let mut acc = String::new();
        assert_eq!(scan_event("not json", &mut acc), ScanOutcome::Forward);
        assert_eq!(scan_event("[DONE]", &mut acc), ScanOutcome::Forward);
        assert!(acc.is_empty());
    }

    #[test]
    fn append_creates_new_model_turn() {
        let body = r#"{"contents":[{"role":"user","parts":[{"text":"hi"}]}]}"#;
        let edited = append_model_turn(body, "AAA").unwrap();
        let value: Value = serde_json::from_str(&edited).unwrap();
        let contents = value["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["text"], "AAA");
    }

    #[test]
    fn append_concatenates_into_trailing_model_turn() {
        let body = r#"{"contents":[
            {"role":"user","parts":[{"text":"hi"}]},
            {"role":"model","parts":[{"text":"AAA"}]}
        ]}"#;
        let edited = append_model_turn(body, "BBB").unwrap();
        let value: Value = serde_json::from_str(&edited).unwrap();
        let contents = value["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[1]["parts"][0]["text"], "AAABBB");
    }

    #[test]
    fn append_rejects_bodies_without_contents() {
        assert!(append_model_turn("{}", "x").is_none());
        assert!(append_model_turn("not json", "x").is_none());
    }
}
