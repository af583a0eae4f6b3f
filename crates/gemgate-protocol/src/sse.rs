//! Incremental server-sent-events parsing.
//!
//! The agent feeds decoded upstream text through this to observe complete
//! `data:` payloads across chunk boundaries (auto-resume needs to inspect
//! every event before deciding whether to forward it).

use bytes::Bytes;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    pending: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.pending.push_str(chunk);
        let mut out = Vec::new();

        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            self.consume_line(line.trim_end_matches(['\n', '\r']), &mut out);
        }

        out
    }

    /// Flush a trailing event that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.consume_line(line.trim_end_matches('\r'), &mut out);
        }
        self.flush_event(&mut out);
        out
    }

    fn consume_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.flush_event(out);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = field_value(line, "event") {
            self.event = (!value.is_empty()).then(|| value.to_string());
            return;
        }
        if let Some(value) = field_value(line, "data") {
            self.data_lines.push(value.to_string());
        }
    }

    fn flush_event(&mut self, out: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        out.push(SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    if line == field {
        return Some("");
    }
    line.strip_prefix(field)?
        .strip_prefix(':')
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
}
