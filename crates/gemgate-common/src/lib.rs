use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Client-facing streaming behavior when the downstream asks for a stream.
///
/// `Real` passes upstream SSE frames through as they arrive; `Fake` issues a
/// non-streaming upstream call and synthesizes a single-chunk SSE response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamingMode {
    #[serde(rename = "real")]
    Real,
    #[serde(rename = "fake")]
    Fake,
}

impl StreamingMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "real" => Some(Self::Real),
            "fake" => Some(Self::Fake),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Fake => "fake",
        }
    }
}

/// Final, merged gateway configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults (clap applies CLI/ENV precedence per
/// field; the patch overlay applies the rest).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub streaming_mode: StreamingMode,
    /// Consecutive terminal failures before a forced switch. 0 disables.
    pub failure_threshold: u32,
    /// Generative uses before a drain-then-switch. 0 disables.
    pub switch_on_uses: u32,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Upstream statuses that trigger an immediate switch (400..=599 only).
    pub immediate_switch_status_codes: BTreeSet<u16>,
    /// Accepted downstream API keys.
    pub api_keys: Vec<String>,
    /// Credential index to bind at startup; lowest available when unset.
    pub initial_auth_index: Option<u32>,
    /// Directory scanned for auth-<N>.json files (file mode).
    pub auth_dir: String,
    /// Auto-resume re-dispatch budget per request.
    pub resume_limit: u32,
}

/// Optional layer used for merging gateway config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub streaming_mode: Option<StreamingMode>,
    pub failure_threshold: Option<u32>,
    pub switch_on_uses: Option<u32>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub immediate_switch_status_codes: Option<BTreeSet<u16>>,
    pub api_keys: Option<Vec<String>>,
    pub initial_auth_index: Option<u32>,
    pub auth_dir: Option<String>,
    pub resume_limit: Option<u32>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.streaming_mode.is_some() {
            self.streaming_mode = other.streaming_mode;
        }
        if other.failure_threshold.is_some() {
            self.failure_threshold = other.failure_threshold;
        }
        if other.switch_on_uses.is_some() {
            self.switch_on_uses = other.switch_on_uses;
        }
        if other.max_retries.is_some() {
            self.max_retries = other.max_retries;
        }
        if other.retry_delay.is_some() {
            self.retry_delay = other.retry_delay;
        }
        if other.immediate_switch_status_codes.is_some() {
            self.immediate_switch_status_codes = other.immediate_switch_status_codes;
        }
        if other.api_keys.is_some() {
            self.api_keys = other.api_keys;
        }
        if other.initial_auth_index.is_some() {
            self.initial_auth_index = other.initial_auth_index;
        }
        if other.auth_dir.is_some() {
            self.auth_dir = other.auth_dir;
        }
        if other.resume_limit.is_some() {
            self.resume_limit = other.resume_limit;
        }
    }

    pub fn into_config(self) -> GatewayConfig {
        GatewayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(7860),
            streaming_mode: self.streaming_mode.unwrap_or(StreamingMode::Real),
            failure_threshold: self.failure_threshold.unwrap_or(3),
            switch_on_uses: self.switch_on_uses.unwrap_or(0),
            max_retries: self.max_retries.unwrap_or(3),
            retry_delay: self.retry_delay.unwrap_or(Duration::from_millis(2000)),
            immediate_switch_status_codes: self
                .immediate_switch_status_codes
                .unwrap_or_else(|| BTreeSet::from([429, 503])),
            api_keys: self
                .api_keys
                .filter(|keys| !keys.is_empty())
                .unwrap_or_else(|| vec!["123456".to_string()]),
            initial_auth_index: self.initial_auth_index,
            auth_dir: self.auth_dir.unwrap_or_else(|| "auth".to_string()),
            resume_limit: self.resume_limit.unwrap_or(2),
        }
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            streaming_mode: Some(value.streaming_mode),
            failure_threshold: Some(value.failure_threshold),
            switch_on_uses: Some(value.switch_on_uses),
            max_retries: Some(value.max_retries),
            retry_delay: Some(value.retry_delay),
            immediate_switch_status_codes: Some(value.immediate_switch_status_codes),
            api_keys: Some(value.api_keys),
            initial_auth_index: value.initial_auth_index,
            auth_dir: Some(value.auth_dir),
            resume_limit: Some(value.resume_limit),
        }
    }
}

/// Parse `IMMEDIATE_SWITCH_STATUS_CODES`-style csv. Entries outside
/// 400..=599 or non-numeric are dropped with a warning rather than
/// failing startup.
pub fn parse_status_code_csv(raw: &str) -> BTreeSet<u16> {
    let mut out = BTreeSet::new();
    for item in raw.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match item.parse::<u16>() {
            Ok(code) if (400..=599).contains(&code) => {
                out.insert(code);
            }
            _ => {
                tracing::warn!(entry = %item, "ignoring invalid immediate-switch status code");
            }
        }
    }
    out
}

/// Parse `API_KEYS`-style csv, dropping empty entries.
pub fn parse_key_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_layer() {
        let mut base = GatewayConfigPatch {
            port: Some(7000),
            switch_on_uses: Some(5),
            ..Default::default()
        };
        base.overlay(GatewayConfigPatch {
            port: Some(9000),
            ..Default::default()
        });
        let config = base.into_config();
        assert_eq!(config.port, 9000);
        assert_eq!(config.switch_on_uses, 5);
        assert_eq!(config.streaming_mode, StreamingMode::Real);
    }

    #[test]
    fn defaults_include_fallback_api_key() {
        let config = GatewayConfigPatch::default().into_config();
        assert_eq!(config.api_keys, vec!["123456".to_string()]);
        assert!(config.immediate_switch_status_codes.contains(&429));
        assert!(config.immediate_switch_status_codes.contains(&503));
    }

    #[test]
    fn empty_api_keys_fall_back_to_default() {
        let patch = GatewayConfigPatch {
            api_keys: Some(Vec::new()),
            ..Default::default()
        };
        assert_eq!(patch.into_config().api_keys, vec!["123456".to_string()]);
    }

    #[test]
    fn status_csv_drops_out_of_range_entries() {
        let codes = parse_status_code_csv("429, 503,200,abc,,600");
        assert_eq!(codes, BTreeSet::from([429, 503]));
    }

    #[test]
    fn key_csv_trims_and_drops_empties() {
        assert_eq!(
            parse_key_csv(" a ,, b"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn streaming_mode_parse() {
        assert_eq!(StreamingMode::parse("REAL"), Some(StreamingMode::Real));
        assert_eq!(StreamingMode::parse("fake"), Some(StreamingMode::Fake));
        assert_eq!(StreamingMode::parse("buffered"), None);
    }
}
