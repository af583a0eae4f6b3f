//! Session material applied from a storage-state snapshot.
//!
//! The blob is the browser-session export the gateway holds per credential:
//! a Playwright-style object with a `cookies` array (plus origin storage we
//! do not need). The agent reduces it to a Cookie header scoped to the
//! upstream host's eTLD+1.

use serde_json::Value;

const UPSTREAM_DOMAIN: &str = "google.com";

#[derive(Debug, thiserror::Error)]
pub enum SessionApplyError {
    #[error("storage state has no cookies array")]
    MissingCookies,
    #[error("storage state yielded no usable cookies")]
    NoUsableCookies,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub index: u32,
    cookie_header: String,
}

impl Session {
    pub fn from_storage_state(index: u32, storage_state: &Value) -> Result<Self, SessionApplyError> {
        let cookies = storage_state
            .get("cookies")
            .and_then(Value::as_array)
            .ok_or(SessionApplyError::MissingCookies)?;

        let mut pairs: Vec<String> = Vec::new();
        for cookie in cookies {
            let (Some(name), Some(value)) = (
                cookie.get("name").and_then(Value::as_str),
                cookie.get("value").and_then(Value::as_str),
            ) else {
                continue;
            };
            let domain = cookie
                .get("domain")
                .and_then(Value::as_str)
                .unwrap_or(UPSTREAM_DOMAIN);
            if !domain_matches(domain) {
                continue;
            }
            pairs.push(format!("{name}={value}"));
        }

        if pairs.is_empty() {
            return Err(SessionApplyError::NoUsableCookies);
        }
        Ok(Self {
            index,
            cookie_header: pairs.join("; "),
        })
    }

    pub fn cookie_header(&self) -> &str {
        &self.cookie_header
    }
}

fn domain_matches(domain: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    domain == UPSTREAM_DOMAIN
        || domain.ends_with(".google.com")
        || domain == "generativelanguage.googleapis.com"
        || domain.ends_with(".googleapis.com")
}
