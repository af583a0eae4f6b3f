//! Credential discovery and pre-validation.
//!
//! Two sources: `AUTH_JSON_<N>` environment variables (env mode, takes
//! precedence) or `auth-<N>.json` files under the auth directory. Blobs are
//! opaque storage-state snapshots; the store only parses them as JSON and
//! reads the optional top-level `accountName`.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

const ENV_PREFIX: &str = "AUTH_JSON_";
const FILE_PREFIX: &str = "auth-";
const FILE_SUFFIX: &str = ".json";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no valid credentials found")]
    NoneValid,
    #[error("unknown credential index {0}")]
    NotFound(u32),
    #[error("failed to read auth directory {path}: {source}")]
    AuthDir {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Env,
    Files,
}

#[derive(Debug)]
pub struct CredentialStore {
    source: CredentialSource,
    initial: Vec<u32>,
    available: Vec<u32>,
    names: HashMap<u32, String>,
    blobs: HashMap<u32, Value>,
}

impl CredentialStore {
    /// Discover credentials from the process environment, falling back to
    /// the auth directory when no `AUTH_JSON_<N>` variable is present.
    pub fn discover(
        auth_dir: &Path,
        env: impl Iterator<Item = (String, String)>,
    ) -> Result<Self, CredentialError> {
        let mut env_entries: Vec<(u32, String)> = env
            .filter_map(|(key, value)| {
                let index = key.strip_prefix(ENV_PREFIX)?.parse::<u32>().ok()?;
                Some((index, value))
            })
            .collect();

        if !env_entries.is_empty() {
            env_entries.sort_by_key(|(index, _)| *index);
            return Self::build(CredentialSource::Env, env_entries);
        }

        let mut file_entries: Vec<(u32, String)> = Vec::new();
        let dir = std::fs::read_dir(auth_dir).map_err(|source| CredentialError::AuthDir {
            path: auth_dir.display().to_string(),
            source,
        })?;
        for entry in dir.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(index) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
                .and_then(|raw| raw.parse::<u32>().ok())
            else {
                continue;
            };
            match std::fs::read_to_string(entry.path()) {
                Ok(raw) => file_entries.push((index, raw)),
                Err(err) => {
                    tracing::warn!(index, error = %err, "failed to read credential file");
                }
            }
        }
        file_entries.sort_by_key(|(index, _)| *index);
        Self::build(CredentialSource::Files, file_entries)
    }

    fn build(
        source: CredentialSource,
        entries: Vec<(u32, String)>,
    ) -> Result<Self, CredentialError> {
        let mut initial = Vec::new();
        let mut available = Vec::new();
        let mut names = HashMap::new();
        let mut blobs = HashMap::new();

        for (index, raw) in entries {
            initial.push(index);
            match serde_json::from_str::<Value>(&raw) {
                Ok(blob) => {
                    if let Some(name) = blob.get("accountName").and_then(Value::as_str) {
                        names.insert(index, name.to_string());
                    }
                    available.push(index);
                    blobs.insert(index, blob);
                }
                Err(err) => {
                    tracing::warn!(index, error = %err, "credential blob is not valid JSON, skipping");
                }
            }
        }

        if available.is_empty() {
            return Err(CredentialError::NoneValid);
        }
        tracing::info!(
            source = ?source,
            discovered = initial.len(),
            valid = available.len(),
            "credential store ready"
        );
        Ok(Self {
            source,
            initial,
            available,
            names,
            blobs,
        })
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    /// Every discovered index, sorted ascending.
    pub fn initial_indices(&self) -> &[u32] {
        &self.initial
    }

    /// Indices whose blobs parsed as JSON, sorted ascending.
    pub fn available_indices(&self) -> &[u32] {
        &self.available
    }

    pub fn get(&self, index: u32) -> Result<&Value, CredentialError> {
        self.blobs.get(&index).ok_or(CredentialError::NotFound(index))
    }

    pub fn display_name(&self, index: u32) -> Option<&str> {
        self.names.get(&index).map(String::as_str)
    }

    /// The display name or a `#<index>` placeholder for status output.
    pub fn label(&self, index: u32) -> String {
        self.display_name(index)
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{index}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env_pairs(pairs: &[(&str, &str)]) -> impl Iterator<Item = (String, String)> + use<> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn env_mode_takes_precedence_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::discover(
            dir.path(),
            env_pairs(&[
                ("AUTH_JSON_3", r#"{"accountName":"three"}"#),
                ("AUTH_JSON_1", r#"{"cookies":[]}"#),
                ("UNRELATED", "x"),
            ]),
        )
        .unwrap();
        assert_eq!(store.source(), CredentialSource::Env);
        assert_eq!(store.initial_indices(), &[1, 3]);
        assert_eq!(store.available_indices(), &[1, 3]);
        assert_eq!(store.display_name(3), Some("three"));
        assert_eq!(store.label(1), "#1");
    }

    #[test]
    fn invalid_blob_is_excluded_but_discovery_survives() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::discover(
            dir.path(),
            env_pairs(&[
                ("AUTH_JSON_1", "not json"),
                ("AUTH_JSON_2", r#"{"cookies":[]}"#),
            ]),
        )
        .unwrap();
        assert_eq!(store.initial_indices(), &[1, 2]);
        assert_eq!(store.available_indices(), &[2]);
        assert!(matches!(store.get(1), Err(CredentialError::NotFound(1))));
    }

    #[test]
    fn all_invalid_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = CredentialStore::discover(dir.path(), env_pairs(&[("AUTH_JSON_1", "{broken")]))
            .unwrap_err();
        assert!(matches!(err, CredentialError::NoneValid));
    }

    #[test]
    fn file_mode_scans_auth_directory() {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in [
            ("auth-2.json", r#"{"accountName":"second"}"#),
            ("auth-1.json", r#"{"cookies":[]}"#),
            ("auth-bad.json", "{}"),
            ("notes.txt", "ignored"),
        ] {
            let mut file = std::fs::File::create(dir.path().join(name)).unwrap();
            file.write_all(contents.as_bytes()).unwrap();
        }
        let store = CredentialStore::discover(dir.path(), env_pairs(&[])).unwrap();
        assert_eq!(store.source(), CredentialSource::Files);
        assert_eq!(store.available_indices(), &[1, 2]);
        assert_eq!(store.display_name(2), Some("second"));
    }

    #[test]
    fn empty_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = CredentialStore::discover(dir.path(), env_pairs(&[])).unwrap_err();
        assert!(matches!(err, CredentialError::NoneValid));
    }
}
