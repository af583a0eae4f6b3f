//! The browser-session seam.
//!
//! Rotation only knows how to ask for a rebind; the actual session holder
//! (the agent process, or a fake in tests) sits behind `SessionBinder`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::credentials::CredentialStore;
use crate::link::{AgentLink, LinkError};

const SESSION_ACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no agent connection to rebind")]
    AgentUnavailable,
    #[error("agent rejected session switch: {0}")]
    Rejected(String),
    #[error("timed out waiting for session switch ack")]
    Timeout,
    #[error("unknown credential index {0}")]
    UnknownCredential(u32),
}

#[async_trait]
pub trait SessionBinder: Send + Sync {
    async fn bind(&self, index: u32) -> Result<(), SessionError>;
}

/// Production binder: ships the credential blob over the control channel
/// and waits for the agent's ack.
pub struct SessionManager {
    link: Arc<AgentLink>,
    store: Arc<CredentialStore>,
}

impl SessionManager {
    pub fn new(link: Arc<AgentLink>, store: Arc<CredentialStore>) -> Self {
        Self { link, store }
    }
}

#[async_trait]
impl SessionBinder for SessionManager {
    async fn bind(&self, index: u32) -> Result<(), SessionError> {
        let blob = self
            .store
            .get(index)
            .map_err(|_| SessionError::UnknownCredential(index))?
            .clone();
        let ack = self
            .link
            .begin_session_switch(index, blob)
            .await
            .map_err(|_: LinkError| SessionError::AgentUnavailable)?;
        match tokio::time::timeout(SESSION_ACK_TIMEOUT, ack).await {
            Err(_) => Err(SessionError::Timeout),
            Ok(Err(_)) => Err(SessionError::Rejected("ack channel dropped".to_string())),
            Ok(Ok(Err(message))) => Err(SessionError::Rejected(message)),
            Ok(Ok(Ok(_))) => Ok(()),
        }
    }
}
