use crate::queue::QueueError;
use crate::rotation::RotationError;

/// Message substring reported by the agent when a fetch was aborted on the
/// client's behalf. Errors carrying it never count toward failure totals.
pub const ABORT_SENTINEL: &str = "user aborted";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("rotating accounts")]
    Draining,
    #[error("system busy")]
    Busy,
    #[error("no agent connection")]
    AgentGone,
    #[error("request queue closed")]
    QueueClosed,
    #[error("timed out waiting for upstream frame")]
    QueueTimeout,
    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("request aborted by client")]
    Aborted,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Rotation(#[from] RotationError),
}

impl GatewayError {
    /// Status code reported to the downstream client.
    pub fn client_status(&self) -> u16 {
        match self {
            Self::Draining | Self::Busy | Self::AgentGone => 503,
            Self::QueueClosed => 500,
            Self::QueueTimeout => 504,
            Self::Upstream { status, .. } => *status,
            Self::Aborted => 499,
            Self::BadRequest(_) => 400,
            Self::Rotation(_) => 503,
        }
    }

    /// True when the failure was initiated by the downstream client and must
    /// not advance the rotation failure counter.
    pub fn is_abort(&self) -> bool {
        match self {
            Self::Aborted => true,
            Self::Upstream { message, .. } => message.contains(ABORT_SENTINEL),
            _ => false,
        }
    }
}

impl From<QueueError> for GatewayError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::Closed => Self::QueueClosed,
            QueueError::Timeout => Self::QueueTimeout,
        }
    }
}
