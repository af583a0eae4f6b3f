pub mod adapter;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod link;
pub mod queue;
pub mod rotation;
pub mod session;

pub use coordinator::{GatewayBody, GatewayResponse, InboundRequest, OperatorState, RequestCoordinator};
pub use credentials::{CredentialError, CredentialStore};
pub use error::GatewayError;
pub use link::{AgentLink, LinkError, LinkEvent};
pub use queue::{MessageQueue, QueueError, QueueFrame};
pub use rotation::{RotationConfig, RotationController, RotationError, RotationSnapshot, SwitchReason};
pub use session::{SessionBinder, SessionError, SessionManager};
