pub mod fetch;
pub mod resume;
pub mod runner;
pub mod session;

pub use runner::{AgentConfig, run};
pub use session::Session;
