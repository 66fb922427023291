pub mod agents;
pub mod bridge;
pub mod broker;
pub mod client;
pub mod emitter;
pub mod handlers;
pub mod orchestrator;
pub mod protocol;
pub mod server;
pub mod subscriptions;

pub use orchestrator::{OrchestratorError, RunOrchestrator, RunState};
pub use server::{start, ServerConfig, ServerDeps, ServerHandle};
