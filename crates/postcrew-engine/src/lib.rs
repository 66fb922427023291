pub mod error;
pub mod invoker;
pub mod phase;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;
pub mod workflow;

pub use error::EngineError;
pub use invoker::{invoke_bounded, AgentInvoker, LlmAgentInvoker};
pub use phase::Phase;
#[cfg(any(test, feature = "test-util"))]
pub use scripted::{Scripted, ScriptedInvoker};
pub use workflow::{RunContext, RunSummary, Workflow, WorkflowConfig};
