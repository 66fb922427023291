#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod openai;
pub mod reliable;
pub mod tavily;

#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockCompletion, MockReply, MockSearch};
pub use openai::OpenAiCompletion;
pub use reliable::{Reliable, ReliableConfig};
pub use tavily::TavilySearch;
