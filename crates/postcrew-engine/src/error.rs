use postcrew_core::errors::InvocationError;
use postcrew_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Invocation(#[from] InvocationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("run cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}
