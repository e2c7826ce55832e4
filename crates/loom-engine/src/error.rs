use loom_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("question is empty")]
    EmptyQuestion,

    #[error("completion callback already attached")]
    CallbackAlreadyAttached,

    #[error("{0}")]
    Internal(String),
}
