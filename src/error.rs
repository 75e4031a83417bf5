use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Function not found: {name}")]
    FunctionNotFound { name: String },

    #[error("Bad arguments: function={name}, {message}")]
    BadArguments { name: String, message: String },

    #[error("Function execution error: function={name}, {message}")]
    FunctionExecution { name: String, message: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index not found: {identifier}")]
    IndexNotFound { identifier: String },

    #[error("Index corrupted: {identifier}, {message}")]
    IndexCorrupted { identifier: String, message: String },

    #[error("Vocabulary load failed: {path}, {message}")]
    VocabularyLoad { path: String, message: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ChatError {
    /// Whether this error came from a cancelled request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
