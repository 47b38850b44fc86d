use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScopeError {
    /// API misuse: double completion, operation after disposal, read-write
    /// scope joining a read-only parent, concurrent access to one scope.
    #[error("usage error: {0}")]
    Usage(String),

    /// Contradictory scope configuration, detected before any handle is
    /// touched.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A save/commit/rollback on an underlying session handle failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ScopeError>;

impl ScopeError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}
