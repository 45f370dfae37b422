use std::fmt;

/// Error taxonomy surfaced by the pool and its collaborators.
///
/// Callers see a small, stable set of causes rather than internal state
/// machine details. `Timeout` is the retryable "pool exhausted" signal;
/// `Internal { fatal: true }` marks conditions the embedding process must
/// not try to recover from (broken bootstrap, non-quiescent shutdown).
#[derive(Debug)]
pub enum PoolError {
    /// Acquisition waited out its ceiling with no context becoming free.
    Timeout,
    /// A named collaborator resource (usually a database) does not exist.
    NotFound(String),
    /// The operation is not permitted in the current server state.
    Forbidden(String),
    /// The pool is shutting down and no longer hands out contexts.
    ShuttingDown,
    /// Bookkeeping or collaborator failure.
    Internal { message: String, fatal: bool },
}

impl PoolError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            fatal: true,
        }
    }

    /// Whether the embedding process should treat this error as unrecoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal { fatal: true, .. })
    }

    /// Whether the caller may simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting for a free execution context"),
            Self::NotFound(name) => write!(f, "not found: {}", name),
            Self::Forbidden(what) => write!(f, "forbidden: {}", what),
            Self::ShuttingDown => write!(f, "pool is shutting down"),
            Self::Internal { message, fatal } => {
                if *fatal {
                    write!(f, "fatal internal error: {}", message)
                } else {
                    write!(f, "internal error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for PoolError {}
