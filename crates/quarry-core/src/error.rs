use thiserror::Error;

/// Canonical result for the optimizer.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors are fatal to the optimizer call; nothing is recovered
/// internally. `OverBudget` may carry a best-so-far plan at the call site.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("over budget: {0}")]
    OverBudget(String),

    #[error("internal invariant failed: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
