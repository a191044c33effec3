//! Error taxonomy for the headend. The caller's policy depends on the
//! variant: transient DB/HTTP failures fail the operation and the next
//! tick retries; bad input drops the frame; auth closes the session;
//! fatal config terminates the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("state violation: {0}")]
    StateViolation(String),

    #[error("fatal config: {0}")]
    FatalConfig(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;

impl FleetError {
    /// True when the connection pool is gone for good. A background
    /// loop seeing this asks the process to exit with code 2 instead
    /// of retrying forever.
    pub fn is_irrecoverable_db(&self) -> bool {
        match self {
            FleetError::Db(err) => matches!(err, sqlx::Error::PoolClosed),
            FleetError::Other(err) => err
                .chain()
                .any(|cause| matches!(cause.downcast_ref::<sqlx::Error>(), Some(sqlx::Error::PoolClosed))),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::BadInput(err.to_string())
    }
}
