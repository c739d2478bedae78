pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("database error: {0}")]
    Database(String),
    #[error("could not convert to/from domain/db type: {0}")]
    Conversion(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("eth_tx removed")]
    TxRemoved,
}

impl From<Error> for ports::storage::Error {
    fn from(value: Error) -> ports::storage::Error {
        match value {
            Error::Database(e) => ports::storage::Error::Database(e),
            Error::Conversion(e) => ports::storage::Error::Conversion(e),
            Error::InvariantViolation(e) => ports::storage::Error::InvariantViolation(e),
            Error::TxRemoved => ports::storage::Error::TxRemoved,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::Database(e.to_string())
    }
}
