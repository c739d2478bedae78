mod eth_broadcaster;
mod nonce_syncer;
mod strategies;

pub use eth_broadcaster::{
    AttemptBuilder, Config, EthBroadcaster, IN_FLIGHT_TRANSACTION_RECHECK_INTERVAL,
    SIMULATION_TIMEOUT,
};
pub use nonce_syncer::NonceSyncer;
pub use strategies::{
    create_eth_tx, queueing_tx_strategy, DropOldestStrategy, SendEveryStrategy, TxRequest,
    TxStrategy,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Other(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("key store error: {0}")]
    KeyStore(String),
    /// The database holds state the broadcaster can never have produced, or
    /// an external process interfered with it. Requires operator
    /// intervention; retrying will keep failing.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// The sending key cannot afford its next transaction. The address is
    /// blocked until it is funded or the transaction is pruned.
    #[error("insufficient eth: {0}")]
    InsufficientFunds(String),
}

impl From<ports::storage::Error> for Error {
    fn from(error: ports::storage::Error) -> Self {
        match error {
            ports::storage::Error::InvariantViolation(e) => Self::InvariantViolation(e),
            _ => Self::Storage(error.to_string()),
        }
    }
}

impl From<ports::estimator::Error> for Error {
    fn from(error: ports::estimator::Error) -> Self {
        match error {
            ports::estimator::Error::Network(e) => Self::Network(e),
            ports::estimator::Error::Other(e) => Self::Other(e),
        }
    }
}

impl From<ports::keys::Error> for Error {
    fn from(error: ports::keys::Error) -> Self {
        Self::KeyStore(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
