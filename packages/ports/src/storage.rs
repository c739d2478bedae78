use std::sync::Arc;

use futures::stream::BoxStream;

use crate::types::{Address, DateTime, EthTx, EthTxAttempt, KeyState, NewEthTx, Utc, Uuid};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(String),
    #[error("could not convert to/from domain/db type: {0}")]
    Conversion(String),
    /// The database is in a state the broadcaster can never have produced.
    /// Unrecoverable without operator intervention.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// The transaction was pruned (drop-oldest) between being read and being
    /// saved. Callers skip to the next row.
    #[error("eth_tx removed")]
    TxRemoved,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Durable store for queued transactions, their attempts and per-key nonce
/// bookkeeping. Every multi-row operation is a single database transaction.
#[async_trait::async_trait]
#[impl_tools::autoimpl(for<T: trait> &T, &mut T, Arc<T>, Box<T>)]
pub trait Storage: Send + Sync {
    /// Inserts a new `unstarted` transaction. The insert fires the
    /// `insert_on_eth_tx` notification.
    async fn insert_unstarted(&self, tx: NewEthTx) -> Result<EthTx>;

    /// Deletes all `unstarted` rows for `subject` except the `keep` newest
    /// ones (by id). Returns how many were deleted.
    async fn prune_unstarted(&self, subject: Uuid, keep: u32) -> Result<u64>;

    /// The earliest `unstarted` row for the address on the chain, ordered by
    /// `value ASC, created_at ASC, id ASC`. Low-value transactions go first
    /// so one unaffordable transaction cannot starve cheaper ones forever.
    async fn next_unstarted(&self, from_address: Address, chain_id: u64)
        -> Result<Option<EthTx>>;

    /// The unique `in_progress` row for the address together with its single
    /// `in_progress` attempt. Anything else on disk is an
    /// [`Error::InvariantViolation`].
    async fn in_progress(&self, from_address: Address) -> Result<Option<(EthTx, EthTxAttempt)>>;

    async fn get_next_nonce(&self, address: Address, chain_id: u64) -> Result<i64>;

    /// Conditional increment: succeeds only while the stored value still
    /// equals `expected_current`. Zero affected rows means the key vanished
    /// or an external process moved the nonce, which is unrecoverable.
    async fn increment_next_nonce(
        &self,
        address: Address,
        chain_id: u64,
        expected_current: i64,
    ) -> Result<()>;

    async fn set_next_nonce(&self, address: Address, chain_id: u64, nonce: i64) -> Result<()>;

    /// Atomically persists the attempt and moves the transaction to
    /// `in_progress` with its assigned nonce. Returns [`Error::TxRemoved`]
    /// when the row was pruned in the meantime.
    async fn save_in_progress(
        &self,
        etx: &EthTx,
        attempt: &EthTxAttempt,
    ) -> Result<(EthTx, EthTxAttempt)>;

    /// Atomically: conditional nonce increment, transaction to
    /// `unconfirmed`, attempt to `broadcast`.
    async fn save_broadcast(
        &self,
        etx: &EthTx,
        attempt: &EthTxAttempt,
        broadcast_at: DateTime<Utc>,
    ) -> Result<(EthTx, EthTxAttempt)>;

    /// Atomically swaps the single `in_progress` attempt for a re-priced one,
    /// leaving the transaction untouched.
    async fn save_replacement_attempt(
        &self,
        old: &EthTxAttempt,
        new: &EthTxAttempt,
    ) -> Result<EthTxAttempt>;

    /// Clears the nonce, deletes all attempts and records the error with
    /// state `fatal_error`. The nonce becomes reusable.
    async fn save_fatal(&self, etx: &EthTx) -> Result<EthTx>;

    async fn count_unconfirmed(&self, from_address: Address, chain_id: u64) -> Result<u64>;
    async fn count_unstarted(&self, from_address: Address, chain_id: u64) -> Result<u64>;

    async fn enabled_key_states(&self, chain_id: u64) -> Result<Vec<KeyState>>;
    async fn insert_key_state(&self, address: Address, chain_id: u64) -> Result<KeyState>;
}

/// Push channel for new `unstarted` inserts. Each item is the lowercased hex
/// from-address of the inserted row. Delivery is best effort; consumers must
/// pair it with a fallback poll.
#[async_trait::async_trait]
pub trait TxInsertListener: Send + Sync {
    async fn subscribe_to_inserted_txs(&self) -> Result<BoxStream<'static, Result<String>>>;
}
