use async_trait::async_trait;
use ports::{
    storage::Storage,
    types::{Address, Bytes, EthTx, NewEthTx, Uuid, U256},
};
use tracing::debug;

use crate::Result;

/// A queueing policy paired with every new transaction at insert time. It
/// decides the queueing key, whether the transaction gets a pre-broadcast
/// simulation, and how the queue is bounded.
#[async_trait]
pub trait TxStrategy: Send + Sync {
    /// Opaque key grouping transactions into one queue, if any.
    fn subject(&self) -> Option<Uuid>;

    /// Whether the transaction should be dry-run before consuming a nonce.
    fn simulate(&self) -> bool;

    /// Removes queued transactions exceeding the policy's bounds. Returns how
    /// many were deleted.
    async fn prune_queue(&self, storage: &dyn Storage) -> Result<u64>;
}

/// Sends every transaction; the queue is unbounded.
pub struct SendEveryStrategy;

#[async_trait]
impl TxStrategy for SendEveryStrategy {
    fn subject(&self) -> Option<Uuid> {
        None
    }

    fn simulate(&self) -> bool {
        false
    }

    async fn prune_queue(&self, _storage: &dyn Storage) -> Result<u64> {
        Ok(0)
    }
}

/// Keeps the `queue_size` newest unstarted transactions for the subject and
/// drops the rest. The queue is per subject, not per sending key.
#[derive(Debug, Clone, Copy)]
pub struct DropOldestStrategy {
    subject: Uuid,
    queue_size: u32,
    simulate: bool,
}

impl DropOldestStrategy {
    pub fn new(subject: Uuid, queue_size: u32, simulate: bool) -> Self {
        Self {
            subject,
            queue_size,
            simulate,
        }
    }
}

#[async_trait]
impl TxStrategy for DropOldestStrategy {
    fn subject(&self) -> Option<Uuid> {
        Some(self.subject)
    }

    fn simulate(&self) -> bool {
        self.simulate
    }

    async fn prune_queue(&self, storage: &dyn Storage) -> Result<u64> {
        Ok(storage
            .prune_unstarted(self.subject, self.queue_size)
            .await?)
    }
}

/// The strategy used for job-spawned transactions: drop-oldest keyed by the
/// job id, with a per-job queue depth.
pub fn queueing_tx_strategy(job_id: Uuid, queue_size: u32, simulate: bool) -> DropOldestStrategy {
    DropOldestStrategy::new(job_id, queue_size, simulate)
}

/// What a producer wants broadcast. The strategy contributes the subject and
/// the simulate flag on top.
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub from_address: Address,
    pub to_address: Address,
    pub encoded_payload: Bytes,
    pub value: U256,
    pub gas_limit: u64,
    pub chain_id: u64,
    pub pipeline_task_run_id: Option<Uuid>,
    pub meta: Option<serde_json::Value>,
}

/// The insertion contract for producers: persists the transaction as
/// `unstarted` (which also notifies the broadcaster) and immediately applies
/// the strategy's queue bound.
pub async fn create_eth_tx<Db: Storage>(
    db: &Db,
    request: TxRequest,
    strategy: &dyn TxStrategy,
) -> Result<EthTx> {
    let etx = db
        .insert_unstarted(NewEthTx {
            from_address: request.from_address,
            to_address: request.to_address,
            encoded_payload: request.encoded_payload,
            value: request.value,
            gas_limit: request.gas_limit,
            chain_id: request.chain_id,
            subject: strategy.subject(),
            pipeline_task_run_id: request.pipeline_task_run_id,
            simulate: strategy.simulate(),
            meta: request.meta,
        })
        .await?;

    let pruned = strategy.prune_queue(db).await?;
    if pruned > 0 {
        debug!(
            pruned,
            subject = ?strategy.subject(),
            "dropped the oldest queued transactions over the queue cap"
        );
    }

    Ok(etx)
}
