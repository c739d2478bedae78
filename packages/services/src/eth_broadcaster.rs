mod attempt;
mod worker;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

pub use attempt::AttemptBuilder;
use futures::{stream::BoxStream, StreamExt};
use metrics::{
    prometheus::{core::Collector, IntCounter, Opts},
    RegistersMetrics,
};
use ports::{
    client::Client,
    clock::Clock,
    estimator::Estimator,
    keys::KeyStore,
    pipeline::PipelineResumer,
    storage::{Storage, TxInsertListener},
    types::{Address, KeyState, U256},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, NonceSyncer, Result};

/// How often a throttled worker rechecks the unconfirmed queue to see whether
/// it may send again.
pub const IN_FLIGHT_TRANSACTION_RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Hard deadline on the pre-broadcast `eth_call` dry run. Must stay short:
/// simulation adds latency to every broadcast.
pub const SIMULATION_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// Reconcile locally tracked nonces with the chain at startup.
    pub nonce_auto_sync: bool,
    /// Cap on broadcast-but-unconfirmed transactions per key. Zero disables
    /// the throttle.
    pub max_in_flight_transactions: u32,
    /// Upper bound on how stale a missed insert notification can leave a
    /// worker.
    #[serde(deserialize_with = "human_readable_duration")]
    pub trigger_fallback_db_poll_interval: Duration,
    /// Produce EIP-1559 attempts instead of legacy ones.
    pub eip1559_dynamic_fees: bool,
    pub gas_price_default: U256,
    pub max_gas_price_wei: U256,
}

fn human_readable_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let duration_str: String = serde::Deserialize::deserialize(deserializer)?;
    humantime::parse_duration(&duration_str).map_err(|e| {
        let msg = format!("Failed to parse duration '{duration_str}': {e}");
        serde::de::Error::custom(msg)
    })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nonce_auto_sync: false,
            max_in_flight_transactions: 16,
            trigger_fallback_db_poll_interval: Duration::from_secs(30),
            eip1559_dynamic_fees: false,
            gas_price_default: U256::from(20_000_000_000u64),
            max_gas_price_wei: U256::from(5_000_000_000_000u64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Unstarted,
    Starting,
    Started,
    StartFailed,
    Stopped,
}

/// Watches `eth_txes` for transactions that need to be broadcast, assigns
/// nonces and ensures that at least one eth node has accepted each one.
///
/// This does not guarantee delivery: transactions can still be evicted from
/// the mempool or the node can vanish afterwards. Eventual inclusion is the
/// confirmer's job. What is guaranteed is a gap-free series of increasing
/// nonces per key, the transition of every row out of `unstarted` into
/// `unconfirmed` or `fatal_error`, and a persisted attempt for everything
/// broadcast.
pub struct EthBroadcaster<Db, C, E, K> {
    inner: Arc<Inner<Db, C, E, K>>,
    receivers: Mutex<Option<HashMap<Address, mpsc::Receiver<()>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    state: Mutex<LifecycleState>,
}

pub(crate) struct Inner<Db, C, E, K> {
    pub(crate) db: Db,
    pub(crate) client: C,
    pub(crate) estimator: E,
    pub(crate) attempt_builder: AttemptBuilder<K>,
    pub(crate) config: Config,
    pub(crate) chain_id: u64,
    pub(crate) key_states: Vec<KeyState>,
    /// Populated once at construction and read-only afterwards. Each key has
    /// its own wake-up channel so other tasks can force an early rescan.
    pub(crate) triggers: HashMap<Address, mpsc::Sender<()>>,
    pub(crate) resumer: Option<Arc<dyn PipelineResumer>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) cancel: CancellationToken,
    pub(crate) metrics: Metrics,
}

impl<Db, C, E, K> EthBroadcaster<Db, C, E, K>
where
    Db: Storage + TxInsertListener + Send + Sync + 'static,
    C: Client + 'static,
    E: Estimator + 'static,
    K: KeyStore + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Db,
        client: C,
        estimator: E,
        keystore: K,
        config: Config,
        key_states: Vec<KeyState>,
        clock: Arc<dyn Clock>,
        resumer: Option<Arc<dyn PipelineResumer>>,
    ) -> Self {
        let chain_id = client.chain_id();

        let mut triggers = HashMap::new();
        let mut receivers = HashMap::new();
        for key in &key_states {
            let (sender, receiver) = mpsc::channel(1);
            triggers.insert(key.address, sender);
            receivers.insert(key.address, receiver);
        }

        let attempt_builder = AttemptBuilder::new(keystore, chain_id, config.max_gas_price_wei);

        Self {
            inner: Arc::new(Inner {
                db,
                client,
                estimator,
                attempt_builder,
                config,
                chain_id,
                key_states,
                triggers,
                resumer,
                clock,
                cancel: CancellationToken::new(),
                metrics: Metrics::default(),
            }),
            receivers: Mutex::new(Some(receivers)),
            handles: Mutex::new(Vec::new()),
            state: Mutex::new(LifecycleState::Unstarted),
        }
    }

    /// Subscribes to insert notifications, optionally syncs nonces with the
    /// chain, then launches one worker task per key plus the notification
    /// dispatch task. Fails loudly unless this is the first start.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("lifecycle lock poisoned");
            if *state != LifecycleState::Unstarted {
                return Err(Error::Other(format!(
                    "cannot start EthBroadcaster: state is {state:?}"
                )));
            }
            *state = LifecycleState::Starting;
        }

        match self.startup().await {
            Ok(handles) => {
                *self.handles.lock().expect("handles lock poisoned") = handles;
                *self.state.lock().expect("lifecycle lock poisoned") = LifecycleState::Started;
                Ok(())
            }
            Err(e) => {
                *self.state.lock().expect("lifecycle lock poisoned") = LifecycleState::StartFailed;
                Err(e)
            }
        }
    }

    async fn startup(&self) -> Result<Vec<JoinHandle<()>>> {
        let events = self
            .inner
            .db
            .subscribe_to_inserted_txs()
            .await
            .map_err(|e| Error::Storage(format!("could not subscribe to eth_tx inserts: {e}")))?;

        if self.inner.config.nonce_auto_sync {
            let syncer = NonceSyncer::new(&self.inner.db, &self.inner.client);
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(Vec::new()),
                result = syncer.sync_all(&self.inner.key_states, self.inner.chain_id) => {
                    result.map_err(|e| Error::Other(format!("failed to sync with on-chain nonces: {e}")))?
                }
            }
        }

        let mut receivers = self
            .receivers
            .lock()
            .expect("receivers lock poisoned")
            .take()
            .ok_or_else(|| {
                Error::Other("wake-up channels were already handed to workers".to_owned())
            })?;

        let mut handles = Vec::with_capacity(self.inner.key_states.len() + 1);
        for key in &self.inner.key_states {
            let receiver = receivers.remove(&key.address).ok_or_else(|| {
                Error::Other(format!("no wake-up channel for address {}", key.address))
            })?;
            let inner = Arc::clone(&self.inner);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                inner.monitor_txs(key, receiver).await;
            }));
        }

        let inner = Arc::clone(&self.inner);
        handles.push(tokio::spawn(async move {
            inner.dispatch_insert_events(events).await;
        }));

        Ok(handles)
    }

    /// Stops all workers and waits for them. Fails loudly unless currently
    /// started.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("lifecycle lock poisoned");
            if *state != LifecycleState::Started {
                return Err(Error::Other(format!(
                    "cannot close EthBroadcaster: state is {state:?}"
                )));
            }
            *state = LifecycleState::Stopped;
        }

        self.inner.cancel.cancel();

        let handles = std::mem::take(&mut *self.handles.lock().expect("handles lock poisoned"));
        for handle in handles {
            handle
                .await
                .map_err(|e| Error::Other(format!("broadcaster task panicked: {e}")))?;
        }
        Ok(())
    }

    /// Forces the worker for `address` to rescan the database before the next
    /// poll interval. Does nothing when not running or when the address was
    /// not registered at startup.
    pub fn trigger(&self, address: Address) {
        let started =
            *self.state.lock().expect("lifecycle lock poisoned") == LifecycleState::Started;
        if !started {
            debug!(%address, "not started; ignoring trigger");
            return;
        }
        self.inner.wake_up_address(address);
    }

    /// Drains this key's queue once. Exposed so tests (and embedders doing
    /// their own scheduling) can drive a worker deterministically; must not
    /// run concurrently with a running worker for the same address.
    pub async fn process_unstarted_txs(&self, key: &KeyState) -> Result<()> {
        self.inner.process_unstarted_txs(key.address).await
    }
}

impl<Db, C, E, K> Inner<Db, C, E, K> {
    /// Single background task translating insert notifications into worker
    /// wake-ups. Payloads are hex from-addresses; unknown or garbled ones are
    /// dropped.
    pub(crate) async fn dispatch_insert_events(
        &self,
        mut events: BoxStream<'static, ports::storage::Result<String>>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = events.next() => match event {
                    None => {
                        debug!("eth_tx insert stream closed, exiting dispatch loop");
                        return;
                    }
                    Some(Err(e)) => {
                        warn!("eth_tx insert stream produced an error: {e}");
                    }
                    Some(Ok(payload)) => {
                        match parse_address_payload(&payload) {
                            Some(address) => self.wake_up_address(address),
                            None => warn!(
                                payload = %payload,
                                "ignoring malformed eth_tx insert notification"
                            ),
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn wake_up_address(&self, address: Address) {
        if let Some(sender) = self.triggers.get(&address) {
            // a full buffer means the worker is already about to run
            let _ = sender.try_send(());
        }
    }
}

fn parse_address_payload(payload: &str) -> Option<Address> {
    let bytes = hex::decode(payload.trim_start_matches("0x")).ok()?;
    (bytes.len() == 20).then(|| Address::from_slice(&bytes))
}

#[derive(Clone)]
pub(crate) struct Metrics {
    pub(crate) txs_broadcast: IntCounter,
    pub(crate) fatally_errored_txs: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        let txs_broadcast = IntCounter::with_opts(Opts::new(
            "eth_broadcaster_txs_broadcast",
            "Number of transactions successfully handed off to an eth node.",
        ))
        .expect("txs_broadcast metric to be correctly configured");

        let fatally_errored_txs = IntCounter::with_opts(Opts::new(
            "eth_broadcaster_fatally_errored_txs",
            "Number of transactions given up on due to unfixable errors.",
        ))
        .expect("fatally_errored_txs metric to be correctly configured");

        Self {
            txs_broadcast,
            fatally_errored_txs,
        }
    }
}

impl<Db, C, E, K> RegistersMetrics for EthBroadcaster<Db, C, E, K> {
    fn metrics(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.inner.metrics.txs_broadcast.clone()),
            Box::new(self.inner.metrics.fatally_errored_txs.clone()),
        ]
    }
}
