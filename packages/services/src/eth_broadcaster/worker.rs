use std::time::{Duration, Instant};

use ports::{
    client::{CallMsg, Client, SendError, SendErrorKind},
    estimator::{Estimator, GasOpts},
    keys::KeyStore,
    storage::Storage,
    types::{Address, Bytes, DateTime, EthTx, EthTxAttempt, KeyState, TxState, TxType, Utc, U256},
};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{Inner, IN_FLIGHT_TRANSACTION_RECHECK_INTERVAL, SIMULATION_TIMEOUT};
use crate::{Error, Result};

enum SimulationOutcome {
    Succeeded,
    /// The node evaluated the call and it reverted; sending it would consume
    /// a nonce on a transaction that can never do its job.
    Reverted(SendError),
    Failed(String),
}

impl<Db, C, E, K> Inner<Db, C, E, K>
where
    Db: Storage,
    C: Client,
    E: Estimator,
    K: KeyStore,
{
    /// Per-address worker loop. Drains the queue, then sleeps until either a
    /// wake-up arrives or the fallback poll fires. Errors are logged and the
    /// loop carries on; only cancellation ends it.
    pub(crate) async fn monitor_txs(&self, key: KeyState, mut trigger: mpsc::Receiver<()>) {
        loop {
            let poll_db = tokio::time::sleep(with_jitter(
                self.config.trigger_fallback_db_poll_interval,
            ));
            tokio::pin!(poll_db);

            if let Err(e) = self.process_unstarted_txs(key.address).await {
                error!(address = %key.address, "error processing unstarted eth_txes: {e}");
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = trigger.recv() => {
                    // an eth_tx was inserted
                }
                _ = &mut poll_db => {
                    // fallback db poll timed out
                }
            }
        }
    }

    /// MUST NOT run concurrently for the same address: nonce assignment
    /// depends on this being the sole writer between `unstarted` and
    /// `unconfirmed`. First finishes whatever was left `in_progress` by a
    /// previous run, then keeps picking up unstarted rows until none remain.
    pub(crate) async fn process_unstarted_txs(&self, from_address: Address) -> Result<()> {
        let mark = Instant::now();
        let mut processed = 0u32;
        let result = self.drain_unstarted_txs(from_address, &mut processed).await;
        if processed > 0 {
            debug!(
                address = %from_address,
                n = processed,
                elapsed_ms = mark.elapsed().as_millis() as u64,
                "finished processing unstarted eth_txes"
            );
        }
        result
    }

    async fn drain_unstarted_txs(&self, from_address: Address, processed: &mut u32) -> Result<()> {
        self.handle_any_in_progress_tx(from_address).await?;

        loop {
            if self.config.max_in_flight_transactions > 0 {
                let unconfirmed = self
                    .db
                    .count_unconfirmed(from_address, self.chain_id)
                    .await?;
                if unconfirmed >= u64::from(self.config.max_in_flight_transactions) {
                    let unstarted =
                        self.db.count_unstarted(from_address, self.chain_id).await?;
                    warn!(
                        address = %from_address,
                        unconfirmed,
                        unstarted,
                        max_in_flight = self.config.max_in_flight_transactions,
                        "transaction throttling; waiting for in-flight transactions to confirm \
                         before sending more"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(IN_FLIGHT_TRANSACTION_RECHECK_INTERVAL) => continue,
                    }
                }
            }

            let Some(etx) = self.next_unstarted_tx_with_nonce(from_address).await? else {
                // no more transactions left to process
                return Ok(());
            };
            *processed += 1;

            let attempt = if self.config.eip1559_dynamic_fees {
                let (fee, gas_limit) = self.estimator.get_dynamic_fee(etx.gas_limit).await?;
                self.attempt_builder.dynamic_fee(&etx, fee, gas_limit).await?
            } else {
                let (gas_price, gas_limit) = self
                    .estimator
                    .get_legacy_gas(etx.encoded_payload.clone(), etx.gas_limit, GasOpts::default())
                    .await?;
                self.attempt_builder.legacy(&etx, gas_price, gas_limit).await?
            };

            match self.db.save_in_progress(&etx, &attempt).await {
                Err(ports::storage::Error::TxRemoved) => {
                    debug!(etx_id = etx.id, subject = ?etx.subject, "eth_tx removed");
                    continue;
                }
                Err(e) => return Err(e.into()),
                Ok((etx, attempt)) => {
                    self.handle_in_progress_tx(etx, attempt, self.clock.now())
                        .await?;
                }
            }
        }
    }

    /// Completes the job a previous (crashed) run did not finish. The
    /// transaction may or may not have reached a node already.
    async fn handle_any_in_progress_tx(&self, from_address: Address) -> Result<()> {
        if let Some((etx, attempt)) = self.db.in_progress(from_address).await? {
            let initial_broadcast_at = etx.broadcast_at.unwrap_or(etx.created_at);
            self.handle_in_progress_tx(etx, attempt, initial_broadcast_at)
                .await?;
        }
        Ok(())
    }

    async fn handle_in_progress_tx(
        &self,
        mut etx: EthTx,
        mut attempt: EthTxAttempt,
        initial_broadcast_at: DateTime<Utc>,
    ) -> Result<()> {
        if etx.state != TxState::InProgress {
            return Err(Error::InvariantViolation(format!(
                "expected transaction {} to be in_progress, it was {}",
                etx.id, etx.state
            )));
        }

        loop {
            if etx.simulate {
                match self.simulate_transaction(&etx, &attempt).await {
                    SimulationOutcome::Reverted(err) => {
                        error!(
                            etx_id = etx.id,
                            attempt_hash = %attempt.hash,
                            "transaction reverted during simulation: {err}"
                        );
                        etx.error = Some(format!("transaction reverted during simulation: {err}"));
                        return self.save_fatally_errored(etx).await;
                    }
                    SimulationOutcome::Failed(reason) => {
                        warn!(
                            etx_id = etx.id,
                            attempt_hash = %attempt.hash,
                            "transaction simulation failed, will attempt to send anyway: {reason}"
                        );
                    }
                    SimulationOutcome::Succeeded => {
                        debug!(
                            etx_id = etx.id,
                            attempt_hash = %attempt.hash,
                            "transaction simulation succeeded"
                        );
                    }
                }
            }

            let send_result = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                result = self
                    .client
                    .send_raw_transaction(Bytes::from(attempt.signed_raw_tx.clone())) => result,
            };

            let Err(send_error) = send_result else {
                return self
                    .save_broadcast(etx, attempt, initial_broadcast_at)
                    .await;
            };

            match send_error.kind() {
                SendErrorKind::TooExpensive => {
                    error!(
                        etx_id = etx.id,
                        gas_limit = etx.gas_limit,
                        "transaction fee was rejected by the eth node for being too high; \
                         consider raising the node's fee cap: {send_error}"
                    );
                    etx.error = Some(send_error.to_string());
                    // the attempt never got accepted by a node, throw it away
                    return self.save_fatally_errored(etx).await;
                }
                SendErrorKind::Fatal => {
                    error!(
                        etx_id = etx.id,
                        gas_limit = etx.gas_limit,
                        "fatal error sending transaction: {send_error}"
                    );
                    etx.error = Some(send_error.to_string());
                    return self.save_fatally_errored(etx).await;
                }
                SendErrorKind::NonceTooLow
                | SendErrorKind::ReplacementUnderpriced
                | SendErrorKind::TransactionAlreadyKnown => {
                    // Either a previous run of ours already sent this (crash
                    // recovery, or at-least-once delivery inside the RPC
                    // layer) or an external wallet burned the nonce. In every
                    // one of those cases the right move is to assume success
                    // and let the confirmer settle it with a receipt.
                    return self
                        .save_broadcast(etx, attempt, initial_broadcast_at)
                        .await;
                }
                SendErrorKind::TerminallyUnderpriced => {
                    attempt = self
                        .bump_gas_and_replace_attempt(&etx, &attempt, &send_error)
                        .await?;
                }
                SendErrorKind::FeeTooLow | SendErrorKind::FeeTooHigh => {
                    attempt = self.reestimate_and_replace_attempt(&etx, &attempt).await?;
                }
                SendErrorKind::TemporarilyUnderpriced => {
                    // it cannot even enter the mempool right now; assume
                    // success and let the confirmer bump the fee until it can
                    info!(etx_id = etx.id, "transaction temporarily underpriced: {send_error}");
                    return self
                        .save_broadcast(etx, attempt, initial_broadcast_at)
                        .await;
                }
                SendErrorKind::InsufficientEth => {
                    error!(
                        etx_id = etx.id,
                        attempt_hash = %attempt.hash,
                        "transaction was rejected because the key at address {} cannot afford \
                         it: {send_error}",
                        etx.from_address
                    );
                    // This blocks the whole address. Acceptable when a large
                    // VALUE is unaffordable, since those sort last anyway; a
                    // large gas limit can still starve cheaper transactions
                    // queued behind it.
                    return Err(Error::InsufficientFunds(send_error.to_string()));
                }
                SendErrorKind::Transient => {
                    // likely to affect the next transaction too; bail out and
                    // wait for the next poll
                    return Err(Error::Network(format!(
                        "error while sending transaction {}: {send_error}",
                        etx.id
                    )));
                }
            }
        }
    }

    async fn next_unstarted_tx_with_nonce(&self, from_address: Address) -> Result<Option<EthTx>> {
        let Some(mut etx) = self.db.next_unstarted(from_address, self.chain_id).await? else {
            return Ok(None);
        };

        let nonce = self.db.get_next_nonce(from_address, self.chain_id).await?;
        etx.nonce = Some(nonce);
        Ok(Some(etx))
    }

    async fn save_broadcast(
        &self,
        etx: EthTx,
        attempt: EthTxAttempt,
        broadcast_at: DateTime<Utc>,
    ) -> Result<()> {
        self.db.save_broadcast(&etx, &attempt, broadcast_at).await?;
        self.metrics.txs_broadcast.inc();
        Ok(())
    }

    async fn bump_gas_and_replace_attempt(
        &self,
        etx: &EthTx,
        attempt: &EthTxAttempt,
        send_error: &SendError,
    ) -> Result<EthTxAttempt> {
        if attempt.tx_type == TxType::DynamicFee {
            return Err(Error::Other(
                "bumping gas on initial send is not supported for EIP-1559 transactions"
                    .to_owned(),
            ));
        }
        let current_gas_price = attempt.gas_price.ok_or_else(|| {
            Error::InvariantViolation(format!("legacy attempt {} has no gas price", attempt.id))
        })?;

        let (bumped_gas_price, bumped_gas_limit) = self
            .estimator
            .bump_legacy_gas(current_gas_price, etx.gas_limit)
            .await?;
        error!(
            etx_id = etx.id,
            %current_gas_price,
            %bumped_gas_price,
            max_gas_price = %self.config.max_gas_price_wei,
            "attempt gas price was rejected by the eth node for being too low, bumping and \
             retrying; this is a configuration problem, consider raising the default gas price \
             (currently {}): {send_error}",
            self.config.gas_price_default
        );

        if bumped_gas_price == current_gas_price
            && bumped_gas_price == self.config.max_gas_price_wei
        {
            return Err(Error::Other(
                "hit gas price bump ceiling, will not bump further".to_owned(),
            ));
        }

        self.replace_attempt(etx, attempt, bumped_gas_price, bumped_gas_limit)
            .await
    }

    async fn reestimate_and_replace_attempt(
        &self,
        etx: &EthTx,
        attempt: &EthTxAttempt,
    ) -> Result<EthTxAttempt> {
        let (gas_price, gas_limit) = self
            .estimator
            .get_legacy_gas(
                etx.encoded_payload.clone(),
                etx.gas_limit,
                GasOpts {
                    force_refetch: true,
                },
            )
            .await?;
        debug!(
            etx_id = etx.id,
            %gas_price,
            gas_limit,
            "eth node rejected the transaction over its fee, re-estimated and will try again"
        );
        self.replace_attempt(etx, attempt, gas_price, gas_limit)
            .await
    }

    async fn replace_attempt(
        &self,
        etx: &EthTx,
        old: &EthTxAttempt,
        gas_price: U256,
        gas_limit: u64,
    ) -> Result<EthTxAttempt> {
        let replacement = self.attempt_builder.legacy(etx, gas_price, gas_limit).await?;
        Ok(self.db.save_replacement_attempt(old, &replacement).await?)
    }

    async fn simulate_transaction(
        &self,
        etx: &EthTx,
        attempt: &EthTxAttempt,
    ) -> SimulationOutcome {
        let msg = CallMsg {
            from: etx.from_address,
            to: etx.to_address,
            gas: attempt.gas_limit,
            gas_price: attempt.gas_price,
            value: etx.value,
            data: etx.encoded_payload.clone(),
        };

        match tokio::time::timeout(SIMULATION_TIMEOUT, self.client.call_contract(msg)).await {
            Err(_) => SimulationOutcome::Failed(format!(
                "simulation did not finish within {SIMULATION_TIMEOUT:?}"
            )),
            Ok(Ok(_)) => SimulationOutcome::Succeeded,
            Ok(Err(e)) if e.is_from_node() => SimulationOutcome::Reverted(e),
            Ok(Err(e)) => SimulationOutcome::Failed(e.to_string()),
        }
    }

    async fn save_fatally_errored(&self, etx: EthTx) -> Result<()> {
        if let (Some(task_run_id), Some(resumer)) =
            (etx.pipeline_task_run_id, self.resumer.as_ref())
        {
            // Deliberately not inside the save_fatal transaction. A crash in
            // between leaves the tx in_progress with an errored pipeline; on
            // restart the tx is re-handled and may even succeed, leaving the
            // pipeline and the tx outcome in disagreement. Benign, but real.
            let message = format!(
                "fatal error while sending transaction: {}",
                etx.error.as_deref().unwrap_or("unknown error")
            );
            match resumer.resume(task_run_id, Err(message)).await {
                Err(ports::pipeline::Error::NotFound) => {
                    debug!(etx_id = etx.id, "callback missing or already resumed");
                }
                Err(e) => return Err(Error::Other(format!("failed to resume pipeline: {e}"))),
                Ok(()) => {}
            }
        }

        self.db.save_fatal(&etx).await?;
        self.metrics.fatally_errored_txs.inc();
        Ok(())
    }
}

fn with_jitter(interval: Duration) -> Duration {
    interval.mul_f64(rand::thread_rng().gen_range(0.9..1.1))
}
