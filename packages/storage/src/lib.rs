mod mappings;
#[cfg(feature = "test-helpers")]
mod test_instance;
#[cfg(feature = "test-helpers")]
pub use test_instance::*;

mod error;
mod listener;
mod postgres;

use futures::stream::BoxStream;
use ports::{
    storage::{Result, Storage, TxInsertListener},
    types::{Address, DateTime, EthTx, EthTxAttempt, KeyState, NewEthTx, TxState, Utc, Uuid},
};
pub use postgres::{DbConfig, Postgres, TxCallback};

#[async_trait::async_trait]
impl Storage for Postgres {
    async fn insert_unstarted(&self, tx: NewEthTx) -> Result<EthTx> {
        Ok(self._insert_unstarted(tx).await?)
    }

    async fn prune_unstarted(&self, subject: Uuid, keep: u32) -> Result<u64> {
        Ok(self._prune_unstarted(subject, keep).await?)
    }

    async fn next_unstarted(
        &self,
        from_address: Address,
        chain_id: u64,
    ) -> Result<Option<EthTx>> {
        Ok(self._next_unstarted(from_address, chain_id).await?)
    }

    async fn in_progress(&self, from_address: Address) -> Result<Option<(EthTx, EthTxAttempt)>> {
        Ok(self._in_progress(from_address).await?)
    }

    async fn get_next_nonce(&self, address: Address, chain_id: u64) -> Result<i64> {
        Ok(self._get_next_nonce(address, chain_id).await?)
    }

    async fn increment_next_nonce(
        &self,
        address: Address,
        chain_id: u64,
        expected_current: i64,
    ) -> Result<()> {
        Ok(self
            ._increment_next_nonce(address, chain_id, expected_current)
            .await?)
    }

    async fn set_next_nonce(&self, address: Address, chain_id: u64, nonce: i64) -> Result<()> {
        Ok(self._set_next_nonce(address, chain_id, nonce).await?)
    }

    async fn save_in_progress(
        &self,
        etx: &EthTx,
        attempt: &EthTxAttempt,
    ) -> Result<(EthTx, EthTxAttempt)> {
        Ok(self._save_in_progress(etx, attempt).await?)
    }

    async fn save_broadcast(
        &self,
        etx: &EthTx,
        attempt: &EthTxAttempt,
        broadcast_at: DateTime<Utc>,
    ) -> Result<(EthTx, EthTxAttempt)> {
        Ok(self
            ._save_broadcast(etx, attempt, broadcast_at, Vec::new())
            .await?)
    }

    async fn save_replacement_attempt(
        &self,
        old: &EthTxAttempt,
        new: &EthTxAttempt,
    ) -> Result<EthTxAttempt> {
        Ok(self._save_replacement_attempt(old, new).await?)
    }

    async fn save_fatal(&self, etx: &EthTx) -> Result<EthTx> {
        Ok(self._save_fatal(etx).await?)
    }

    async fn count_unconfirmed(&self, from_address: Address, chain_id: u64) -> Result<u64> {
        Ok(self
            ._count_in_state(from_address, chain_id, TxState::Unconfirmed)
            .await?)
    }

    async fn count_unstarted(&self, from_address: Address, chain_id: u64) -> Result<u64> {
        Ok(self
            ._count_in_state(from_address, chain_id, TxState::Unstarted)
            .await?)
    }

    async fn enabled_key_states(&self, chain_id: u64) -> Result<Vec<KeyState>> {
        Ok(self._enabled_key_states(chain_id).await?)
    }

    async fn insert_key_state(&self, address: Address, chain_id: u64) -> Result<KeyState> {
        Ok(self._insert_key_state(address, chain_id).await?)
    }
}

#[async_trait::async_trait]
impl TxInsertListener for Postgres {
    async fn subscribe_to_inserted_txs(&self) -> Result<BoxStream<'static, Result<String>>> {
        Ok(self._subscribe_to_inserted_txs().await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{FutureExt, StreamExt};
    use ports::{
        storage::{Error, Storage, TxInsertListener},
        types::{
            Address, AttemptState, Bytes, EthTx, EthTxAttempt, NewEthTx, TxState, TxType, Utc,
            Uuid, B256, U256,
        },
    };
    use storage as _;

    use crate::{Postgres, PostgresProcess};

    const CHAIN_ID: u64 = 1337;

    fn random_address() -> Address {
        Address::from(rand::random::<[u8; 20]>())
    }

    fn given_new_tx(from: Address) -> NewEthTx {
        given_new_tx_with_value(from, U256::ZERO)
    }

    fn given_new_tx_with_value(from: Address, value: U256) -> NewEthTx {
        NewEthTx {
            from_address: from,
            to_address: random_address(),
            encoded_payload: Bytes::from(vec![1, 2, 3]),
            value,
            gas_limit: 21_000,
            chain_id: CHAIN_ID,
            subject: None,
            pipeline_task_run_id: None,
            simulate: false,
            meta: None,
        }
    }

    fn given_attempt(etx: &EthTx, gas_price: u64) -> EthTxAttempt {
        EthTxAttempt {
            id: 0,
            eth_tx_id: etx.id,
            tx_type: TxType::Legacy,
            gas_price: Some(U256::from(gas_price)),
            gas_tip_cap: None,
            gas_fee_cap: None,
            gas_limit: 21_000,
            signed_raw_tx: vec![0xf8, 0x6b, 0x01],
            hash: B256::from(rand::random::<[u8; 32]>()),
            state: AttemptState::InProgress,
        }
    }

    async fn given_in_progress_tx(
        db: &Postgres,
        from: Address,
        nonce: i64,
    ) -> (EthTx, EthTxAttempt) {
        let mut etx = db.insert_unstarted(given_new_tx(from)).await.unwrap();
        etx.nonce = Some(nonce);
        let attempt = given_attempt(&etx, 100);
        db.save_in_progress(&etx, &attempt).await.unwrap()
    }

    #[tokio::test]
    async fn next_unstarted_orders_by_value_then_age() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();

        let expensive = db
            .insert_unstarted(given_new_tx_with_value(from, U256::from(5)))
            .await
            .unwrap();
        let cheap_old = db
            .insert_unstarted(given_new_tx_with_value(from, U256::from(1)))
            .await
            .unwrap();
        let cheap_new = db
            .insert_unstarted(given_new_tx_with_value(from, U256::from(1)))
            .await
            .unwrap();

        // when
        let next = db.next_unstarted(from, CHAIN_ID).await.unwrap().unwrap();

        // then
        // cheap transactions go first so an unaffordable one cannot block them
        assert_eq!(next.id, cheap_old.id);
        assert_ne!(next.id, cheap_new.id);
        assert_ne!(next.id, expensive.id);
    }

    #[tokio::test]
    async fn next_unstarted_ignores_other_addresses_and_chains() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();

        db.insert_unstarted(given_new_tx(random_address()))
            .await
            .unwrap();
        let mut other_chain = given_new_tx(from);
        other_chain.chain_id = CHAIN_ID + 1;
        db.insert_unstarted(other_chain).await.unwrap();

        // when
        let next = db.next_unstarted(from, CHAIN_ID).await.unwrap();

        // then
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn save_in_progress_assigns_nonce_and_attempt() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();

        // when
        let (etx, attempt) = given_in_progress_tx(&db, from, 3).await;

        // then
        assert_eq!(etx.state, TxState::InProgress);
        assert_eq!(etx.nonce, Some(3));
        assert_eq!(attempt.state, AttemptState::InProgress);
        assert_ne!(attempt.id, 0);

        let (loaded, loaded_attempt) = db.in_progress(from).await.unwrap().unwrap();
        assert_eq!(loaded, etx);
        assert_eq!(loaded_attempt, attempt);
    }

    #[tokio::test]
    async fn save_in_progress_surfaces_pruned_rows_distinctly() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();

        let mut etx = db.insert_unstarted(given_new_tx(from)).await.unwrap();
        etx.nonce = Some(0);
        let attempt = given_attempt(&etx, 100);

        // a queueing strategy pruned the row between read and save
        db.execute(&format!("DELETE FROM eth_txes WHERE id = {}", etx.id))
            .await
            .unwrap();

        // when
        let result = db.save_in_progress(&etx, &attempt).await;

        // then
        assert!(matches!(result, Err(Error::TxRemoved)));
    }

    #[tokio::test]
    async fn in_progress_with_extra_attempts_is_an_invariant_violation() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();

        let (etx, _) = given_in_progress_tx(&db, from, 0).await;

        let zeros32 = "00".repeat(32);
        db.execute(&format!(
            "INSERT INTO eth_tx_attempts \
             (eth_tx_id, tx_type, gas_price, gas_limit, signed_raw_tx, hash, state) \
             VALUES ({}, 0, '\\x{zeros32}', 21000, '\\x00', '\\x{zeros32}', 'broadcast')",
            etx.id
        ))
        .await
        .unwrap();

        // when
        let result = db.in_progress(from).await;

        // then
        assert!(matches!(result, Err(Error::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn save_broadcast_increments_the_nonce_exactly_once() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();
        db.insert_key_state(from, CHAIN_ID).await.unwrap();
        db.set_next_nonce(from, CHAIN_ID, 7).await.unwrap();

        let (etx, attempt) = given_in_progress_tx(&db, from, 7).await;

        // when
        let (etx, attempt) = db.save_broadcast(&etx, &attempt, Utc::now()).await.unwrap();

        // then
        assert_eq!(etx.state, TxState::Unconfirmed);
        assert!(etx.broadcast_at.is_some());
        assert_eq!(attempt.state, AttemptState::Broadcast);
        assert_eq!(db.get_next_nonce(from, CHAIN_ID).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn save_broadcast_detects_externally_modified_nonce() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();
        db.insert_key_state(from, CHAIN_ID).await.unwrap();
        db.set_next_nonce(from, CHAIN_ID, 7).await.unwrap();

        let (etx, attempt) = given_in_progress_tx(&db, from, 7).await;

        // an external wallet used the key in the meantime
        db.set_next_nonce(from, CHAIN_ID, 99).await.unwrap();

        // when
        let result = db.save_broadcast(&etx, &attempt, Utc::now()).await;

        // then
        assert!(matches!(result, Err(Error::InvariantViolation(_))));
        // nothing was committed
        let (etx, attempts) = db.find_tx_with_attempts(etx.id).await.unwrap();
        assert_eq!(etx.state, TxState::InProgress);
        assert_eq!(attempts[0].state, AttemptState::InProgress);
        assert_eq!(db.get_next_nonce(from, CHAIN_ID).await.unwrap(), 99);
    }

    #[tokio::test]
    async fn save_broadcast_runs_callbacks_in_the_same_transaction() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();
        db.insert_key_state(from, CHAIN_ID).await.unwrap();

        let (etx, attempt) = given_in_progress_tx(&db, from, 0).await;

        async fn stamp_meta(
            conn: &mut sqlx::PgConnection,
            etx_id: i64,
        ) -> std::result::Result<(), sqlx::Error> {
            sqlx::query("UPDATE eth_txes SET meta = '{\"callback\": true}' WHERE id = $1")
                .bind(etx_id)
                .execute(conn)
                .await?;
            Ok(())
        }

        let etx_id = etx.id;
        let callback: crate::TxCallback = Box::new(move |conn| stamp_meta(conn, etx_id).boxed());

        // when
        db.save_broadcast_with_callbacks(&etx, &attempt, Utc::now(), vec![callback])
            .await
            .unwrap();

        // then
        let (etx, _) = db.find_tx_with_attempts(etx_id).await.unwrap();
        assert_eq!(etx.meta, Some(serde_json::json!({"callback": true})));
    }

    #[tokio::test]
    async fn failing_callback_rolls_back_the_broadcast() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();
        db.insert_key_state(from, CHAIN_ID).await.unwrap();

        let (etx, attempt) = given_in_progress_tx(&db, from, 0).await;

        let callback: crate::TxCallback = Box::new(|_conn| {
            futures::future::ready(Err::<(), sqlx::Error>(sqlx::Error::RowNotFound)).boxed()
        });

        // when
        let result = db
            .save_broadcast_with_callbacks(&etx, &attempt, Utc::now(), vec![callback])
            .await;

        // then
        assert!(result.is_err());
        let (etx, _) = db.find_tx_with_attempts(etx.id).await.unwrap();
        assert_eq!(etx.state, TxState::InProgress);
        assert_eq!(db.get_next_nonce(from, CHAIN_ID).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn save_replacement_attempt_swaps_the_in_progress_attempt() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();

        let (etx, old_attempt) = given_in_progress_tx(&db, from, 0).await;
        let replacement = given_attempt(&etx, 120);

        // when
        let saved = db
            .save_replacement_attempt(&old_attempt, &replacement)
            .await
            .unwrap();

        // then
        let (etx, attempts) = db.find_tx_with_attempts(etx.id).await.unwrap();
        assert_eq!(etx.state, TxState::InProgress);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].id, saved.id);
        assert_eq!(attempts[0].gas_price, Some(U256::from(120)));
    }

    #[tokio::test]
    async fn save_fatal_clears_nonce_and_deletes_attempts() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();
        db.insert_key_state(from, CHAIN_ID).await.unwrap();
        db.set_next_nonce(from, CHAIN_ID, 5).await.unwrap();

        let (mut etx, _) = given_in_progress_tx(&db, from, 5).await;
        etx.error = Some("tx fee exceeds the configured cap".to_owned());

        // when
        let etx = db.save_fatal(&etx).await.unwrap();

        // then
        assert_eq!(etx.state, TxState::FatalError);
        assert_eq!(etx.nonce, None);
        assert_eq!(
            etx.error.as_deref(),
            Some("tx fee exceeds the configured cap")
        );
        let (_, attempts) = db.find_tx_with_attempts(etx.id).await.unwrap();
        assert!(attempts.is_empty());
        // the nonce was never consumed
        assert_eq!(db.get_next_nonce(from, CHAIN_ID).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn increment_next_nonce_is_conditional() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();
        db.insert_key_state(from, CHAIN_ID).await.unwrap();

        // when
        db.increment_next_nonce(from, CHAIN_ID, 0).await.unwrap();
        let stale = db.increment_next_nonce(from, CHAIN_ID, 0).await;

        // then
        assert_eq!(db.get_next_nonce(from, CHAIN_ID).await.unwrap(), 1);
        assert!(matches!(stale, Err(Error::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn live_rows_cannot_share_a_nonce() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();
        db.insert_key_state(from, CHAIN_ID).await.unwrap();

        let (etx, attempt) = given_in_progress_tx(&db, from, 0).await;
        db.save_broadcast(&etx, &attempt, Utc::now()).await.unwrap();

        // when: a second in_progress row tries to claim the same nonce
        let mut second = db.insert_unstarted(given_new_tx(from)).await.unwrap();
        second.nonce = Some(0);
        let result = db.save_in_progress(&second, &given_attempt(&second, 100)).await;

        // then
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn counts_reflect_transaction_states() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();
        db.insert_key_state(from, CHAIN_ID).await.unwrap();

        db.insert_unstarted(given_new_tx(from)).await.unwrap();
        db.insert_unstarted(given_new_tx(from)).await.unwrap();
        let (etx, attempt) = given_in_progress_tx(&db, from, 0).await;
        db.save_broadcast(&etx, &attempt, Utc::now()).await.unwrap();

        // when
        let unstarted = db.count_unstarted(from, CHAIN_ID).await.unwrap();
        let unconfirmed = db.count_unconfirmed(from, CHAIN_ID).await.unwrap();

        // then
        assert_eq!(unstarted, 2);
        assert_eq!(unconfirmed, 1);
    }

    #[tokio::test]
    async fn prune_unstarted_keeps_only_the_newest_rows() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();
        let subject = Uuid::new_v4();

        let mut ids = Vec::new();
        for _ in 0..4 {
            let mut tx = given_new_tx(from);
            tx.subject = Some(subject);
            ids.push(db.insert_unstarted(tx).await.unwrap().id);
        }

        // when
        let deleted = db.prune_unstarted(subject, 2).await.unwrap();

        // then
        assert_eq!(deleted, 2);
        let remaining: Vec<_> = db.all_txs().await.unwrap().iter().map(|tx| tx.id).collect();
        assert_eq!(remaining, ids[2..].to_vec());
    }

    #[tokio::test]
    async fn notifies_about_inserted_txs() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let from = random_address();

        let mut events = db.subscribe_to_inserted_txs().await.unwrap();

        // when
        db.insert_unstarted(given_new_tx(from)).await.unwrap();

        // then
        let payload = tokio::time::timeout(Duration::from_secs(10), events.next())
            .await
            .expect("should be notified before the timeout")
            .expect("stream should be open")
            .unwrap();
        assert_eq!(payload, hex::encode(from.as_slice()));
    }

    #[tokio::test]
    async fn enabled_key_states_skips_disabled_keys() {
        // given
        let process = PostgresProcess::shared().await.unwrap();
        let db = process.create_random_db().await.unwrap();
        let enabled = random_address();
        let disabled = random_address();
        db.insert_key_state(enabled, CHAIN_ID).await.unwrap();
        db.insert_key_state(disabled, CHAIN_ID).await.unwrap();
        db.execute(&format!(
            "UPDATE eth_key_states SET disabled = true WHERE address = '\\x{}'",
            hex::encode(disabled.as_slice())
        ))
        .await
        .unwrap();

        // when
        let keys = db.enabled_key_states(CHAIN_ID).await.unwrap();

        // then
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].address, enabled);
        assert_eq!(keys[0].next_nonce, 0);
        assert!(!keys[0].disabled);
    }
}
