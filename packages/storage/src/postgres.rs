use ports::types::{Address, AttemptState, DateTime, EthTx, EthTxAttempt, KeyState, TxState, Utc, Uuid};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use super::error::{Error, Result};
use crate::mappings::tables::{
    address_to_db, chain_id_to_db, u256_to_db, EthTxAttemptRow, EthTxRow, KeyStateRow,
};

#[derive(Clone)]
pub struct Postgres {
    connection_pool: sqlx::Pool<sqlx::Postgres>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DbConfig {
    /// The hostname or IP address of the `PostgreSQL` server.
    pub host: String,
    /// The port number on which the `PostgreSQL` server is listening.
    pub port: u16,
    /// The username used to authenticate with the `PostgreSQL` server.
    pub username: String,
    /// The password used to authenticate with the `PostgreSQL` server.
    pub password: String,
    /// The name of the database to connect to on the `PostgreSQL` server.
    pub database: String,
    /// The maximum number of connections allowed in the connection pool.
    pub max_connections: u32,
}

/// Runs a caller-supplied statement inside one of the store's transactions.
pub type TxCallback = Box<
    dyn for<'c> FnOnce(
            &'c mut sqlx::PgConnection,
        ) -> futures::future::BoxFuture<'c, std::result::Result<(), sqlx::Error>>
        + Send,
>;

impl Postgres {
    pub async fn connect(opt: &DbConfig) -> ports::storage::Result<Self> {
        let options = PgConnectOptions::new()
            .username(&opt.username)
            .password(&opt.password)
            .database(&opt.database)
            .host(&opt.host)
            .port(opt.port);

        let connection_pool = PgPoolOptions::new()
            .max_connections(opt.max_connections)
            .connect_with(options)
            .await
            .map_err(crate::error::Error::from)?;

        Ok(Self { connection_pool })
    }

    pub async fn migrate(&self) -> ports::storage::Result<()> {
        sqlx::migrate!()
            .run(&self.connection_pool)
            .await
            .map_err(crate::error::Error::from)?;
        Ok(())
    }

    /// Close only when shutting down the application. Will close the
    /// connection pool even if it is shared.
    pub async fn close(self) {
        self.connection_pool.close().await;
    }

    pub(crate) fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.connection_pool
    }

    #[cfg(feature = "test-helpers")]
    pub fn db_name(&self) -> String {
        self.connection_pool
            .connect_options()
            .get_database()
            .expect("database name to be set")
            .to_owned()
    }

    #[cfg(feature = "test-helpers")]
    pub async fn execute(&self, query: &str) -> ports::storage::Result<()> {
        sqlx::query(query)
            .execute(&self.connection_pool)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    #[cfg(feature = "test-helpers")]
    pub async fn find_tx_with_attempts(
        &self,
        id: i64,
    ) -> ports::storage::Result<(EthTx, Vec<EthTxAttempt>)> {
        let etx_row = sqlx::query_as::<_, EthTxRow>("SELECT * FROM eth_txes WHERE id = $1")
            .bind(id)
            .fetch_one(&self.connection_pool)
            .await
            .map_err(Error::from)?;

        let attempts = sqlx::query_as::<_, EthTxAttemptRow>(
            "SELECT * FROM eth_tx_attempts WHERE eth_tx_id = $1 ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.connection_pool)
        .await
        .map_err(Error::from)?
        .into_iter()
        .map(EthTxAttempt::try_from)
        .collect::<Result<Vec<_>>>()?;

        Ok((EthTx::try_from(etx_row)?, attempts))
    }

    #[cfg(feature = "test-helpers")]
    pub async fn all_txs(&self) -> ports::storage::Result<Vec<EthTx>> {
        Ok(
            sqlx::query_as::<_, EthTxRow>("SELECT * FROM eth_txes ORDER BY id ASC")
                .fetch_all(&self.connection_pool)
                .await
                .map_err(Error::from)?
                .into_iter()
                .map(EthTx::try_from)
                .collect::<Result<Vec<_>>>()?,
        )
    }

    pub(crate) async fn _insert_unstarted(
        &self,
        tx: ports::types::NewEthTx,
    ) -> Result<EthTx> {
        let row = sqlx::query_as::<_, EthTxRow>(
            r#"
            INSERT INTO eth_txes (
                from_address, to_address, encoded_payload, value, gas_limit,
                state, evm_chain_id, subject, pipeline_task_run_id, simulate, meta
            )
            VALUES ($1, $2, $3, $4, $5, 'unstarted', $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(address_to_db(tx.from_address))
        .bind(address_to_db(tx.to_address))
        .bind(tx.encoded_payload.to_vec())
        .bind(u256_to_db(tx.value))
        .bind(i64::try_from(tx.gas_limit).map_err(|_| {
            Error::Conversion(format!("gas_limit {} overflows i64", tx.gas_limit))
        })?)
        .bind(chain_id_to_db(tx.chain_id)?)
        .bind(tx.subject)
        .bind(tx.pipeline_task_run_id)
        .bind(tx.simulate)
        .bind(tx.meta)
        .fetch_one(&self.connection_pool)
        .await?;

        row.try_into()
    }

    pub(crate) async fn _prune_unstarted(&self, subject: Uuid, keep: u32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM eth_txes
            WHERE state = 'unstarted' AND subject = $1 AND id < (
                SELECT min(id) FROM (
                    SELECT id FROM eth_txes
                    WHERE state = 'unstarted' AND subject = $1
                    ORDER BY id DESC
                    LIMIT $2
                ) newest
            )
            "#,
        )
        .bind(subject)
        .bind(i64::from(keep))
        .execute(&self.connection_pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub(crate) async fn _next_unstarted(
        &self,
        from_address: Address,
        chain_id: u64,
    ) -> Result<Option<EthTx>> {
        sqlx::query_as::<_, EthTxRow>(
            r#"
            SELECT * FROM eth_txes
            WHERE from_address = $1 AND state = 'unstarted' AND evm_chain_id = $2
            ORDER BY value ASC, created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(address_to_db(from_address))
        .bind(chain_id_to_db(chain_id)?)
        .fetch_optional(&self.connection_pool)
        .await?
        .map(EthTx::try_from)
        .transpose()
    }

    pub(crate) async fn _in_progress(
        &self,
        from_address: Address,
    ) -> Result<Option<(EthTx, EthTxAttempt)>> {
        let rows = sqlx::query_as::<_, EthTxRow>(
            "SELECT * FROM eth_txes WHERE from_address = $1 AND state = 'in_progress'",
        )
        .bind(address_to_db(from_address))
        .fetch_all(&self.connection_pool)
        .await?;

        if rows.len() > 1 {
            return Err(Error::InvariantViolation(format!(
                "address {from_address} has {} transactions in_progress at once; \
                 the database is in an inconsistent state and this node will not \
                 function correctly until the problem is resolved",
                rows.len()
            )));
        }
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let etx = EthTx::try_from(row)?;

        let attempts = sqlx::query_as::<_, EthTxAttemptRow>(
            "SELECT * FROM eth_tx_attempts WHERE eth_tx_id = $1 ORDER BY id ASC",
        )
        .bind(etx.id)
        .fetch_all(&self.connection_pool)
        .await?
        .into_iter()
        .map(EthTxAttempt::try_from)
        .collect::<Result<Vec<_>>>()?;

        let [attempt] = attempts.as_slice() else {
            return Err(Error::InvariantViolation(format!(
                "expected in_progress transaction {} to have exactly one unsent attempt, found {}; \
                 the database is in an inconsistent state and this node will not \
                 function correctly until the problem is resolved",
                etx.id,
                attempts.len()
            )));
        };
        if attempt.state != AttemptState::InProgress {
            return Err(Error::InvariantViolation(format!(
                "expected the attempt of in_progress transaction {} to be in_progress, it was {}",
                etx.id, attempt.state
            )));
        }

        Ok(Some((etx, attempt.clone())))
    }

    pub(crate) async fn _get_next_nonce(&self, address: Address, chain_id: u64) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT next_nonce FROM eth_key_states WHERE address = $1 AND evm_chain_id = $2",
        )
        .bind(address_to_db(address))
        .bind(chain_id_to_db(chain_id)?)
        .fetch_one(&self.connection_pool)
        .await?)
    }

    pub(crate) async fn _increment_next_nonce(
        &self,
        address: Address,
        chain_id: u64,
        expected_current: i64,
    ) -> Result<()> {
        let mut conn = self.connection_pool.acquire().await?;
        increment_next_nonce(&mut conn, address, chain_id, expected_current).await
    }

    pub(crate) async fn _set_next_nonce(
        &self,
        address: Address,
        chain_id: u64,
        nonce: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE eth_key_states SET next_nonce = $3, updated_at = now() \
             WHERE address = $1 AND evm_chain_id = $2",
        )
        .bind(address_to_db(address))
        .bind(chain_id_to_db(chain_id)?)
        .bind(nonce)
        .execute(&self.connection_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Database(format!(
                "no eth_key_state found for address {address} on chain {chain_id}"
            )));
        }
        Ok(())
    }

    pub(crate) async fn _save_in_progress(
        &self,
        etx: &EthTx,
        attempt: &EthTxAttempt,
    ) -> Result<(EthTx, EthTxAttempt)> {
        if etx.state != TxState::Unstarted {
            return Err(Error::InvariantViolation(format!(
                "can only transition to in_progress from unstarted, transaction is currently {}",
                etx.state
            )));
        }
        if attempt.state != AttemptState::InProgress {
            return Err(Error::InvariantViolation(
                "attempt state must be in_progress".to_owned(),
            ));
        }

        let mut tx = self.connection_pool.begin().await?;

        let attempt_row = insert_attempt(&mut *tx, attempt).await?;

        let etx_row = sqlx::query_as::<_, EthTxRow>(
            "UPDATE eth_txes SET nonce = $1, state = 'in_progress', broadcast_at = $2 \
             WHERE id = $3 RETURNING *",
        )
        .bind(etx.nonce)
        .bind(etx.broadcast_at)
        .bind(etx.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((etx_row.try_into()?, attempt_row.try_into()?))
    }

    pub(crate) async fn _save_broadcast(
        &self,
        etx: &EthTx,
        attempt: &EthTxAttempt,
        broadcast_at: DateTime<Utc>,
        callbacks: Vec<TxCallback>,
    ) -> Result<(EthTx, EthTxAttempt)> {
        if etx.state != TxState::InProgress {
            return Err(Error::InvariantViolation(format!(
                "can only transition to unconfirmed from in_progress, transaction is currently {}",
                etx.state
            )));
        }
        if attempt.state != AttemptState::InProgress {
            return Err(Error::InvariantViolation(
                "attempt must be in in_progress state".to_owned(),
            ));
        }
        let nonce = etx.nonce.ok_or_else(|| {
            Error::InvariantViolation(format!("in_progress transaction {} has no nonce", etx.id))
        })?;

        let mut tx = self.connection_pool.begin().await?;

        increment_next_nonce(&mut *tx, etx.from_address, etx.chain_id, nonce).await?;

        let etx_row = sqlx::query_as::<_, EthTxRow>(
            "UPDATE eth_txes SET state = 'unconfirmed', error = $1, broadcast_at = $2 \
             WHERE id = $3 RETURNING *",
        )
        .bind(etx.error.clone())
        .bind(broadcast_at)
        .bind(etx.id)
        .fetch_one(&mut *tx)
        .await?;

        let attempt_row = sqlx::query_as::<_, EthTxAttemptRow>(
            "UPDATE eth_tx_attempts SET state = 'broadcast' WHERE id = $1 RETURNING *",
        )
        .bind(attempt.id)
        .fetch_one(&mut *tx)
        .await?;

        for callback in callbacks {
            callback(&mut *tx).await?;
        }

        tx.commit().await?;

        Ok((etx_row.try_into()?, attempt_row.try_into()?))
    }

    pub(crate) async fn _save_replacement_attempt(
        &self,
        old: &EthTxAttempt,
        new: &EthTxAttempt,
    ) -> Result<EthTxAttempt> {
        if old.state != AttemptState::InProgress || new.state != AttemptState::InProgress {
            return Err(Error::InvariantViolation(
                "expected both attempts to be in_progress".to_owned(),
            ));
        }
        if old.id == 0 {
            return Err(Error::InvariantViolation(
                "expected the old attempt to have an id".to_owned(),
            ));
        }

        let mut tx = self.connection_pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM eth_tx_attempts WHERE id = $1")
            .bind(old.id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(Error::Database(format!(
                "replaced attempt {} does not exist",
                old.id
            )));
        }

        let attempt_row = insert_attempt(&mut *tx, new).await?;

        tx.commit().await?;

        attempt_row.try_into()
    }

    pub(crate) async fn _save_fatal(&self, etx: &EthTx) -> Result<EthTx> {
        if etx.state != TxState::InProgress {
            return Err(Error::InvariantViolation(format!(
                "can only transition to fatal_error from in_progress, transaction is currently {}",
                etx.state
            )));
        }
        let Some(error) = etx.error.clone() else {
            return Err(Error::InvariantViolation(
                "expected error field to be set".to_owned(),
            ));
        };

        let mut tx = self.connection_pool.begin().await?;

        sqlx::query("DELETE FROM eth_tx_attempts WHERE eth_tx_id = $1")
            .bind(etx.id)
            .execute(&mut *tx)
            .await?;

        let etx_row = sqlx::query_as::<_, EthTxRow>(
            "UPDATE eth_txes SET state = 'fatal_error', error = $1, broadcast_at = NULL, \
             nonce = NULL WHERE id = $2 RETURNING *",
        )
        .bind(error)
        .bind(etx.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        etx_row.try_into()
    }

    pub(crate) async fn _count_in_state(
        &self,
        from_address: Address,
        chain_id: u64,
        state: TxState,
    ) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM eth_txes \
             WHERE from_address = $1 AND evm_chain_id = $2 AND state = $3",
        )
        .bind(address_to_db(from_address))
        .bind(chain_id_to_db(chain_id)?)
        .bind(state.as_str())
        .fetch_one(&self.connection_pool)
        .await?;

        Ok(count as u64)
    }

    pub(crate) async fn _enabled_key_states(&self, chain_id: u64) -> Result<Vec<KeyState>> {
        sqlx::query_as::<_, KeyStateRow>(
            "SELECT * FROM eth_key_states \
             WHERE evm_chain_id = $1 AND disabled = false ORDER BY id ASC",
        )
        .bind(chain_id_to_db(chain_id)?)
        .fetch_all(&self.connection_pool)
        .await?
        .into_iter()
        .map(KeyState::try_from)
        .collect()
    }

    pub(crate) async fn _insert_key_state(
        &self,
        address: Address,
        chain_id: u64,
    ) -> Result<KeyState> {
        let row = sqlx::query_as::<_, KeyStateRow>(
            "INSERT INTO eth_key_states (address, evm_chain_id) VALUES ($1, $2) RETURNING *",
        )
        .bind(address_to_db(address))
        .bind(chain_id_to_db(chain_id)?)
        .fetch_one(&self.connection_pool)
        .await?;

        row.try_into()
    }

    /// Same as the port's `save_broadcast` but runs `callbacks` inside the
    /// commit, for callers that must piggyback on the state transition.
    pub async fn save_broadcast_with_callbacks(
        &self,
        etx: &EthTx,
        attempt: &EthTxAttempt,
        broadcast_at: DateTime<Utc>,
        callbacks: Vec<TxCallback>,
    ) -> ports::storage::Result<(EthTx, EthTxAttempt)> {
        Ok(self
            ._save_broadcast(etx, attempt, broadcast_at, callbacks)
            .await?)
    }
}

async fn insert_attempt(
    conn: &mut sqlx::PgConnection,
    attempt: &EthTxAttempt,
) -> Result<EthTxAttemptRow> {
    sqlx::query_as::<_, EthTxAttemptRow>(
        r#"
        INSERT INTO eth_tx_attempts (
            eth_tx_id, tx_type, gas_price, gas_tip_cap, gas_fee_cap,
            gas_limit, signed_raw_tx, hash, state
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING *
        "#,
    )
    .bind(attempt.eth_tx_id)
    .bind(i16::from(attempt.tx_type.as_u8()))
    .bind(attempt.gas_price.map(u256_to_db))
    .bind(attempt.gas_tip_cap.map(u256_to_db))
    .bind(attempt.gas_fee_cap.map(u256_to_db))
    .bind(i64::try_from(attempt.gas_limit).map_err(|_| {
        Error::Conversion(format!("gas_limit {} overflows i64", attempt.gas_limit))
    })?)
    .bind(attempt.signed_raw_tx.clone())
    .bind(attempt.hash.as_slice().to_vec())
    .bind(attempt.state.as_str())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        // the parent row vanishing between read and save means a queueing
        // strategy pruned it
        if let sqlx::Error::Database(ref db) = e {
            if db.constraint() == Some("eth_tx_attempts_eth_tx_id_fkey") {
                return Error::TxRemoved;
            }
        }
        Error::from(e)
    })
}

async fn increment_next_nonce(
    conn: &mut sqlx::PgConnection,
    address: Address,
    chain_id: u64,
    expected_current: i64,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE eth_key_states SET next_nonce = next_nonce + 1, updated_at = now() \
         WHERE address = $1 AND evm_chain_id = $2 AND next_nonce = $3",
    )
    .bind(address_to_db(address))
    .bind(chain_id_to_db(chain_id)?)
    .bind(expected_current)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::InvariantViolation(
            "could not increment nonce because no rows matched. Either the key is missing \
             or the nonce has been modified by an external process. This is an unrecoverable error"
                .to_owned(),
        ));
    }
    Ok(())
}
