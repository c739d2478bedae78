use ports::{client::Client, storage::Storage, types::KeyState};
use tracing::info;

use crate::{Error, Result};

/// Reconciles locally tracked nonces with the chain. Used at startup when the
/// node was down long enough for out-of-band transactions to consume nonces;
/// without this every subsequent broadcast would fail with "nonce too low".
///
/// Only ever fast-forwards: a chain nonce behind the local one just means our
/// in-flight transactions have not all been mined yet.
pub struct NonceSyncer<'a, Db, C> {
    db: &'a Db,
    client: &'a C,
}

impl<'a, Db, C> NonceSyncer<'a, Db, C>
where
    Db: Storage,
    C: Client,
{
    pub fn new(db: &'a Db, client: &'a C) -> Self {
        Self { db, client }
    }

    pub async fn sync_all(&self, keys: &[KeyState], chain_id: u64) -> Result<()> {
        for key in keys {
            self.sync(key, chain_id).await?;
        }
        Ok(())
    }

    async fn sync(&self, key: &KeyState, chain_id: u64) -> Result<()> {
        let chain_nonce = self
            .client
            .pending_nonce_at(key.address)
            .await
            .map_err(|e| {
                Error::Network(format!(
                    "failed to fetch the pending nonce for {}: {e}",
                    key.address
                ))
            })?;
        let chain_nonce = i64::try_from(chain_nonce).map_err(|_| {
            Error::Other(format!("pending nonce {chain_nonce} overflows i64"))
        })?;

        let local_nonce = self.db.get_next_nonce(key.address, chain_id).await?;
        if chain_nonce > local_nonce {
            info!(
                address = %key.address,
                local_nonce,
                chain_nonce,
                "local nonce is behind the chain, fast-forwarding"
            );
            self.db
                .set_next_nonce(key.address, chain_id, chain_nonce)
                .await?;
        }
        Ok(())
    }
}
