use futures::{stream::BoxStream, StreamExt};
use sqlx::postgres::PgListener;

use crate::postgres::Postgres;

/// Channel the `eth_txes` insert trigger notifies on. The payload is the
/// lowercased hex from-address of the inserted row.
pub(crate) const ETH_TX_INSERT_CHANNEL: &str = "insert_on_eth_tx";

impl Postgres {
    pub(crate) async fn _subscribe_to_inserted_txs(
        &self,
    ) -> crate::error::Result<BoxStream<'static, ports::storage::Result<String>>> {
        let mut listener = PgListener::connect_with(self.pool()).await?;
        listener.listen(ETH_TX_INSERT_CHANNEL).await?;

        let stream = listener
            .into_stream()
            .map(|notification| {
                notification
                    .map(|n| n.payload().to_owned())
                    .map_err(|e| ports::storage::Error::Database(e.to_string()))
            })
            .boxed();

        Ok(stream)
    }
}
