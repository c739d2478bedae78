use alloy::{consensus::TypedTransaction, primitives::Signature};

use crate::types::Address;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no key found for address {0}")]
    KeyNotFound(Address),
    #[error("signing failed: {0}")]
    Signing(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Signing capability. Key material never crosses this boundary; callers hand
/// over an unsigned transaction and get the signature back.
#[cfg_attr(feature = "test-helpers", mockall::automock)]
#[async_trait::async_trait]
pub trait KeyStore: Send + Sync {
    async fn sign_tx(
        &self,
        from: Address,
        tx: TypedTransaction,
        chain_id: u64,
    ) -> Result<Signature>;
}
