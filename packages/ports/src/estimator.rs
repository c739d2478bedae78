use crate::types::{Bytes, U256};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// EIP-1559 fee pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicFee {
    pub tip_cap: U256,
    pub fee_cap: U256,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GasOpts {
    /// Bypass any cached estimate and ask the node again. Set when a node
    /// rejected an attempt over its fee and wants it recomputed.
    pub force_refetch: bool,
}

/// Gas pricing policy consumed by the broadcaster. Implementations decide how
/// prices are sourced (fixed, fee history, oracles); the broadcaster only
/// asks, bumps, and retries.
#[cfg_attr(feature = "test-helpers", mockall::automock)]
#[async_trait::async_trait]
pub trait Estimator: Send + Sync {
    /// Returns `(gas_price, gas_limit)` for a legacy attempt.
    async fn get_legacy_gas(
        &self,
        payload: Bytes,
        gas_limit: u64,
        opts: GasOpts,
    ) -> Result<(U256, u64)>;

    /// Returns a strictly higher `(gas_price, gas_limit)` for a rejected
    /// legacy attempt.
    async fn bump_legacy_gas(
        &self,
        current_gas_price: U256,
        gas_limit: u64,
    ) -> Result<(U256, u64)>;

    /// Returns `(fee, gas_limit)` for a dynamic-fee attempt.
    async fn get_dynamic_fee(&self, gas_limit: u64) -> Result<(DynamicFee, u64)>;
}
