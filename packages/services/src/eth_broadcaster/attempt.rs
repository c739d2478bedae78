use alloy::{
    consensus::{SignableTransaction, TxEip1559, TxEnvelope, TxLegacy, TypedTransaction},
    eips::eip2718::Encodable2718,
    primitives::TxKind,
};
use ports::{
    estimator::DynamicFee,
    keys::KeyStore,
    types::{AttemptState, EthTx, EthTxAttempt, TxType, U256},
};

use crate::{Error, Result};

/// Turns a priced transaction into a signed, persistable attempt. One of
/// these lives inside the broadcaster per chain; the fee-bumping confirmer
/// would own its own.
pub struct AttemptBuilder<K> {
    keystore: K,
    chain_id: u64,
    max_gas_price: U256,
}

impl<K: KeyStore> AttemptBuilder<K> {
    pub fn new(keystore: K, chain_id: u64, max_gas_price: U256) -> Self {
        Self {
            keystore,
            chain_id,
            max_gas_price,
        }
    }

    /// A type-0 attempt priced with `gas_price`.
    pub async fn legacy(
        &self,
        etx: &EthTx,
        gas_price: U256,
        gas_limit: u64,
    ) -> Result<EthTxAttempt> {
        if gas_price > self.max_gas_price {
            return Err(Error::Other(format!(
                "specified gas price of {gas_price} would exceed the maximum configured price \
                 of {}",
                self.max_gas_price
            )));
        }

        let tx = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce: assigned_nonce(etx)?,
            gas_price: to_u128(gas_price)?,
            gas_limit,
            to: TxKind::Call(etx.to_address),
            value: etx.value,
            input: etx.encoded_payload.clone(),
        };

        let signature = self
            .keystore
            .sign_tx(
                etx.from_address,
                TypedTransaction::Legacy(tx.clone()),
                self.chain_id,
            )
            .await?;
        let signed = tx.into_signed(signature);
        let hash = *signed.hash();
        let raw = TxEnvelope::Legacy(signed).encoded_2718();

        Ok(EthTxAttempt {
            id: 0,
            eth_tx_id: etx.id,
            tx_type: TxType::Legacy,
            gas_price: Some(gas_price),
            gas_tip_cap: None,
            gas_fee_cap: None,
            gas_limit,
            signed_raw_tx: raw,
            hash,
            state: AttemptState::InProgress,
        })
    }

    /// A type-2 attempt priced with an EIP-1559 fee pair.
    pub async fn dynamic_fee(
        &self,
        etx: &EthTx,
        fee: DynamicFee,
        gas_limit: u64,
    ) -> Result<EthTxAttempt> {
        if fee.fee_cap > self.max_gas_price {
            return Err(Error::Other(format!(
                "specified gas fee cap of {} would exceed the maximum configured price of {}",
                fee.fee_cap, self.max_gas_price
            )));
        }
        if fee.tip_cap > fee.fee_cap {
            return Err(Error::Other(format!(
                "gas tip cap of {} exceeds the gas fee cap of {}",
                fee.tip_cap, fee.fee_cap
            )));
        }

        let tx = TxEip1559 {
            chain_id: self.chain_id,
            nonce: assigned_nonce(etx)?,
            gas_limit,
            max_fee_per_gas: to_u128(fee.fee_cap)?,
            max_priority_fee_per_gas: to_u128(fee.tip_cap)?,
            to: TxKind::Call(etx.to_address),
            value: etx.value,
            access_list: Default::default(),
            input: etx.encoded_payload.clone(),
        };

        let signature = self
            .keystore
            .sign_tx(
                etx.from_address,
                TypedTransaction::Eip1559(tx.clone()),
                self.chain_id,
            )
            .await?;
        let signed = tx.into_signed(signature);
        let hash = *signed.hash();
        let raw = TxEnvelope::Eip1559(signed).encoded_2718();

        Ok(EthTxAttempt {
            id: 0,
            eth_tx_id: etx.id,
            tx_type: TxType::DynamicFee,
            gas_price: None,
            gas_tip_cap: Some(fee.tip_cap),
            gas_fee_cap: Some(fee.fee_cap),
            gas_limit,
            signed_raw_tx: raw,
            hash,
            state: AttemptState::InProgress,
        })
    }
}

fn assigned_nonce(etx: &EthTx) -> Result<u64> {
    etx.nonce
        .and_then(|nonce| u64::try_from(nonce).ok())
        .ok_or_else(|| {
            Error::InvariantViolation(format!("eth_tx {} has no usable nonce assigned", etx.id))
        })
}

fn to_u128(value: U256) -> Result<u128> {
    value
        .try_into()
        .map_err(|_| Error::Other(format!("gas price of {value} overflows u128")))
}
