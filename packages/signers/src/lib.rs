use std::collections::HashMap;

use alloy::{
    consensus::{SignableTransaction, Transaction, TypedTransaction},
    primitives::Signature,
    signers::{local::PrivateKeySigner, SignerSync},
};
use async_trait::async_trait;
use ports::{
    keys::{Error, KeyStore, Result},
    types::Address,
};

/// Keystore over in-memory secp256k1 keys. Suitable for tests and for
/// deployments where key custody is handled outside the process; remote
/// custody (KMS and friends) plugs in behind the same [`KeyStore`] port.
#[derive(Clone, Default)]
pub struct LocalKeyStore {
    signers: HashMap<Address, PrivateKeySigner>,
}

impl LocalKeyStore {
    pub fn new(keys: impl IntoIterator<Item = PrivateKeySigner>) -> Self {
        Self {
            signers: keys.into_iter().map(|k| (k.address(), k)).collect(),
        }
    }

    /// A keystore holding one freshly generated key; returns its address.
    pub fn single_random_key() -> (Self, Address) {
        let signer = PrivateKeySigner::random();
        let address = signer.address();
        (Self::new([signer]), address)
    }

    pub fn add_key(&mut self, signer: PrivateKeySigner) -> Address {
        let address = signer.address();
        self.signers.insert(address, signer);
        address
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.signers.keys().copied().collect()
    }
}

#[async_trait]
impl KeyStore for LocalKeyStore {
    async fn sign_tx(
        &self,
        from: Address,
        tx: TypedTransaction,
        chain_id: u64,
    ) -> Result<Signature> {
        let signer = self.signers.get(&from).ok_or(Error::KeyNotFound(from))?;

        if tx.chain_id() != Some(chain_id) {
            return Err(Error::Signing(format!(
                "transaction chain id {:?} does not match expected chain id {chain_id}",
                tx.chain_id()
            )));
        }

        signer
            .sign_hash_sync(&tx.signature_hash())
            .map_err(|e| Error::Signing(e.to_string()))
    }
}
