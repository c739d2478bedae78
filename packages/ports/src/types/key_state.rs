use super::Address;

/// Per-key bookkeeping. `(address, chain_id)` is the identity; `next_nonce`
/// only ever moves through the store's conditional increment or the startup
/// nonce sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyState {
    pub address: Address,
    pub chain_id: u64,
    pub next_nonce: i64,
    pub disabled: bool,
}
