use super::{B256, U256};

/// Wire format of the signed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxType {
    Legacy,
    DynamicFee,
}

impl TxType {
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Legacy => 0x0,
            Self::DynamicFee => 0x2,
        }
    }
}

impl TryFrom<u8> for TxType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Legacy),
            0x2 => Ok(Self::DynamicFee),
            other => Err(format!("invalid attempt tx_type: {other:#x}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    InProgress,
    Broadcast,
    /// Set by the confirmer when the sender could not afford the attempt.
    InsufficientEth,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Broadcast => "broadcast",
            Self::InsufficientEth => "insufficient_eth",
        }
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AttemptState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "broadcast" => Ok(Self::Broadcast),
            "insufficient_eth" => Ok(Self::InsufficientEth),
            other => Err(format!("invalid attempt state: {other}")),
        }
    }
}

/// A signed candidate broadcast of one `EthTx`. Several attempts may exist
/// over a transaction's lifetime (fee bumps, re-estimations), but only one is
/// `in_progress` at a time. Holds the parent only by id.
#[derive(Debug, Clone, PartialEq)]
pub struct EthTxAttempt {
    /// Zero until persisted; the store assigns the real id.
    pub id: i64,
    pub eth_tx_id: i64,
    pub tx_type: TxType,
    /// Set for legacy attempts.
    pub gas_price: Option<U256>,
    /// Set for dynamic-fee attempts.
    pub gas_tip_cap: Option<U256>,
    pub gas_fee_cap: Option<U256>,
    pub gas_limit: u64,
    pub signed_raw_tx: Vec<u8>,
    pub hash: B256,
    pub state: AttemptState,
}
