use super::{Address, Bytes, DateTime, Utc, Uuid, U256};

/// Lifecycle of a queued transaction.
///
/// The broadcaster moves rows `unstarted -> in_progress -> unconfirmed`
/// (or `fatal_error`); the confirmer owns the transitions beyond that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Unstarted,
    InProgress,
    Unconfirmed,
    Confirmed,
    ConfirmedMissingReceipt,
    FatalError,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::InProgress => "in_progress",
            Self::Unconfirmed => "unconfirmed",
            Self::Confirmed => "confirmed",
            Self::ConfirmedMissingReceipt => "confirmed_missing_receipt",
            Self::FatalError => "fatal_error",
        }
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unstarted" => Ok(Self::Unstarted),
            "in_progress" => Ok(Self::InProgress),
            "unconfirmed" => Ok(Self::Unconfirmed),
            "confirmed" => Ok(Self::Confirmed),
            "confirmed_missing_receipt" => Ok(Self::ConfirmedMissingReceipt),
            "fatal_error" => Ok(Self::FatalError),
            other => Err(format!("invalid eth_tx state: {other}")),
        }
    }
}

/// A queued transaction owned by a single sending key.
///
/// Attempts are loaded as a separate owned collection where needed; an
/// `EthTx` never embeds them.
#[derive(Debug, Clone, PartialEq)]
pub struct EthTx {
    pub id: i64,
    pub from_address: Address,
    pub to_address: Address,
    pub encoded_payload: Bytes,
    pub value: U256,
    pub gas_limit: u64,
    /// Assigned by the broadcaster right before the row moves to
    /// `in_progress`; `None` while `unstarted` and after a fatal error.
    pub nonce: Option<i64>,
    pub state: TxState,
    pub error: Option<String>,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub chain_id: u64,
    /// Queueing key used by the drop-oldest insertion strategy.
    pub subject: Option<Uuid>,
    pub pipeline_task_run_id: Option<Uuid>,
    pub simulate: bool,
    pub meta: Option<serde_json::Value>,
}

/// Insert payload for a new `unstarted` transaction. The id, timestamps and
/// state are assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEthTx {
    pub from_address: Address,
    pub to_address: Address,
    pub encoded_payload: Bytes,
    pub value: U256,
    pub gas_limit: u64,
    pub chain_id: u64,
    pub subject: Option<Uuid>,
    pub pipeline_task_run_id: Option<Uuid>,
    pub simulate: bool,
    pub meta: Option<serde_json::Value>,
}
