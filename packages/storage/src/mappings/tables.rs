use ports::types::{
    Address, AttemptState, Bytes, DateTime, EthTx, EthTxAttempt, KeyState, TxState, TxType, Utc,
    Uuid, B256, U256,
};

macro_rules! bail {
    ($msg: literal, $($args: expr),*) => {
        return Err($crate::error::Error::Conversion(format!($msg, $($args),*)))
    };
}

pub(crate) fn address_to_db(address: Address) -> Vec<u8> {
    address.as_slice().to_vec()
}

pub(crate) fn address_from_db(bytes: &[u8]) -> Result<Address, crate::error::Error> {
    if bytes.len() != 20 {
        bail!("expected 20 bytes for an address, got {} from db", bytes.len());
    }
    Ok(Address::from_slice(bytes))
}

/// u256 columns are stored as fixed-width big-endian bytes.
pub(crate) fn u256_to_db(value: U256) -> Vec<u8> {
    value.to_be_bytes::<32>().to_vec()
}

pub(crate) fn u256_from_db(bytes: &[u8]) -> Result<U256, crate::error::Error> {
    if bytes.len() != 32 {
        bail!("expected 32 bytes for a u256, got {} from db", bytes.len());
    }
    Ok(U256::from_be_slice(bytes))
}

pub(crate) fn chain_id_to_db(chain_id: u64) -> Result<i64, crate::error::Error> {
    i64::try_from(chain_id)
        .map_err(|_| crate::error::Error::Conversion(format!("chain id {chain_id} overflows i64")))
}

#[derive(sqlx::FromRow)]
pub(crate) struct EthTxRow {
    pub id: i64,
    pub from_address: Vec<u8>,
    pub to_address: Vec<u8>,
    pub encoded_payload: Vec<u8>,
    pub value: Vec<u8>,
    pub gas_limit: i64,
    pub nonce: Option<i64>,
    pub state: String,
    pub error: Option<String>,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub evm_chain_id: i64,
    pub subject: Option<Uuid>,
    pub pipeline_task_run_id: Option<Uuid>,
    pub simulate: bool,
    pub meta: Option<serde_json::Value>,
}

impl TryFrom<EthTxRow> for EthTx {
    type Error = crate::error::Error;

    fn try_from(row: EthTxRow) -> Result<Self, Self::Error> {
        let state: TxState = row
            .state
            .parse()
            .map_err(crate::error::Error::Conversion)?;

        let gas_limit = row.gas_limit.try_into().map_err(|_| {
            crate::error::Error::Conversion(format!(
                "eth_tx({}) has negative gas_limit {}",
                row.id, row.gas_limit
            ))
        })?;

        let chain_id = row.evm_chain_id.try_into().map_err(|_| {
            crate::error::Error::Conversion(format!(
                "eth_tx({}) has negative evm_chain_id {}",
                row.id, row.evm_chain_id
            ))
        })?;

        Ok(Self {
            id: row.id,
            from_address: address_from_db(&row.from_address)?,
            to_address: address_from_db(&row.to_address)?,
            encoded_payload: Bytes::from(row.encoded_payload),
            value: u256_from_db(&row.value)?,
            gas_limit,
            nonce: row.nonce,
            state,
            error: row.error,
            broadcast_at: row.broadcast_at,
            created_at: row.created_at,
            chain_id,
            subject: row.subject,
            pipeline_task_run_id: row.pipeline_task_run_id,
            simulate: row.simulate,
            meta: row.meta,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct EthTxAttemptRow {
    pub id: i64,
    pub eth_tx_id: i64,
    pub tx_type: i16,
    pub gas_price: Option<Vec<u8>>,
    pub gas_tip_cap: Option<Vec<u8>>,
    pub gas_fee_cap: Option<Vec<u8>>,
    pub gas_limit: i64,
    pub signed_raw_tx: Vec<u8>,
    pub hash: Vec<u8>,
    pub state: String,
}

impl TryFrom<EthTxAttemptRow> for EthTxAttempt {
    type Error = crate::error::Error;

    fn try_from(row: EthTxAttemptRow) -> Result<Self, Self::Error> {
        let state: AttemptState = row
            .state
            .parse()
            .map_err(crate::error::Error::Conversion)?;

        let tx_type_byte = u8::try_from(row.tx_type).map_err(|_| {
            crate::error::Error::Conversion(format!(
                "eth_tx_attempt({}) has out-of-range tx_type {}",
                row.id, row.tx_type
            ))
        })?;
        let tx_type =
            TxType::try_from(tx_type_byte).map_err(crate::error::Error::Conversion)?;

        let hash = row.hash.as_slice();
        if hash.len() != 32 {
            bail!(
                "eth_tx_attempt({}) has a hash of {} bytes, expected 32",
                row.id,
                hash.len()
            );
        }

        let gas_limit = row.gas_limit.try_into().map_err(|_| {
            crate::error::Error::Conversion(format!(
                "eth_tx_attempt({}) has negative gas_limit {}",
                row.id, row.gas_limit
            ))
        })?;

        Ok(Self {
            id: row.id,
            eth_tx_id: row.eth_tx_id,
            tx_type,
            gas_price: row.gas_price.as_deref().map(u256_from_db).transpose()?,
            gas_tip_cap: row.gas_tip_cap.as_deref().map(u256_from_db).transpose()?,
            gas_fee_cap: row.gas_fee_cap.as_deref().map(u256_from_db).transpose()?,
            gas_limit,
            signed_raw_tx: row.signed_raw_tx,
            hash: B256::from_slice(hash),
            state,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct KeyStateRow {
    pub address: Vec<u8>,
    pub evm_chain_id: i64,
    pub next_nonce: i64,
    pub disabled: bool,
}

impl TryFrom<KeyStateRow> for KeyState {
    type Error = crate::error::Error;

    fn try_from(row: KeyStateRow) -> Result<Self, Self::Error> {
        let chain_id = row.evm_chain_id.try_into().map_err(|_| {
            crate::error::Error::Conversion(format!(
                "eth_key_state has negative evm_chain_id {}",
                row.evm_chain_id
            ))
        })?;

        Ok(Self {
            address: address_from_db(&row.address)?,
            chain_id,
            next_nonce: row.next_nonce,
            disabled: row.disabled,
        })
    }
}
