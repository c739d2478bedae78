use crate::types::{Address, Bytes, U256};

/// Error returned when handing a transaction (or a simulated call) to an eth
/// node.
///
/// `Rpc` means the node itself answered with a JSON-RPC error object, so the
/// message carries one of the (client-dependent) textual shapes classified
/// below. `Transport` covers everything in between us and the node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("eth node returned error (code {code}): {message}")]
    Rpc { code: i64, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, SendError>;

impl SendError {
    /// Whether the node itself produced this error. Used by simulation to
    /// tell a deterministic revert from a flaky connection.
    pub fn is_from_node(&self) -> bool {
        matches!(self, Self::Rpc { .. })
    }

    pub fn kind(&self) -> SendErrorKind {
        match self {
            Self::Rpc { message, .. } => classify(message),
            Self::Transport(_) => SendErrorKind::Transient,
        }
    }
}

/// The dominant classification of a send error. Each kind maps to exactly one
/// recovery action in the broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// The node has already seen a transaction with this or a higher nonce.
    /// Treated as success; the confirmer settles what actually happened.
    NonceTooLow,
    /// A transaction with this nonce is already in the mempool and ours did
    /// not pay enough to replace it. Also treated as success.
    ReplacementUnderpriced,
    /// The node already holds this exact transaction.
    TransactionAlreadyKnown,
    /// Fee below the node's absolute floor; the attempt must be re-priced
    /// before the node will ever accept it.
    TerminallyUnderpriced,
    /// Accepted into the mempool but too weak to propagate. Treated as
    /// success; the confirmer bumps the fee over time.
    TemporarilyUnderpriced,
    /// Chain-specific fee revaluation: the node wants the fee recomputed.
    FeeTooLow,
    FeeTooHigh,
    /// The sender cannot afford gas * price + value.
    InsufficientEth,
    /// The node-side fee cap rejected the attempt outright.
    TooExpensive,
    /// Unfixable: resending can never succeed.
    Fatal,
    /// Anything else; assumed to be a temporary network or node condition.
    Transient,
}

/// Matches the message against the known node error shapes (geth,
/// openethereum, arbitrum, optimism). A raw error may match several shapes;
/// the order of the checks below picks the dominant kind, so do not reorder
/// them casually.
fn classify(message: &str) -> SendErrorKind {
    let msg = message.to_lowercase();
    let matches_any = |shapes: &[&str]| shapes.iter().any(|s| msg.contains(s));

    if matches_any(&["exceeds the configured cap"]) {
        return SendErrorKind::TooExpensive;
    }
    if matches_any(&[
        "invalid sender",
        "invalid signature",
        "invalid chain id",
        "exceeds block gas limit",
        "intrinsic gas too low",
        "negative value",
        "oversized data",
        "gas uint64 overflow",
    ]) {
        return SendErrorKind::Fatal;
    }
    if matches_any(&[
        "nonce too low",
        "transaction nonce is too low",
        "invalid transaction nonce",
    ]) {
        return SendErrorKind::NonceTooLow;
    }
    // must run before the underpriced checks: openethereum's replacement
    // message also complains about the gas price
    if matches_any(&[
        "replacement transaction underpriced",
        "gas price too low to replace",
    ]) {
        return SendErrorKind::ReplacementUnderpriced;
    }
    if matches_any(&["known transaction", "already known"]) {
        return SendErrorKind::TransactionAlreadyKnown;
    }
    if matches_any(&[
        "there are too many transactions in the queue. your transaction was dropped due to limit. try increasing the fee",
    ]) {
        return SendErrorKind::TemporarilyUnderpriced;
    }
    if matches_any(&["transaction underpriced", "transaction gas price is too low"]) {
        return SendErrorKind::TerminallyUnderpriced;
    }
    if matches_any(&["fee too low"]) {
        return SendErrorKind::FeeTooLow;
    }
    if matches_any(&["fee too high"]) {
        return SendErrorKind::FeeTooHigh;
    }
    if matches_any(&[
        "insufficient funds",
        "insufficient balance",
        "insufficient eth",
    ]) {
        return SendErrorKind::InsufficientEth;
    }

    SendErrorKind::Transient
}

/// Parameters of an `eth_call` used to dry-run a transaction before it
/// consumes a nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMsg {
    pub from: Address,
    pub to: Address,
    pub gas: u64,
    pub gas_price: Option<U256>,
    pub value: U256,
    pub data: Bytes,
}

#[cfg_attr(feature = "test-helpers", mockall::automock)]
#[async_trait::async_trait]
pub trait Client: Send + Sync {
    fn chain_id(&self) -> u64;
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<()>;
    async fn call_contract(&self, msg: CallMsg) -> Result<Bytes>;
    async fn pending_nonce_at(&self, address: Address) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(message: &str) -> SendErrorKind {
        SendError::Rpc {
            code: -32000,
            message: message.to_owned(),
        }
        .kind()
    }

    #[test]
    fn classifies_nonce_too_low_shapes() {
        for message in [
            "nonce too low",
            "Transaction nonce is too low. Try incrementing the nonce.",
            "invalid transaction nonce",
        ] {
            assert_eq!(kind_of(message), SendErrorKind::NonceTooLow, "{message}");
        }
    }

    #[test]
    fn classifies_replacement_underpriced_shapes() {
        for message in [
            "replacement transaction underpriced",
            "gas price too low to replace existing transaction",
        ] {
            assert_eq!(
                kind_of(message),
                SendErrorKind::ReplacementUnderpriced,
                "{message}"
            );
        }
    }

    #[test]
    fn replacement_wins_over_terminal_underpriced() {
        // matches both the replacement and the plain underpriced shapes;
        // replacement is the dominant classification
        assert_eq!(
            kind_of("replacement transaction underpriced"),
            SendErrorKind::ReplacementUnderpriced
        );
    }

    #[test]
    fn classifies_already_known() {
        for message in [
            "known transaction: 680bc8c2b1f5e22df8b1d4a9d577d70f9a2ff27a2d77bafdf7d13ed0ff60a2a2",
            "already known",
        ] {
            assert_eq!(
                kind_of(message),
                SendErrorKind::TransactionAlreadyKnown,
                "{message}"
            );
        }
    }

    #[test]
    fn classifies_terminally_underpriced() {
        for message in [
            "transaction underpriced",
            "Transaction gas price is too low. It does not satisfy your node's minimal gas price",
        ] {
            assert_eq!(
                kind_of(message),
                SendErrorKind::TerminallyUnderpriced,
                "{message}"
            );
        }
    }

    #[test]
    fn classifies_temporarily_underpriced() {
        assert_eq!(
            kind_of(
                "There are too many transactions in the queue. Your transaction was dropped due to limit. Try increasing the fee."
            ),
            SendErrorKind::TemporarilyUnderpriced
        );
    }

    #[test]
    fn classifies_fee_revaluations() {
        assert_eq!(
            kind_of("fee too low: 30365610000000, use at least tx.gasLimit = 5874374 and tx.gasPrice = 15000000"),
            SendErrorKind::FeeTooLow
        );
        assert_eq!(
            kind_of("fee too high: 5835750750000000, use less than 467550750000000 * 0.700000"),
            SendErrorKind::FeeTooHigh
        );
    }

    #[test]
    fn classifies_insufficient_eth() {
        for message in [
            "insufficient funds for transfer",
            "insufficient funds for gas * price + value",
            "Insufficient balance for transaction. Balance=100.25, Cost=200.50",
        ] {
            assert_eq!(kind_of(message), SendErrorKind::InsufficientEth, "{message}");
        }
    }

    #[test]
    fn classifies_too_expensive() {
        assert_eq!(
            kind_of("tx fee (1.10 ether) exceeds the configured cap (1.00 ether)"),
            SendErrorKind::TooExpensive
        );
    }

    #[test]
    fn classifies_fatal_shapes() {
        for message in [
            "invalid sender",
            "invalid signature",
            "exceeds block gas limit",
            "intrinsic gas too low",
            "negative value",
            "oversized data",
            "gas uint64 overflow",
        ] {
            assert_eq!(kind_of(message), SendErrorKind::Fatal, "{message}");
        }
    }

    #[test]
    fn unknown_rpc_errors_are_transient() {
        assert_eq!(
            kind_of("some novel error shape nobody has seen before"),
            SendErrorKind::Transient
        );
    }

    #[test]
    fn transport_errors_are_transient_and_not_from_node() {
        let err = SendError::Transport("connection reset by peer".to_owned());
        assert_eq!(err.kind(), SendErrorKind::Transient);
        assert!(!err.is_from_node());
    }

    #[test]
    fn rpc_errors_are_from_node() {
        let err = SendError::Rpc {
            code: 3,
            message: "execution reverted: Ownable: caller is not the owner".to_owned(),
        };
        assert!(err.is_from_node());
    }

    #[test]
    fn classification_ignores_message_casing() {
        assert_eq!(kind_of("NONCE TOO LOW"), SendErrorKind::NonceTooLow);
    }
}
