pub use alloy::primitives::{Address, Bytes, B256, U256};
pub use chrono::{DateTime, Utc};
pub use futures::Stream;
pub use uuid::Uuid;

mod attempt;
mod eth_tx;
mod key_state;

pub use attempt::*;
pub use eth_tx::*;
pub use key_state::*;
