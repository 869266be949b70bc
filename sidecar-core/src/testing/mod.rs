//! Test support shared by unit and integration tests
//!
//! - `MockConnector`: programmable upstream (subscribe counting, pushed
//!   notifications, dropped transports, scripted call results)

pub mod mock_upstream;

pub use mock_upstream::MockConnector;

use crate::core::types::ChannelKey;

/// A valid base58 address for channel keys in tests
pub const TEST_ADDR: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

/// Second valid address
pub const TEST_ADDR_2: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";

/// `logs:<TEST_ADDR>`
pub fn logs_key() -> ChannelKey {
    ChannelKey::parse(&format!("logs:{}", TEST_ADDR)).unwrap_or_else(|e| panic!("{}", e))
}

/// `account:<TEST_ADDR_2>`
pub fn account_key() -> ChannelKey {
    ChannelKey::parse(&format!("account:{}", TEST_ADDR_2)).unwrap_or_else(|e| panic!("{}", e))
}
