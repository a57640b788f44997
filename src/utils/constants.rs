use alloy_primitives::{Address, address};

/// Multicall3 is deployed at the same address on most EVM networks.
pub const MULTICALL3: Address = address!("0xcA11bde05977b3631167028862bE2a173976CA11");

/// Approval amount used when a request does not name one.
pub const UNLIMITED_APPROVAL: alloy_primitives::U256 = alloy_primitives::U256::MAX;
