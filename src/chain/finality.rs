//! Finality depth defaults for different L1/L2 networks
//!
//! Used when `txm.finality_depth` is left at zero. A block this many heads
//! below the tip is treated as irreversible by the confirmer and reaper.

/// Get recommended finality depth for a chain
pub fn recommended_finality_depth(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 50,
        // Ethereum testnets
        11155111 | 17000 => 50,
        // Polygon mainnet
        137 => 500,
        // Polygon testnets
        80001 | 80002 => 500,
        // Arbitrum
        42161 | 421614 => 50,
        // Optimism
        10 | 11155420 => 200,
        // Base
        8453 | 84532 => 200,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Local dev chains
        1337 | 31337 => 10,
        // Default conservative
        _ => 50,
    }
}

/// Number of heads the tracker keeps for reorg checks
pub fn recommended_history_depth(chain_id: u64) -> u64 {
    recommended_finality_depth(chain_id).max(10) * 2
}
