//! Fee estimation and bump arithmetic for legacy and EIP-1559 chains

use super::models::Fee;
use crate::chain::ChainClient;
use crate::config::{FeeConfig, FeeEstimatorMode};
use crate::error::{TxmError, TxmResult};

use ethers::types::U256;
use std::sync::Arc;
use tracing::{debug, warn};

const BUMP_KNOB: &str = "txm.fee.bump_percent or txm.fee.bump_min_wei";

/// Produces initial fees and bumped replacements
pub struct FeeEstimator {
    client: Arc<dyn ChainClient>,
    config: FeeConfig,
    eip1559: bool,
}

impl FeeEstimator {
    pub fn new(client: Arc<dyn ChainClient>, config: FeeConfig, eip1559: bool) -> Self {
        Self {
            client,
            config,
            eip1559,
        }
    }

    pub fn config(&self) -> &FeeConfig {
        &self.config
    }

    /// Fee for a first attempt
    pub async fn initial_fee(&self) -> TxmResult<Fee> {
        let max = U256::from(self.config.price_max_wei);

        if !self.eip1559 {
            let gas_price = match self.config.mode {
                FeeEstimatorMode::Fixed => U256::from(self.config.price_default_wei),
                FeeEstimatorMode::Suggested => match self.client.gas_price().await {
                    Ok(price) => clamp(price, U256::from(self.config.price_min_wei), max),
                    Err(e) => {
                        warn!("Gas price suggestion failed, using default: {}", e);
                        U256::from(self.config.price_default_wei)
                    }
                },
            };
            return Ok(Fee::Legacy { gas_price });
        }

        let tip_cap = clamp(
            U256::from(self.config.tip_cap_default_wei),
            U256::from(self.config.tip_cap_min_wei),
            max,
        );
        let base_fee = match self.client.latest_header().await {
            Ok(header) => header.base_fee_per_gas,
            Err(e) => {
                warn!("Failed to read base fee, using max price as fee cap: {}", e);
                None
            }
        };
        let fee_cap = match base_fee {
            Some(base_fee) => base_fee.saturating_mul(U256::from(2)).saturating_add(tip_cap),
            None => max,
        }
        .min(max)
        .max(tip_cap);

        debug!("Initial dynamic fee: tip {} cap {} (base fee {:?})", tip_cap, fee_cap, base_fee);
        Ok(Fee::Dynamic { tip_cap, fee_cap })
    }

    /// Strictly higher replacement for `previous`
    pub fn bump(&self, previous: &Fee) -> TxmResult<Fee> {
        match previous {
            Fee::Legacy { gas_price } => Ok(Fee::Legacy {
                gas_price: bump_legacy_gas_price(&self.config, *gas_price)?,
            }),
            Fee::Dynamic { tip_cap, fee_cap } => {
                let (tip_cap, fee_cap) = bump_dynamic_fee(&self.config, *tip_cap, *fee_cap)?;
                Ok(Fee::Dynamic { tip_cap, fee_cap })
            }
        }
    }

    /// Gas limit actually sent, after the configured multiplier
    pub fn chain_specific_gas_limit(&self, fee_limit: u64) -> u64 {
        (fee_limit as f64 * self.config.limit_multiplier) as u64
    }
}

fn clamp(value: U256, min: U256, max: U256) -> U256 {
    value.max(min).min(max)
}

/// `max(old * (100 + percent) / 100, old + min)`, rejecting settings that cannot grow `old`
fn bumped_value(config: &FeeConfig, old: U256) -> TxmResult<U256> {
    if config.bump_percent == 0 && config.bump_min_wei == 0 {
        return Err(TxmError::FeeBumpConfig {
            knob: BUMP_KNOB.to_string(),
            message: "bump percent and bump min are both zero".to_string(),
        });
    }

    let by_percent = old
        .saturating_mul(U256::from(100 + config.bump_percent))
        / U256::from(100);
    let by_min = old.saturating_add(U256::from(config.bump_min_wei));
    let bumped = by_percent.max(by_min);

    if bumped <= old {
        return Err(TxmError::FeeBumpConfig {
            knob: BUMP_KNOB.to_string(),
            message: format!("bumping {} yields {}, which is not higher", old, bumped),
        });
    }
    Ok(bumped)
}

pub fn bump_legacy_gas_price(config: &FeeConfig, old: U256) -> TxmResult<U256> {
    let max = U256::from(config.price_max_wei);
    let bumped = bumped_value(config, old)?;
    let capped = bumped.min(max);
    if capped <= old {
        return Err(TxmError::FeeBumpExceedsLimit {
            bumped: bumped.to_string(),
            max: max.to_string(),
        });
    }
    Ok(capped)
}

/// Bumps the tip and moves the fee cap by the same amount, keeping the margin over base fee
pub fn bump_dynamic_fee(config: &FeeConfig, tip_cap: U256, fee_cap: U256) -> TxmResult<(U256, U256)> {
    let max = U256::from(config.price_max_wei);
    let bumped_tip = bumped_value(config, tip_cap)?;
    let margin = fee_cap.saturating_sub(tip_cap);

    let new_fee_cap = bumped_tip.saturating_add(margin).min(max);
    let new_tip = bumped_tip.min(new_fee_cap);
    if new_tip <= tip_cap || new_fee_cap <= fee_cap {
        return Err(TxmError::FeeBumpExceedsLimit {
            bumped: format!("tip {} cap {}", bumped_tip, bumped_tip.saturating_add(margin)),
            max: max.to_string(),
        });
    }
    Ok((new_tip, new_fee_cap))
}
