//! Fee oracle.
//!
//! Background-refreshed snapshot of `{base_fee, tip}`: the base fee comes
//! from the latest header (falling back to the node's suggested gas price
//! on pre-1559 chains), the tip from the node's suggestion clamped up to a
//! configured floor. Derived values: `max_fee = floor(base_fee × k) + tip`
//! where the multiplication uses the multiplier's exact binary expansion
//! rather than floating-point wei arithmetic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ethers::types::{U256, U512};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::blockchain::ChainClient;
use crate::errors::BuilderError;
use crate::utils::sleep_cancellable;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeParams {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

#[derive(Debug, Clone)]
pub struct FeeOracleConfig {
    pub refresh_interval: Duration,
    pub max_fee_multiplier: f64,
    pub min_priority_fee_wei: U256,
}

impl Default for FeeOracleConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
            max_fee_multiplier: 2.0,
            min_priority_fee_wei: U256::zero(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FeeSnapshot {
    base_fee: U256,
    tip: U256,
    #[allow(dead_code)]
    last_sync: Instant,
}

#[derive(Debug)]
pub struct FeeOracle {
    client: Arc<dyn ChainClient>,
    cfg: FeeOracleConfig,
    snapshot: RwLock<Option<FeeSnapshot>>,
}

impl FeeOracle {
    pub fn new(client: Arc<dyn ChainClient>, mut cfg: FeeOracleConfig) -> Self {
        if cfg.refresh_interval.is_zero() {
            cfg.refresh_interval = Duration::from_secs(5);
        }
        if cfg.max_fee_multiplier <= 0.0 || !cfg.max_fee_multiplier.is_finite() {
            cfg.max_fee_multiplier = 2.0;
        }
        Self {
            client,
            cfg,
            snapshot: RwLock::new(None),
        }
    }

    /// Background refresher. Refreshes once immediately, then on every tick
    /// until cancelled; refresh failures are logged and retried next tick.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(e) = self.refresh().await {
            warn!(target: "fee_oracle", error = %e, "initial fee refresh failed");
        }
        loop {
            if !sleep_cancellable(&cancel, self.cfg.refresh_interval).await {
                return;
            }
            if let Err(e) = self.refresh().await {
                warn!(target: "fee_oracle", error = %e, "fee refresh failed");
            }
        }
    }

    pub async fn refresh(&self) -> Result<(), BuilderError> {
        let base_fee = match self.client.latest_base_fee().await? {
            Some(base) => base,
            // Pre-1559 chain: approximate with the suggested gas price.
            None => self.client.suggest_gas_price().await?,
        };
        let mut tip = self.client.suggest_gas_tip().await?;
        if tip < self.cfg.min_priority_fee_wei {
            tip = self.cfg.min_priority_fee_wei;
        }
        let mut snapshot = self.snapshot.write().await;
        *snapshot = Some(FeeSnapshot {
            base_fee,
            tip,
            last_sync: Instant::now(),
        });
        debug!(target: "fee_oracle", base_fee = %base_fee, tip = %tip, "fee snapshot updated");
        Ok(())
    }

    /// Returns the derived fee parameters from the current snapshot,
    /// refreshing synchronously when none exists yet.
    pub async fn fees(&self) -> Result<FeeParams, BuilderError> {
        let (base_fee, tip) = match self.read_snapshot().await {
            Some(pair) => pair,
            None => {
                self.refresh().await?;
                self.read_snapshot()
                    .await
                    .ok_or_else(|| BuilderError::FeeOracle("no snapshot after refresh".into()))?
            }
        };
        let max_fee = mul_f64(base_fee, self.cfg.max_fee_multiplier).saturating_add(tip);
        Ok(FeeParams {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: tip,
        })
    }

    async fn read_snapshot(&self) -> Option<(U256, U256)> {
        let guard = self.snapshot.read().await;
        guard.as_ref().map(|s| (s.base_fee, s.tip))
    }
}

/// Multiplies `value` by a positive finite `factor`, flooring the result.
/// The factor's IEEE-754 mantissa/exponent are used directly, so the
/// product is exact up to the final floor, with no decimal-to-binary drift.
pub fn mul_f64(value: U256, factor: f64) -> U256 {
    if !factor.is_finite() || factor <= 0.0 || value.is_zero() {
        return U256::zero();
    }
    if factor == 1.0 {
        return value;
    }
    let bits = factor.to_bits();
    let raw_exp = ((bits >> 52) & 0x7ff) as i64;
    let fraction = bits & ((1u64 << 52) - 1);
    let (mantissa, exponent) = if raw_exp == 0 {
        (fraction, -1074i64)
    } else {
        (fraction | (1u64 << 52), raw_exp - 1075)
    };
    let wide: U512 = value.full_mul(U256::from(mantissa));
    let shifted = if exponent >= 0 {
        wide << (exponent as usize)
    } else {
        wide >> ((-exponent) as usize)
    };
    let mut bytes = [0u8; 64];
    shifted.to_big_endian(&mut bytes);
    if bytes[..32] != [0u8; 32] {
        return U256::MAX;
    }
    U256::from_big_endian(&bytes[32..])
}

/// Converts a non-negative gwei amount to wei, flooring fractional wei.
pub fn gwei_to_wei(gwei: f64) -> Result<U256, BuilderError> {
    if !gwei.is_finite() || gwei < 0.0 {
        return Err(BuilderError::InvalidAmount(
            "gwei must be non-negative".into(),
        ));
    }
    if gwei == 0.0 {
        return Ok(U256::zero());
    }
    Ok(mul_f64(U256::from(1_000_000_000u64), gwei))
}
