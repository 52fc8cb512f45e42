//! Risk configuration.

use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DailyReset, RiskError};
use crate::models::Side;

/// Limits enforced by the risk gate. Percentages are fractions (0.05 = 5%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Maximum notional of a single position as a fraction of equity
    pub max_position_size_pct: Decimal,

    /// Maximum notional of all open positions as a fraction of equity
    pub max_total_exposure_pct: Decimal,

    /// Stop distance used when a strategy does not supply one (0.0 to 1.0)
    pub default_stop_loss_pct: Decimal,

    /// Realized daily loss, as a fraction of day-start equity, that halts trading
    pub daily_loss_limit_pct: Decimal,

    /// Losing closes in a row that halt trading
    pub max_consecutive_losses: u32,

    /// Maximum number of concurrently open positions
    pub max_open_positions: u32,

    /// Smallest order notional worth sending, in quote currency
    pub min_order_notional: Decimal,

    /// Quantity increment used when a proposal does not name its own
    pub default_lot_size: Decimal,

    /// Distance the trailing stop keeps from the market (0.0 to 1.0)
    pub trailing_stop_pct: Decimal,

    /// Exposure drift, in quote currency, tolerated before reconciliation logs it
    pub drift_tolerance: Decimal,

    /// Seconds an unconfirmed approval keeps its exposure reserved
    pub reservation_ttl_secs: i64,

    /// Master switch; when false every proposal is rejected
    pub trading_enabled: bool,

    /// Trading-day boundary for the circuit breaker
    pub daily_reset: DailyReset,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size_pct: dec!(0.05),   // Max 5% per position
            max_total_exposure_pct: dec!(0.80),  // Max 80% total exposure
            default_stop_loss_pct: dec!(0.02),   // 2% stop loss
            daily_loss_limit_pct: dec!(0.10),    // Halt after 10% daily loss
            max_consecutive_losses: 5,
            max_open_positions: 20,
            min_order_notional: dec!(10),        // $10 minimum order
            default_lot_size: dec!(1),           // Whole units
            trailing_stop_pct: dec!(0.02),
            drift_tolerance: dec!(0.01),
            reservation_ttl_secs: 60,
            trading_enabled: true,
            daily_reset: DailyReset::default(), // Midnight UTC
        }
    }
}

impl RiskConfig {
    /// Load overrides from `RISK_*` environment variables and validate.
    pub fn from_env() -> Result<Self, RiskError> {
        let defaults = Self::default();

        let config = Self {
            max_position_size_pct: env_or("RISK_MAX_POSITION_SIZE_PCT", "max_position_size_pct", defaults.max_position_size_pct)?,
            max_total_exposure_pct: env_or("RISK_MAX_TOTAL_EXPOSURE_PCT", "max_total_exposure_pct", defaults.max_total_exposure_pct)?,
            default_stop_loss_pct: env_or("RISK_DEFAULT_STOP_LOSS_PCT", "default_stop_loss_pct", defaults.default_stop_loss_pct)?,
            daily_loss_limit_pct: env_or("RISK_DAILY_LOSS_LIMIT_PCT", "daily_loss_limit_pct", defaults.daily_loss_limit_pct)?,
            max_consecutive_losses: env_or("RISK_MAX_CONSECUTIVE_LOSSES", "max_consecutive_losses", defaults.max_consecutive_losses)?,
            max_open_positions: env_or("RISK_MAX_OPEN_POSITIONS", "max_open_positions", defaults.max_open_positions)?,
            min_order_notional: env_or("RISK_MIN_ORDER_NOTIONAL", "min_order_notional", defaults.min_order_notional)?,
            default_lot_size: env_or("RISK_DEFAULT_LOT_SIZE", "default_lot_size", defaults.default_lot_size)?,
            trailing_stop_pct: env_or("RISK_TRAILING_STOP_PCT", "trailing_stop_pct", defaults.trailing_stop_pct)?,
            drift_tolerance: env_or("RISK_DRIFT_TOLERANCE", "drift_tolerance", defaults.drift_tolerance)?,
            reservation_ttl_secs: env_or("RISK_RESERVATION_TTL_SECS", "reservation_ttl_secs", defaults.reservation_ttl_secs)?,
            trading_enabled: env_or("RISK_TRADING_ENABLED", "trading_enabled", defaults.trading_enabled)?,
            daily_reset: match std::env::var("RISK_DAILY_RESET") {
                Ok(raw) => raw.parse()?,
                Err(_) => defaults.daily_reset,
            },
        };

        config.validate()?;
        debug!(?config, "Loaded risk configuration");
        Ok(config)
    }

    /// Check every field against its valid range.
    ///
    /// Out-of-range values are errors; nothing is clamped.
    pub fn validate(&self) -> Result<(), RiskError> {
        fraction("max_total_exposure_pct", self.max_total_exposure_pct, true)?;
        fraction("max_position_size_pct", self.max_position_size_pct, true)?;
        fraction("default_stop_loss_pct", self.default_stop_loss_pct, false)?;
        fraction("daily_loss_limit_pct", self.daily_loss_limit_pct, true)?;
        fraction("trailing_stop_pct", self.trailing_stop_pct, false)?;

        if self.max_position_size_pct > self.max_total_exposure_pct {
            return Err(RiskError::config(
                "max_position_size_pct",
                format!(
                    "{} must not exceed max_total_exposure_pct {}",
                    self.max_position_size_pct, self.max_total_exposure_pct
                ),
            ));
        }
        if self.max_consecutive_losses == 0 {
            return Err(RiskError::config("max_consecutive_losses", "must be at least 1"));
        }
        if self.max_open_positions == 0 {
            return Err(RiskError::config("max_open_positions", "must be at least 1"));
        }
        if self.min_order_notional < Decimal::ZERO {
            return Err(RiskError::config("min_order_notional", "must not be negative"));
        }
        if self.default_lot_size <= Decimal::ZERO {
            return Err(RiskError::config("default_lot_size", "must be positive"));
        }
        if self.drift_tolerance < Decimal::ZERO {
            return Err(RiskError::config("drift_tolerance", "must not be negative"));
        }
        if self.reservation_ttl_secs < 1 {
            return Err(RiskError::config("reservation_ttl_secs", "must be at least 1"));
        }

        Ok(())
    }

    /// Stop price `default_stop_loss_pct` away from `entry` on the losing side.
    pub fn default_stop_price(&self, side: Side, entry: Decimal) -> Decimal {
        match side {
            Side::Long => entry * (Decimal::ONE - self.default_stop_loss_pct),
            Side::Short => entry * (Decimal::ONE + self.default_stop_loss_pct),
        }
    }
}

/// `value` must lie in (0, 1], or (0, 1) when `inclusive_one` is false.
fn fraction(field: &'static str, value: Decimal, inclusive_one: bool) -> Result<(), RiskError> {
    let too_high = if inclusive_one {
        value > Decimal::ONE
    } else {
        value >= Decimal::ONE
    };

    if value <= Decimal::ZERO || too_high {
        let upper = if inclusive_one { "1]" } else { "1)" };
        return Err(RiskError::config(field, format!("{value} outside (0, {upper}")));
    }
    Ok(())
}

fn env_or<T: FromStr>(var: &str, field: &'static str, default: T) -> Result<T, RiskError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| RiskError::config(field, format!("cannot parse {var}={raw}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RiskConfig::default().validate().is_ok());
    }

    #[test]
    fn test_position_limit_above_exposure_limit_fails() {
        let config = RiskConfig {
            max_position_size_pct: dec!(0.5),
            max_total_exposure_pct: dec!(0.4),
            ..Default::default()
        };

        match config.validate() {
            Err(RiskError::InvalidConfig { field, .. }) => assert_eq!(field, "max_position_size_pct"),
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_values_are_not_clamped() {
        let cases = [
            RiskConfig { daily_loss_limit_pct: dec!(-0.1), ..Default::default() },
            RiskConfig { daily_loss_limit_pct: dec!(1.5), ..Default::default() },
            RiskConfig { default_stop_loss_pct: dec!(1), ..Default::default() },
            RiskConfig { max_consecutive_losses: 0, ..Default::default() },
            RiskConfig { max_open_positions: 0, ..Default::default() },
            RiskConfig { default_lot_size: Decimal::ZERO, ..Default::default() },
            RiskConfig { reservation_ttl_secs: 0, ..Default::default() },
        ];

        for config in cases {
            assert!(config.validate().is_err(), "{:?} should be rejected", config);
        }
    }

    #[test]
    fn test_default_stop_price() {
        let config = RiskConfig::default();
        assert_eq!(config.default_stop_price(Side::Long, dec!(100)), dec!(98));
        assert_eq!(config.default_stop_price(Side::Short, dec!(100)), dec!(102));
    }
}
