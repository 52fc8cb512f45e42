//! Error and rejection types for the risk gate.

use rust_decimal::Decimal;
use thiserror::Error;

use super::TripReason;
use crate::models::Side;

/// Malformed proposal or fill. Always recoverable by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidInput {
    #[error("entry price equals stop-loss price, no price risk")]
    ZeroPriceRisk,

    #[error("equity must be positive, got {0}")]
    NonPositiveEquity(Decimal),

    #[error("risk percent {risk} outside (0, {max}]")]
    RiskOutOfRange { risk: Decimal, max: Decimal },

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: Decimal },

    #[error("stop-loss {stop} is on the wrong side of entry {entry} for a {side} trade")]
    StopOnWrongSide {
        side: Side,
        entry: Decimal,
        stop: Decimal,
    },

    #[error("unknown side: {0}")]
    UnknownSide(String),

    #[error("position size out of representable range")]
    SizeOverflow,
}

/// Errors returned by risk operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RiskError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InvalidInput),

    #[error("invalid configuration: {field} {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("no open position for {0}")]
    UnknownPosition(String),

    #[error("{fill} fill conflicts with open {open} position in {symbol}")]
    SideConflict {
        symbol: String,
        open: Side,
        fill: Side,
    },
}

impl RiskError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

/// A configured limit that a trade would breach.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitBreach {
    #[error("max open positions reached: {open} >= {max}")]
    MaxOpenPositions { open: usize, max: u32 },

    #[error("total exposure {projected} would exceed max {max}")]
    TotalExposure { projected: Decimal, max: Decimal },

    #[error("position notional {notional} exceeds max {max}")]
    PositionSize { notional: Decimal, max: Decimal },

    #[error("order notional {notional} below minimum {min}")]
    BelowMinimumOrder { notional: Decimal, min: Decimal },
}

/// Why the gate refused a proposal. Returned inside a `Decision`, never as an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("trading halted: {0}")]
    TradingHalted(TripReason),

    #[error("trading disabled in configuration")]
    TradingDisabled,

    #[error("limit exceeded: {0}")]
    LimitExceeded(LimitBreach),

    #[error("invalid input: {0}")]
    InvalidInput(InvalidInput),
}

impl Rejection {
    /// Stable short code for logs and the audit journal.
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::TradingHalted(_) => "trading_halted",
            Rejection::TradingDisabled => "trading_disabled",
            Rejection::LimitExceeded(_) => "limit_exceeded",
            Rejection::InvalidInput(_) => "invalid_input",
        }
    }
}

impl From<LimitBreach> for Rejection {
    fn from(breach: LimitBreach) -> Self {
        Rejection::LimitExceeded(breach)
    }
}

impl From<InvalidInput> for Rejection {
    fn from(input: InvalidInput) -> Self {
        Rejection::InvalidInput(input)
    }
}
