//! Risk management: position sizing, exposure limits, circuit breaker and the gate that combines them.

mod circuit_breaker;
mod config;
mod error;
mod exposure;
mod gate;
mod position_sizer;
mod schedule;

pub use circuit_breaker::{BreakerState, BreakerStatus, CircuitBreaker, TripReason};
pub use config::RiskConfig;
pub use error::{InvalidInput, LimitBreach, Rejection, RiskError};
pub use exposure::{ExposureTracker, StateDrift};
pub use gate::{
    Decision, FillReport, Reservation, RiskGate, RiskMetrics, RiskSnapshot, StopCheck,
};
pub use position_sizer::{PositionSizer, SizedOrder};
pub use schedule::{spawn_daily_reset, DailyReset};
