//! Circuit breaker for daily trading halts.
//!
//! The breaker is ARMED until the day's realized losses reach the daily loss
//! limit, the losing streak reaches the configured maximum, or an operator
//! halts it. Once TRIPPED it stays tripped for the rest of the day: winning
//! trades do not re-arm it, only `reset_daily` or `manual_resume` do.
//!
//! The breaker itself does no locking. `RiskGate` owns it together with the
//! exposure tracker behind a single mutex.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::RiskConfig;

/// Reason for circuit breaker activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    /// Daily realized loss reached the limit.
    DailyLossLimit,
    /// Too many losing closes in a row.
    ConsecutiveLosses,
    /// Operator halt.
    Manual,
}

impl TripReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripReason::DailyLossLimit => "daily_loss_limit",
            TripReason::ConsecutiveLosses => "consecutive_losses",
            TripReason::Manual => "manual",
        }
    }
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum BreakerState {
    Armed,
    Tripped(TripReason),
}

/// Counters and state of the breaker, as persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub state: BreakerState,
    /// Realized P&L since the last daily reset.
    pub daily_pnl: Decimal,
    /// Losing closes since the last non-negative close.
    pub consecutive_losses: u32,
    /// Equity the daily loss limit is measured against.
    pub day_start_equity: Option<Decimal>,
    pub tripped_at: Option<DateTime<Utc>>,
    pub trips_today: u32,
    pub last_reset: DateTime<Utc>,
}

impl BreakerStatus {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            state: BreakerState::Armed,
            daily_pnl: Decimal::ZERO,
            consecutive_losses: 0,
            day_start_equity: None,
            tripped_at: None,
            trips_today: 0,
            last_reset: now,
        }
    }
}

/// Daily loss and losing-streak circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    daily_loss_limit_pct: Decimal,
    max_consecutive_losses: u32,
    status: BreakerStatus,
}

impl CircuitBreaker {
    /// Create an armed breaker with zeroed counters.
    pub fn new(config: &RiskConfig) -> Self {
        Self::restore(config, BreakerStatus::fresh(Utc::now()))
    }

    /// Rebuild a breaker from persisted status under the current limits.
    ///
    /// The restored counters are checked against those limits immediately.
    pub fn restore(config: &RiskConfig, status: BreakerStatus) -> Self {
        let mut breaker = Self {
            daily_loss_limit_pct: config.daily_loss_limit_pct,
            max_consecutive_losses: config.max_consecutive_losses,
            status,
        };
        breaker.evaluate();
        breaker
    }

    /// Whether new trades are allowed. Pure read.
    pub fn can_trade(&self) -> bool {
        self.status.state == BreakerState::Armed
    }

    pub fn state(&self) -> BreakerState {
        self.status.state
    }

    pub fn trip_reason(&self) -> Option<TripReason> {
        match self.status.state {
            BreakerState::Armed => None,
            BreakerState::Tripped(reason) => Some(reason),
        }
    }

    pub fn status(&self) -> &BreakerStatus {
        &self.status
    }

    pub fn daily_pnl(&self) -> Decimal {
        self.status.daily_pnl
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.status.consecutive_losses
    }

    pub fn day_start_equity(&self) -> Option<Decimal> {
        self.status.day_start_equity
    }

    /// Capture the day's reference equity if none is set yet.
    ///
    /// Losses booked before the equity was known are checked against the new
    /// limit right away. Returns the reason when that trips the breaker.
    pub fn observe_equity(&mut self, equity: Decimal) -> Option<TripReason> {
        if self.status.day_start_equity.is_some() || equity <= Decimal::ZERO {
            return None;
        }

        self.status.day_start_equity = Some(equity);
        self.evaluate()
    }

    /// Loss amount that trips the breaker, once the day's equity is known.
    pub fn daily_loss_limit(&self) -> Option<Decimal> {
        self.status
            .day_start_equity
            .map(|equity| equity * self.daily_loss_limit_pct)
    }

    /// Record a fully closed trade and re-evaluate the trip conditions.
    ///
    /// Returns the reason when this close tripped the breaker.
    pub fn record_trade_close(&mut self, realized_pnl: Decimal) -> Option<TripReason> {
        self.status.daily_pnl += realized_pnl;

        if realized_pnl < Decimal::ZERO {
            self.status.consecutive_losses += 1;
            warn!(
                pnl = %realized_pnl,
                consecutive = self.status.consecutive_losses,
                daily_pnl = %self.status.daily_pnl,
                "Loss recorded"
            );
        } else {
            self.status.consecutive_losses = 0;
            info!(
                pnl = %realized_pnl,
                daily_pnl = %self.status.daily_pnl,
                "Profit recorded"
            );
        }

        self.evaluate()
    }

    /// Book realized P&L from a partial close. The losing streak is left alone.
    pub fn record_partial_pnl(&mut self, realized_pnl: Decimal) -> Option<TripReason> {
        self.status.daily_pnl += realized_pnl;
        self.evaluate()
    }

    /// Halt trading until `manual_resume` or the next daily reset.
    ///
    /// Returns false when the breaker was already tripped.
    pub fn manual_halt(&mut self) -> bool {
        if let BreakerState::Tripped(reason) = self.status.state {
            warn!(existing = %reason, "Manual halt requested while already tripped");
            return false;
        }
        self.trip(TripReason::Manual);
        true
    }

    /// Re-arm after any trip. Returns false when already armed.
    pub fn manual_resume(&mut self) -> bool {
        let Some(reason) = self.trip_reason() else {
            return false;
        };

        self.status.state = BreakerState::Armed;
        self.status.tripped_at = None;
        warn!(
            cleared = %reason,
            consecutive_losses = self.status.consecutive_losses,
            "Circuit breaker manually resumed"
        );
        true
    }

    /// Start a new trading day: zero the daily P&L and clear any trip.
    ///
    /// The losing streak carries over. `equity` becomes the new day-start equity.
    pub fn reset_daily(&mut self, equity: Option<Decimal>, now: DateTime<Utc>) {
        self.status.state = BreakerState::Armed;
        self.status.daily_pnl = Decimal::ZERO;
        self.status.tripped_at = None;
        self.status.trips_today = 0;
        self.status.last_reset = now;
        if let Some(equity) = equity.filter(|e| *e > Decimal::ZERO) {
            self.status.day_start_equity = Some(equity);
        }

        info!(
            day_start_equity = ?self.status.day_start_equity,
            consecutive_losses = self.status.consecutive_losses,
            "Circuit breaker daily reset"
        );
    }

    fn evaluate(&mut self) -> Option<TripReason> {
        match self.status.state {
            BreakerState::Armed => {
                let reason = self.check_thresholds()?;
                self.trip(reason);
                Some(reason)
            }
            // A limit breach during an operator halt replaces the manual reason
            BreakerState::Tripped(TripReason::Manual) => {
                let reason = self.check_thresholds()?;
                self.status.state = BreakerState::Tripped(reason);
                error!(
                    reason = %reason,
                    daily_pnl = %self.status.daily_pnl,
                    consecutive_losses = self.status.consecutive_losses,
                    "Limit breached during manual halt"
                );
                Some(reason)
            }
            BreakerState::Tripped(_) => None,
        }
    }

    fn check_thresholds(&self) -> Option<TripReason> {
        if let Some(limit) = self.daily_loss_limit() {
            if self.status.daily_pnl <= -limit {
                return Some(TripReason::DailyLossLimit);
            }
        }

        if self.status.consecutive_losses >= self.max_consecutive_losses {
            return Some(TripReason::ConsecutiveLosses);
        }

        None
    }

    fn trip(&mut self, reason: TripReason) {
        let now = Utc::now();
        self.status.state = BreakerState::Tripped(reason);
        self.status.tripped_at = Some(now);
        self.status.trips_today += 1;

        error!(
            reason = %reason,
            daily_pnl = %self.status.daily_pnl,
            consecutive_losses = self.status.consecutive_losses,
            "Circuit breaker TRIPPED - trading halted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn breaker(daily_limit: Decimal, max_losses: u32) -> CircuitBreaker {
        let config = RiskConfig {
            daily_loss_limit_pct: daily_limit,
            max_consecutive_losses: max_losses,
            ..Default::default()
        };
        let mut breaker = CircuitBreaker::new(&config);
        breaker.observe_equity(dec!(10000));
        breaker
    }

    #[test]
    fn test_initially_armed() {
        let cb = breaker(dec!(0.1), 3);
        assert!(cb.can_trade());
        assert_eq!(cb.state(), BreakerState::Armed);
        assert_eq!(cb.daily_loss_limit(), Some(dec!(1000)));
    }

    #[test]
    fn test_daily_loss_trip() {
        let mut cb = breaker(dec!(0.1), 100);

        assert_eq!(cb.record_trade_close(dec!(-400)), None);
        assert_eq!(cb.record_trade_close(dec!(-599.99)), None);
        assert!(cb.can_trade());

        assert_eq!(cb.record_trade_close(dec!(-0.01)), Some(TripReason::DailyLossLimit));
        assert!(!cb.can_trade());
        assert_eq!(cb.trip_reason(), Some(TripReason::DailyLossLimit));
        assert_eq!(cb.status().trips_today, 1);
    }

    #[test]
    fn test_consecutive_losses_trip_with_positive_day() {
        let mut cb = breaker(dec!(0.1), 3);

        cb.record_trade_close(dec!(500));
        cb.record_trade_close(dec!(-10));
        cb.record_trade_close(dec!(-10));
        assert!(cb.can_trade());

        assert_eq!(cb.record_trade_close(dec!(-10)), Some(TripReason::ConsecutiveLosses));
        assert!(cb.daily_pnl() > Decimal::ZERO);
    }

    #[test]
    fn test_win_resets_streak_but_not_trip() {
        let mut cb = breaker(dec!(0.1), 3);
        for _ in 0..3 {
            cb.record_trade_close(dec!(-1));
        }
        assert!(!cb.can_trade());

        assert_eq!(cb.record_trade_close(dec!(50)), None);
        assert_eq!(cb.consecutive_losses(), 0);
        assert!(!cb.can_trade());
        assert_eq!(cb.trip_reason(), Some(TripReason::ConsecutiveLosses));
    }

    #[test]
    fn test_streak_tracks_trailing_losses() {
        let mut cb = breaker(dec!(1), 1000);
        let pnls = [
            dec!(-1), dec!(-2), dec!(0), dec!(-3), dec!(5), dec!(-1), dec!(-1), dec!(-4),
        ];

        let mut expected = 0u32;
        for pnl in pnls {
            cb.record_trade_close(pnl);
            expected = if pnl < Decimal::ZERO { expected + 1 } else { 0 };
            assert_eq!(cb.consecutive_losses(), expected);
        }
        assert_eq!(cb.consecutive_losses(), 3);
    }

    #[test]
    fn test_reset_daily_is_idempotent() {
        let mut cb = breaker(dec!(0.1), 10);
        cb.record_trade_close(dec!(-1200));
        cb.record_trade_close(dec!(-5));
        assert!(!cb.can_trade());

        let now = Utc::now();
        cb.reset_daily(None, now);
        let once = cb.status().clone();
        cb.reset_daily(None, now);

        assert_eq!(cb.status(), &once);
        assert!(cb.can_trade());
        assert_eq!(cb.daily_pnl(), Decimal::ZERO);
        assert_eq!(cb.consecutive_losses(), 2);
        assert_eq!(cb.day_start_equity(), Some(dec!(10000)));
    }

    #[test]
    fn test_reset_daily_moves_reference_equity() {
        let mut cb = breaker(dec!(0.1), 10);
        cb.reset_daily(Some(dec!(20000)), Utc::now());
        assert_eq!(cb.daily_loss_limit(), Some(dec!(2000)));

        cb.record_trade_close(dec!(-1500));
        assert!(cb.can_trade());
    }

    #[test]
    fn test_manual_halt_and_resume() {
        let mut cb = breaker(dec!(0.1), 3);

        assert!(cb.manual_halt());
        assert_eq!(cb.trip_reason(), Some(TripReason::Manual));
        assert!(!cb.manual_halt());

        assert!(cb.manual_resume());
        assert!(cb.can_trade());
        assert!(!cb.manual_resume());
    }

    #[test]
    fn test_no_daily_limit_without_equity() {
        let config = RiskConfig::default();
        let mut cb = CircuitBreaker::new(&config);

        assert_eq!(cb.daily_loss_limit(), None);
        assert_eq!(cb.record_trade_close(dec!(-1000000)), None);
    }

    #[test]
    fn test_losses_before_equity_trip_once_equity_known() {
        let mut cb = CircuitBreaker::new(&RiskConfig::default());

        assert_eq!(cb.record_trade_close(dec!(-5000)), None);
        assert!(cb.can_trade());

        assert_eq!(cb.observe_equity(dec!(10000)), Some(TripReason::DailyLossLimit));
        assert_eq!(cb.trip_reason(), Some(TripReason::DailyLossLimit));

        // Later observations keep the first reference equity
        assert_eq!(cb.observe_equity(dec!(50000)), None);
        assert_eq!(cb.day_start_equity(), Some(dec!(10000)));
    }

    #[test]
    fn test_breach_during_manual_halt_replaces_reason() {
        let mut cb = breaker(dec!(0.1), 5);
        assert!(cb.manual_halt());
        let halted_at = cb.status().tripped_at;

        assert_eq!(cb.record_trade_close(dec!(-1500)), Some(TripReason::DailyLossLimit));
        assert_eq!(cb.trip_reason(), Some(TripReason::DailyLossLimit));
        assert_eq!(cb.status().tripped_at, halted_at);
        assert_eq!(cb.status().trips_today, 1);

        // Already reporting a limit breach: no further change
        assert_eq!(cb.record_trade_close(dec!(-1)), None);
    }

    #[test]
    fn test_restore_checks_counters_against_current_limits() {
        let mut cb = breaker(dec!(0.2), 10);
        cb.record_trade_close(dec!(-1500));
        assert!(cb.can_trade());

        let tighter = RiskConfig {
            daily_loss_limit_pct: dec!(0.1),
            ..Default::default()
        };
        let restored = CircuitBreaker::restore(&tighter, cb.status().clone());
        assert_eq!(restored.trip_reason(), Some(TripReason::DailyLossLimit));
    }

    #[test]
    fn test_partial_pnl_counts_toward_daily_limit_only() {
        let mut cb = breaker(dec!(0.1), 2);

        cb.record_partial_pnl(dec!(-10));
        cb.record_partial_pnl(dec!(-10));
        assert_eq!(cb.consecutive_losses(), 0);
        assert!(cb.can_trade());

        assert_eq!(cb.record_partial_pnl(dec!(-980)), Some(TripReason::DailyLossLimit));
    }
}
