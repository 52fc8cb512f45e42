//! Risk gate: the single entry point that approves or rejects trades.
//!
//! The circuit breaker, the exposure tracker and outstanding approvals live
//! behind one mutex, so every `evaluate`, `confirm_fill` and
//! `record_trade_close` sees and mutates a consistent state. Callers do their
//! market-data and broker I/O before taking the gate, never while holding it.
//!
//! Approval and recording are separate steps. An approved `Decision` reserves
//! its notional for `reservation_ttl_secs`; the position is only recorded when
//! the broker confirms the fill via `confirm_fill`.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    BreakerState, BreakerStatus, CircuitBreaker, ExposureTracker, InvalidInput, LimitBreach,
    PositionSizer, Rejection, RiskConfig, RiskError, SizedOrder, StateDrift, TripReason,
};
use crate::models::{AccountSnapshot, Fill, Position, Side, TradeProposal};

/// Outcome of evaluating a proposal.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Reservation id when approved; also identifies the decision in the journal
    pub id: Uuid,
    pub symbol: String,
    pub approved: bool,
    /// Sized quantity, present only when approved
    pub quantity: Option<Decimal>,
    pub notional: Option<Decimal>,
    pub rejection: Option<Rejection>,
    pub evaluated_at: DateTime<Utc>,
}

impl Decision {
    fn approve(symbol: &str, sized: &SizedOrder) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            approved: true,
            quantity: Some(sized.quantity),
            notional: Some(sized.notional),
            rejection: None,
            evaluated_at: Utc::now(),
        }
    }

    fn reject(symbol: &str, rejection: impl Into<Rejection>) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            approved: false,
            quantity: None,
            notional: None,
            rejection: Some(rejection.into()),
            evaluated_at: Utc::now(),
        }
    }

    /// Human-readable reason.
    pub fn reason(&self) -> String {
        match &self.rejection {
            Some(rejection) => rejection.to_string(),
            None => "Risk checks passed".to_string(),
        }
    }
}

/// Exposure held for an approved but not yet filled trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub notional: Decimal,
    pub expires_at: DateTime<Utc>,
}

/// Result of recording a broker fill.
#[derive(Debug, Clone)]
pub struct FillReport {
    /// The position after the fill (merged when averaging in)
    pub position: Position,
    pub exposure_pct: Decimal,
    /// Limits the actual fill breaches. The fill is recorded regardless.
    pub breaches: Vec<LimitBreach>,
}

/// Result of marking a position to market.
#[derive(Debug, Clone, PartialEq)]
pub struct StopCheck {
    pub symbol: String,
    pub mark_price: Decimal,
    pub stop_loss: Decimal,
    pub unrealized_pnl: Decimal,
    /// New stop when the trailing stop moved
    pub trailed_to: Option<Decimal>,
    /// The mark crossed the stop; the caller should close the position
    pub triggered: bool,
}

/// Point-in-time risk figures for operators.
#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub daily_pnl: Decimal,
    pub daily_pnl_pct: Decimal,
    pub consecutive_losses: u32,
    pub open_positions: usize,
    pub total_exposure: Decimal,
    pub exposure_pct: Decimal,
    pub pending_reservations: usize,
    pub reserved_notional: Decimal,
    pub tripped: bool,
    pub trip_reason: Option<TripReason>,
    pub trips_today: u32,
    pub can_trade: bool,
    pub equity: Option<Decimal>,
    pub day_start_equity: Option<Decimal>,
    pub last_reset: DateTime<Utc>,
}

/// Serializable gate state for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub breaker: BreakerStatus,
    pub positions: Vec<Position>,
    #[serde(default)]
    pub reservations: Vec<Reservation>,
    #[serde(default)]
    pub last_equity: Option<Decimal>,
}

struct GateState {
    breaker: CircuitBreaker,
    exposure: ExposureTracker,
    reservations: HashMap<Uuid, Reservation>,
    last_equity: Option<Decimal>,
}

impl GateState {
    fn observe_equity(&mut self, equity: Decimal) {
        if equity > Decimal::ZERO {
            self.last_equity = Some(equity);
            self.breaker.observe_equity(equity);
        }
    }

    fn expire_reservations(&mut self, now: DateTime<Utc>) {
        self.reservations.retain(|id, r| {
            let live = r.expires_at > now;
            if !live {
                debug!(reservation = %id, symbol = %r.symbol, "Reservation expired");
            }
            live
        });
    }

    fn reserved_notional(&self) -> Decimal {
        self.reservations.values().map(|r| r.notional).sum()
    }

    /// Distinct symbols held at the broker, tracked locally, or reserved.
    fn open_symbols<'a>(&'a self, snapshot: &'a AccountSnapshot) -> BTreeSet<&'a str> {
        snapshot
            .positions
            .keys()
            .map(String::as_str)
            .chain(self.exposure.positions().map(|p| p.symbol.as_str()))
            .chain(self.reservations.values().map(|r| r.symbol.as_str()))
            .collect()
    }

    /// Take the reservation a fill answers: by id, else the oldest for the same symbol and side.
    fn take_reservation(&mut self, fill: &Fill) -> Option<Reservation> {
        if let Some(id) = fill.reservation_id {
            let matches = self
                .reservations
                .get(&id)
                .map(|r| r.symbol == fill.symbol && r.side == fill.side);
            match matches {
                Some(true) => return self.reservations.remove(&id),
                Some(false) => {
                    warn!(
                        reservation = %id,
                        symbol = %fill.symbol,
                        side = %fill.side,
                        "Fill does not match its reservation, reservation kept"
                    );
                }
                None => {
                    warn!(reservation = %id, symbol = %fill.symbol, "Fill for unknown or expired reservation");
                }
            }
            return None;
        }

        let id = self
            .reservations
            .values()
            .filter(|r| r.symbol == fill.symbol && r.side == fill.side)
            .min_by_key(|r| r.expires_at)
            .map(|r| r.id)?;
        self.reservations.remove(&id)
    }
}

/// Pre-trade risk gate for one account.
pub struct RiskGate {
    config: RiskConfig,
    sizer: PositionSizer,
    inner: Mutex<GateState>,
}

impl RiskGate {
    /// Create a gate with an armed breaker and an empty book.
    pub fn new(config: RiskConfig) -> Result<Self, RiskError> {
        config.validate()?;
        let breaker = CircuitBreaker::new(&config);
        Ok(Self::assemble(config, breaker, ExposureTracker::new(), HashMap::new(), None))
    }

    /// Rebuild a gate from a persisted snapshot under the current configuration.
    pub fn restore(config: RiskConfig, snapshot: RiskSnapshot) -> Result<Self, RiskError> {
        config.validate()?;
        let breaker = CircuitBreaker::restore(&config, snapshot.breaker);
        let exposure = ExposureTracker::from_positions(snapshot.positions);
        let reservations = snapshot
            .reservations
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        info!(
            open_positions = exposure.len(),
            exposure = %exposure.total_notional(),
            state = ?breaker.state(),
            "Risk state restored"
        );

        Ok(Self::assemble(config, breaker, exposure, reservations, snapshot.last_equity))
    }

    fn assemble(
        config: RiskConfig,
        breaker: CircuitBreaker,
        exposure: ExposureTracker,
        reservations: HashMap<Uuid, Reservation>,
        last_equity: Option<Decimal>,
    ) -> Self {
        Self {
            sizer: PositionSizer::new(config.clone()),
            config,
            inner: Mutex::new(GateState {
                breaker,
                exposure,
                reservations,
                last_equity,
            }),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Approve or reject a proposal.
    ///
    /// Checks run in order and stop at the first rejection: circuit breaker,
    /// trading switch, open-position count, sizing, total exposure. Approval
    /// reserves the sized notional but records no position.
    pub fn evaluate(&self, proposal: &TradeProposal, snapshot: &AccountSnapshot) -> Decision {
        let mut state = self.inner.lock();
        let now = Utc::now();
        state.observe_equity(snapshot.equity);
        state.expire_reservations(now);

        let decision = self.check(&mut state, proposal, snapshot, now);

        match &decision.rejection {
            None => info!(
                symbol = %proposal.symbol,
                side = %proposal.side,
                quantity = ?decision.quantity,
                notional = ?decision.notional,
                reservation = %decision.id,
                "Trade approved"
            ),
            Some(rejection) => warn!(
                symbol = %proposal.symbol,
                side = %proposal.side,
                code = rejection.code(),
                reason = %rejection,
                "Trade rejected"
            ),
        }

        decision
    }

    fn check(
        &self,
        state: &mut GateState,
        proposal: &TradeProposal,
        snapshot: &AccountSnapshot,
        now: DateTime<Utc>,
    ) -> Decision {
        let symbol = proposal.symbol.as_str();

        if let Some(reason) = state.breaker.trip_reason() {
            return Decision::reject(symbol, Rejection::TradingHalted(reason));
        }
        if !self.config.trading_enabled {
            return Decision::reject(symbol, Rejection::TradingDisabled);
        }

        let open = state.open_symbols(snapshot).len();
        if open >= self.config.max_open_positions as usize {
            return Decision::reject(
                symbol,
                LimitBreach::MaxOpenPositions {
                    open,
                    max: self.config.max_open_positions,
                },
            );
        }

        let sized = match self.sizer.size(proposal, snapshot.equity) {
            Ok(sized) => sized,
            Err(invalid) => return Decision::reject(symbol, invalid),
        };
        if sized.quantity.is_zero() || sized.notional < self.config.min_order_notional {
            return Decision::reject(
                symbol,
                LimitBreach::BelowMinimumOrder {
                    notional: sized.notional,
                    min: self.config.min_order_notional,
                },
            );
        }

        let pending = state.reserved_notional() + sized.notional;
        if state
            .exposure
            .would_exceed_limit(pending, snapshot.equity, self.config.max_total_exposure_pct)
        {
            return Decision::reject(
                symbol,
                LimitBreach::TotalExposure {
                    projected: state.exposure.total_notional() + pending,
                    max: snapshot.equity * self.config.max_total_exposure_pct,
                },
            );
        }

        let decision = Decision::approve(symbol, &sized);
        state.reservations.insert(
            decision.id,
            Reservation {
                id: decision.id,
                symbol: proposal.symbol.clone(),
                side: proposal.side,
                quantity: sized.quantity,
                notional: sized.notional,
                expires_at: now + Duration::seconds(self.config.reservation_ttl_secs),
            },
        );
        decision
    }

    /// Drop an approval that will not be sent to the broker.
    pub fn cancel_reservation(&self, id: Uuid) -> bool {
        let removed = self.inner.lock().reservations.remove(&id).is_some();
        if removed {
            info!(reservation = %id, "Reservation cancelled");
        }
        removed
    }

    /// Record a broker-confirmed fill and check the actual fill against the limits.
    pub fn confirm_fill(&self, fill: Fill) -> Result<FillReport, RiskError> {
        validate_fill(&fill)?;

        let mut state = self.inner.lock();
        state.expire_reservations(Utc::now());

        let reservation = state.take_reservation(&fill);
        if let Some(r) = &reservation {
            if r.quantity != fill.quantity {
                info!(
                    symbol = %fill.symbol,
                    approved = %r.quantity,
                    filled = %fill.quantity,
                    "Fill quantity differs from approval"
                );
            }
        }

        let recorded = state.exposure.record(fill.into_position()).cloned();
        let position = match recorded {
            Ok(position) => position,
            Err(e) => {
                // Put the reservation back so a corrected fill can still claim it
                if let Some(r) = reservation {
                    state.reservations.insert(r.id, r);
                }
                return Err(e);
            }
        };

        let mut breaches = Vec::new();
        let exposure_pct = match state.last_equity {
            Some(equity) => {
                let max_position = equity * self.config.max_position_size_pct;
                if position.notional() > max_position {
                    breaches.push(LimitBreach::PositionSize {
                        notional: position.notional(),
                        max: max_position,
                    });
                }
                let max_total = equity * self.config.max_total_exposure_pct;
                if state.exposure.total_notional() > max_total {
                    breaches.push(LimitBreach::TotalExposure {
                        projected: state.exposure.total_notional(),
                        max: max_total,
                    });
                }
                state.exposure.exposure_pct(equity)
            }
            None => Decimal::ZERO,
        };

        for breach in &breaches {
            warn!(symbol = %position.symbol, breach = %breach, "Fill breaches risk limit");
        }

        Ok(FillReport {
            position,
            exposure_pct,
            breaches,
        })
    }

    /// Record a fully closed trade: release the position and update the breaker.
    ///
    /// Returns the trip reason when this close halted trading.
    pub fn record_trade_close(&self, symbol: &str, realized_pnl: Decimal) -> Option<TripReason> {
        let mut state = self.inner.lock();
        state.exposure.release(symbol);
        state.breaker.record_trade_close(realized_pnl)
    }

    /// Record a partial close. The realized P&L counts toward the daily limit.
    pub fn record_partial_close(
        &self,
        symbol: &str,
        quantity: Decimal,
        realized_pnl: Decimal,
    ) -> Result<Option<TripReason>, RiskError> {
        if quantity <= Decimal::ZERO {
            return Err(InvalidInput::NonPositive {
                field: "quantity",
                value: quantity,
            }
            .into());
        }

        let mut state = self.inner.lock();
        let removed = state.exposure.reduce(symbol, quantity)?;
        info!(symbol = %symbol, removed = %removed, pnl = %realized_pnl, "Partial close recorded");
        Ok(state.breaker.record_partial_pnl(realized_pnl))
    }

    /// Mark a position to market, trail its stop, and report whether the stop was hit.
    ///
    /// Returns `None` for symbols with no open position.
    pub fn mark_price(&self, symbol: &str, price: Decimal) -> Option<StopCheck> {
        let mut state = self.inner.lock();
        let position = state.exposure.get_mut(symbol)?;

        position.update_price(price);
        let trailed_to = position.trail_stop(price, self.config.trailing_stop_pct);
        if let Some(stop) = trailed_to {
            info!(symbol = %symbol, stop = %stop, "Trailing stop updated");
        }

        let triggered = position.stop_hit(price);
        if triggered {
            warn!(symbol = %symbol, price = %price, stop = %position.stop_loss, "Stop loss triggered");
        }

        Some(StopCheck {
            symbol: symbol.to_string(),
            mark_price: price,
            stop_loss: position.stop_loss,
            unrealized_pnl: position.unrealized_pnl,
            trailed_to,
            triggered,
        })
    }

    /// Whether the breaker currently allows trading.
    pub fn can_trade(&self) -> bool {
        self.inner.lock().breaker.can_trade() && self.config.trading_enabled
    }

    /// Start a new trading day now.
    pub fn reset_daily(&self) {
        let mut state = self.inner.lock();
        let equity = state.last_equity;
        state.breaker.reset_daily(equity, Utc::now());
    }

    /// Reset when a configured day boundary has passed since the last reset.
    ///
    /// Returns true when a reset happened.
    pub fn roll_day_if_due(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.inner.lock();
        let last_reset = state.breaker.status().last_reset;
        if !self.config.daily_reset.is_due(last_reset, now) {
            return false;
        }

        let equity = state.last_equity;
        state.breaker.reset_daily(equity, now);
        true
    }

    /// Operator halt. Returns false when already halted.
    pub fn manual_halt(&self) -> bool {
        self.inner.lock().breaker.manual_halt()
    }

    /// Operator resume. Returns false when not halted.
    pub fn manual_resume(&self) -> bool {
        self.inner.lock().breaker.manual_resume()
    }

    /// Replace the tracked book with the broker's positions.
    ///
    /// Reservations for symbols the broker now holds are dropped, since their
    /// fills are part of the snapshot.
    pub fn sync_account(&self, snapshot: &AccountSnapshot) -> Option<StateDrift> {
        let mut state = self.inner.lock();
        state.observe_equity(snapshot.equity);

        state.reservations.retain(|_, r| {
            let filled = snapshot.positions.contains_key(&r.symbol);
            if filled {
                info!(symbol = %r.symbol, reservation = %r.id, "Reservation settled by broker sync");
            }
            !filled
        });

        let drift = state
            .exposure
            .replace_all(snapshot.positions.values().cloned(), self.config.drift_tolerance);

        info!(
            open_positions = state.exposure.len(),
            exposure = %state.exposure.total_notional(),
            "Account synced"
        );
        drift
    }

    /// Recompute exposure from the tracked positions; the recompute wins.
    pub fn reconcile(&self) -> Option<StateDrift> {
        self.inner.lock().exposure.reconcile(self.config.drift_tolerance)
    }

    pub fn metrics(&self) -> RiskMetrics {
        let mut state = self.inner.lock();
        state.expire_reservations(Utc::now());

        let breaker = &state.breaker;
        let status = breaker.status();
        let daily_pnl_pct = match status.day_start_equity {
            Some(equity) if equity > Decimal::ZERO => status.daily_pnl / equity,
            _ => Decimal::ZERO,
        };
        let exposure_pct = state
            .last_equity
            .map(|equity| state.exposure.exposure_pct(equity))
            .unwrap_or(Decimal::ZERO);

        RiskMetrics {
            daily_pnl: status.daily_pnl,
            daily_pnl_pct,
            consecutive_losses: status.consecutive_losses,
            open_positions: state.exposure.len(),
            total_exposure: state.exposure.total_notional(),
            exposure_pct,
            pending_reservations: state.reservations.len(),
            reserved_notional: state.reserved_notional(),
            tripped: matches!(status.state, BreakerState::Tripped(_)),
            trip_reason: breaker.trip_reason(),
            trips_today: status.trips_today,
            can_trade: breaker.can_trade() && self.config.trading_enabled,
            equity: state.last_equity,
            day_start_equity: status.day_start_equity,
            last_reset: status.last_reset,
        }
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.inner.lock().exposure.get(symbol).cloned()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.inner.lock().exposure.positions().cloned().collect()
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.inner.lock().reservations.values().cloned().collect()
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        let state = self.inner.lock();
        RiskSnapshot {
            breaker: state.breaker.status().clone(),
            positions: state.exposure.positions().cloned().collect(),
            reservations: state.reservations.values().cloned().collect(),
            last_equity: state.last_equity,
        }
    }
}

fn validate_fill(fill: &Fill) -> Result<(), InvalidInput> {
    for (field, value) in [
        ("quantity", fill.quantity),
        ("price", fill.price),
        ("stop_loss", fill.stop_loss),
    ] {
        if value <= Decimal::ZERO {
            return Err(InvalidInput::NonPositive { field, value });
        }
    }
    Ok(())
}
