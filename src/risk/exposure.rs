//! Running portfolio exposure and the open-position book.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::RiskError;
use crate::models::Position;

/// Difference between the cached exposure total and a from-scratch recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateDrift {
    pub cached: Decimal,
    pub recomputed: Decimal,
}

impl StateDrift {
    pub fn difference(&self) -> Decimal {
        self.recomputed - self.cached
    }
}

/// Open positions plus a cached sum of their notionals.
///
/// The cached total must always be reconcilable against the positions; see
/// [`ExposureTracker::reconcile`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExposureTracker {
    positions: BTreeMap<String, Position>,
    total_notional: Decimal,
}

impl ExposureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from an authoritative position set.
    pub fn from_positions(positions: impl IntoIterator<Item = Position>) -> Self {
        let positions: BTreeMap<String, Position> = positions
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();
        let total_notional = positions.values().map(Position::notional).sum();
        Self {
            positions,
            total_notional,
        }
    }

    /// Cached sum of open notionals.
    pub fn total_notional(&self) -> Decimal {
        self.total_notional
    }

    /// Exposure as a fraction of `equity`. Zero when equity is not positive.
    pub fn exposure_pct(&self, equity: Decimal) -> Decimal {
        if equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.total_notional / equity
    }

    /// Whether adding `proposed_notional` would push exposure past `max_pct` of `equity`.
    pub fn would_exceed_limit(&self, proposed_notional: Decimal, equity: Decimal, max_pct: Decimal) -> bool {
        if equity <= Decimal::ZERO {
            return true;
        }
        (self.total_notional + proposed_notional) / equity > max_pct
    }

    /// Add a filled position. A fill in an already-open symbol on the same side averages in.
    pub fn record(&mut self, position: Position) -> Result<&Position, RiskError> {
        let added = position.notional();
        let symbol = position.symbol.clone();

        match self.positions.get_mut(&symbol) {
            Some(open) if open.side != position.side => {
                return Err(RiskError::SideConflict {
                    symbol,
                    open: open.side,
                    fill: position.side,
                });
            }
            Some(open) => {
                open.add(position.quantity, position.entry_price);
                open.stop_loss = position.stop_loss;
            }
            None => {
                self.positions.insert(symbol.clone(), position);
            }
        }

        self.total_notional += added;

        info!(
            symbol = %symbol,
            added = %added,
            total = %self.total_notional,
            "Position recorded"
        );

        Ok(&self.positions[&symbol])
    }

    /// Remove a position entirely. Unknown symbols are a logged no-op.
    pub fn release(&mut self, symbol: &str) -> Option<Position> {
        let Some(position) = self.positions.remove(symbol) else {
            warn!(symbol = %symbol, "Release for unknown position ignored");
            return None;
        };

        self.total_notional -= position.notional();
        info!(
            symbol = %symbol,
            released = %position.notional(),
            total = %self.total_notional,
            "Position released"
        );
        Some(position)
    }

    /// Partially close a position, returning the quantity removed.
    ///
    /// A reduction that leaves nothing open releases the symbol.
    pub fn reduce(&mut self, symbol: &str, quantity: Decimal) -> Result<Decimal, RiskError> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| RiskError::UnknownPosition(symbol.to_string()))?;

        let removed = position.reduce(quantity);
        self.total_notional -= removed * position.entry_price;

        if position.is_closed() {
            let residual = position.notional();
            self.positions.remove(symbol);
            self.total_notional -= residual;
        }

        Ok(removed)
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut Position> {
        self.positions.get_mut(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Sum of notionals computed from scratch.
    pub fn recompute(&self) -> Decimal {
        self.positions.values().map(Position::notional).sum()
    }

    /// Replace the cached total with a recompute.
    ///
    /// Returns the drift when it exceeds `tolerance`; the recomputed value wins either way.
    pub fn reconcile(&mut self, tolerance: Decimal) -> Option<StateDrift> {
        let drift = StateDrift {
            cached: self.total_notional,
            recomputed: self.recompute(),
        };
        self.total_notional = drift.recomputed;
        report_drift(drift, tolerance)
    }

    /// Replace the book with the broker's positions and report drift against the old total.
    pub fn replace_all(
        &mut self,
        positions: impl IntoIterator<Item = Position>,
        tolerance: Decimal,
    ) -> Option<StateDrift> {
        let cached = self.total_notional;
        *self = Self::from_positions(positions);
        report_drift(
            StateDrift {
                cached,
                recomputed: self.total_notional,
            },
            tolerance,
        )
    }
}

fn report_drift(drift: StateDrift, tolerance: Decimal) -> Option<StateDrift> {
    if drift.difference().abs() <= tolerance {
        return None;
    }

    warn!(
        cached = %drift.cached,
        recomputed = %drift.recomputed,
        difference = %drift.difference(),
        "Exposure drift corrected"
    );
    Some(drift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use rust_decimal_macros::dec;

    fn long(symbol: &str, qty: Decimal, price: Decimal) -> Position {
        Position::new(symbol, Side::Long, qty, price, price * dec!(0.98))
    }

    #[test]
    fn test_record_and_release() {
        let mut tracker = ExposureTracker::new();
        tracker.record(long("AAPL", dec!(10), dec!(150))).unwrap();
        tracker.record(long("MSFT", dec!(5), dec!(400))).unwrap();

        assert_eq!(tracker.total_notional(), dec!(3500));
        assert_eq!(tracker.exposure_pct(dec!(10000)), dec!(0.35));

        let released = tracker.release("AAPL").unwrap();
        assert_eq!(released.quantity, dec!(10));
        assert_eq!(tracker.total_notional(), dec!(2000));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let mut tracker = ExposureTracker::new();
        tracker.record(long("AAPL", dec!(10), dec!(150))).unwrap();

        assert!(tracker.release("TSLA").is_none());
        assert!(tracker.release("TSLA").is_none());
        assert_eq!(tracker.total_notional(), dec!(1500));
    }

    #[test]
    fn test_would_exceed_limit() {
        let mut tracker = ExposureTracker::new();
        tracker.record(long("AAPL", dec!(50), dec!(150))).unwrap(); // $7,500

        assert!(!tracker.would_exceed_limit(dec!(500), dec!(10000), dec!(0.8)));
        assert!(tracker.would_exceed_limit(dec!(501), dec!(10000), dec!(0.8)));
        assert!(tracker.would_exceed_limit(dec!(1), Decimal::ZERO, dec!(0.8)));
    }

    #[test]
    fn test_same_side_fill_averages_in() {
        let mut tracker = ExposureTracker::new();
        tracker.record(long("AAPL", dec!(10), dec!(100))).unwrap();
        let merged = tracker.record(long("AAPL", dec!(10), dec!(110))).unwrap();

        assert_eq!(merged.quantity, dec!(20));
        assert_eq!(merged.entry_price, dec!(105));
        assert_eq!(tracker.total_notional(), dec!(2100));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_opposite_side_fill_conflicts() {
        let mut tracker = ExposureTracker::new();
        tracker.record(long("AAPL", dec!(10), dec!(100))).unwrap();

        let short = Position::new("AAPL", Side::Short, dec!(5), dec!(100), dec!(102));
        assert!(matches!(
            tracker.record(short),
            Err(RiskError::SideConflict { .. })
        ));
        assert_eq!(tracker.total_notional(), dec!(1000));
    }

    #[test]
    fn test_reduce_and_close_out() {
        let mut tracker = ExposureTracker::new();
        tracker.record(long("AAPL", dec!(10), dec!(100))).unwrap();

        assert_eq!(tracker.reduce("AAPL", dec!(4)).unwrap(), dec!(4));
        assert_eq!(tracker.total_notional(), dec!(600));

        assert_eq!(tracker.reduce("AAPL", dec!(100)).unwrap(), dec!(6));
        assert!(tracker.is_empty());
        assert_eq!(tracker.total_notional(), Decimal::ZERO);

        assert!(matches!(
            tracker.reduce("AAPL", dec!(1)),
            Err(RiskError::UnknownPosition(_))
        ));
    }

    #[test]
    fn test_running_total_matches_recompute() {
        let mut tracker = ExposureTracker::new();
        tracker.record(long("AAPL", dec!(3), dec!(101.37))).unwrap();
        tracker.record(long("AAPL", dec!(7), dec!(99.91))).unwrap();
        tracker.record(long("MSFT", dec!(2), dec!(410.05))).unwrap();
        tracker.reduce("AAPL", dec!(4)).unwrap();
        tracker.record(long("NVDA", dec!(1.5), dec!(880))).unwrap();
        tracker.release("MSFT");

        let diff = (tracker.total_notional() - tracker.recompute()).abs();
        assert!(diff <= dec!(0.000001), "drift {}", diff);
        assert!(tracker.reconcile(dec!(0.01)).is_none());
    }

    #[test]
    fn test_reconcile_reports_and_corrects_drift() {
        let mut tracker = ExposureTracker::new();
        tracker.record(long("AAPL", dec!(10), dec!(100))).unwrap();
        tracker.total_notional = dec!(1250);

        let drift = tracker.reconcile(dec!(0.01)).unwrap();
        assert_eq!(drift.cached, dec!(1250));
        assert_eq!(drift.recomputed, dec!(1000));
        assert_eq!(tracker.total_notional(), dec!(1000));
    }

    #[test]
    fn test_replace_all_reports_drift() {
        let mut tracker = ExposureTracker::new();
        tracker.record(long("AAPL", dec!(10), dec!(100))).unwrap();

        let drift = tracker
            .replace_all(vec![long("AAPL", dec!(8), dec!(100))], dec!(0.01))
            .unwrap();
        assert_eq!(drift.difference(), dec!(-200));
        assert_eq!(tracker.total_notional(), dec!(800));
    }
}
