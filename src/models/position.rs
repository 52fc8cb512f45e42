//! Position model representing an open holding in a single instrument.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::risk::InvalidInput;

/// Direction of a position or proposed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    /// +1 for long, -1 for short. Multiplies a price move into P&L.
    pub fn direction(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = InvalidInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "long" | "buy" => Ok(Side::Long),
            "short" | "sell" => Ok(Side::Short),
            other => Err(InvalidInput::UnknownSide(other.to_string())),
        }
    }
}

/// Open position held at the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Instrument identifier
    pub symbol: String,

    pub side: Side,

    /// Units held, always positive
    pub quantity: Decimal,

    /// Average entry price per unit
    pub entry_price: Decimal,

    /// Current stop-loss price
    pub stop_loss: Decimal,

    /// Last observed market price
    #[serde(default)]
    pub mark_price: Decimal,

    /// Unrealized P&L at `mark_price`
    #[serde(default)]
    pub unrealized_pnl: Decimal,

    #[serde(default = "Utc::now")]
    pub opened_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl Position {
    /// Create a new position from a confirmed fill.
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        entry_price: Decimal,
        stop_loss: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            entry_price,
            stop_loss,
            mark_price: entry_price,
            unrealized_pnl: Decimal::ZERO,
            opened_at: now,
            last_updated: now,
        }
    }

    /// Capital controlled by the position, valued at entry.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    /// Update unrealized P&L from the current market price.
    pub fn update_price(&mut self, price: Decimal) {
        self.mark_price = price;
        self.unrealized_pnl = (price - self.entry_price) * self.quantity * self.side.direction();
        self.last_updated = Utc::now();
    }

    /// Add to the position (averaging in).
    pub fn add(&mut self, quantity: Decimal, price: Decimal) {
        let total_cost = self.notional() + quantity * price;
        let new_quantity = self.quantity + quantity;

        if !new_quantity.is_zero() {
            self.entry_price = total_cost / new_quantity;
        }

        self.quantity = new_quantity;
        self.update_price(self.mark_price);
    }

    /// Reduce the position, returning the quantity actually removed.
    pub fn reduce(&mut self, quantity: Decimal) -> Decimal {
        let removed = quantity.min(self.quantity);
        self.quantity -= removed;
        self.update_price(self.mark_price);
        removed
    }

    /// Check if this position is closed (quantity is zero or negligible).
    pub fn is_closed(&self) -> bool {
        self.quantity < Decimal::new(1, 8)
    }

    /// Whether `price` has crossed the stop on the losing side.
    pub fn stop_hit(&self, price: Decimal) -> bool {
        match self.side {
            Side::Long => price <= self.stop_loss,
            Side::Short => price >= self.stop_loss,
        }
    }

    /// Ratchet the stop toward the market while the position is in profit.
    ///
    /// The stop never retreats. Returns the new stop when it moved.
    pub fn trail_stop(&mut self, price: Decimal, trailing_pct: Decimal) -> Option<Decimal> {
        let candidate = match self.side {
            Side::Long if price > self.entry_price => price * (Decimal::ONE - trailing_pct),
            Side::Short if price < self.entry_price => price * (Decimal::ONE + trailing_pct),
            _ => return None,
        };

        let improves = match self.side {
            Side::Long => candidate > self.stop_loss,
            Side::Short => candidate < self.stop_loss,
        };

        if improves {
            self.stop_loss = candidate;
            self.last_updated = Utc::now();
            Some(candidate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_pnl() {
        let mut pos = Position::new("AAPL", Side::Long, dec!(10), dec!(150), dec!(147));

        assert_eq!(pos.notional(), dec!(1500));
        assert_eq!(pos.unrealized_pnl, dec!(0));

        pos.update_price(dec!(155));
        assert_eq!(pos.unrealized_pnl, dec!(50));

        let mut short = Position::new("BTCUSDT", Side::Short, dec!(2), dec!(100), dec!(105));
        short.update_price(dec!(90));
        assert_eq!(short.unrealized_pnl, dec!(20));
    }

    #[test]
    fn test_position_averaging() {
        let mut pos = Position::new("AAPL", Side::Long, dec!(100), dec!(10), dec!(9));

        pos.add(dec!(100), dec!(12));

        assert_eq!(pos.quantity, dec!(200));
        assert_eq!(pos.entry_price, dec!(11));
        assert_eq!(pos.notional(), dec!(2200));
    }

    #[test]
    fn test_reduce_caps_at_quantity() {
        let mut pos = Position::new("AAPL", Side::Long, dec!(5), dec!(10), dec!(9));

        assert_eq!(pos.reduce(dec!(2)), dec!(2));
        assert_eq!(pos.quantity, dec!(3));
        assert_eq!(pos.reduce(dec!(10)), dec!(3));
        assert!(pos.is_closed());
    }

    #[test]
    fn test_stop_hit_is_side_aware() {
        let long = Position::new("AAPL", Side::Long, dec!(1), dec!(100), dec!(98));
        assert!(long.stop_hit(dec!(98)));
        assert!(!long.stop_hit(dec!(99)));

        let short = Position::new("AAPL", Side::Short, dec!(1), dec!(100), dec!(102));
        assert!(short.stop_hit(dec!(102.5)));
        assert!(!short.stop_hit(dec!(101)));
    }

    #[test]
    fn test_trailing_stop_never_retreats() {
        let mut pos = Position::new("AAPL", Side::Long, dec!(1), dec!(100), dec!(98));

        // Not in profit: stop stays put
        assert_eq!(pos.trail_stop(dec!(99), dec!(0.02)), None);

        assert_eq!(pos.trail_stop(dec!(110), dec!(0.02)), Some(dec!(107.80)));
        // Price falls back: stop holds
        assert_eq!(pos.trail_stop(dec!(105), dec!(0.02)), None);
        assert_eq!(pos.stop_loss, dec!(107.80));
    }

    #[test]
    fn test_short_trailing_stop_moves_down() {
        let mut pos = Position::new("ETH", Side::Short, dec!(1), dec!(100), dec!(102));

        assert_eq!(pos.trail_stop(dec!(90), dec!(0.02)), Some(dec!(91.80)));
        assert_eq!(pos.trail_stop(dec!(95), dec!(0.02)), None);
        assert_eq!(pos.stop_loss, dec!(91.80));
    }

    #[test]
    fn test_side_parsing() {
        assert_eq!("long".parse::<Side>().unwrap(), Side::Long);
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Short);
        assert!("flat".parse::<Side>().is_err());
    }
}
