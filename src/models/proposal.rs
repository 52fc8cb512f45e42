//! Inputs to the risk gate: trade proposals, account snapshots and broker fills.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Position, Side};
use crate::risk::RiskConfig;

/// A trade a strategy wants to open. Created per evaluation, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeProposal {
    pub symbol: String,

    pub side: Side,

    /// Planned entry price
    pub entry_price: Decimal,

    /// Protective stop-loss price
    pub stop_loss: Decimal,

    /// Fraction of equity to risk on this trade (0.0 to 1.0)
    pub risk_pct: Decimal,

    /// Minimum tradable increment for this instrument, if it differs from the configured default
    #[serde(default)]
    pub lot_size: Option<Decimal>,
}

impl TradeProposal {
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        entry_price: Decimal,
        stop_loss: Decimal,
        risk_pct: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            entry_price,
            stop_loss,
            risk_pct,
            lot_size: None,
        }
    }

    /// Proposal whose stop sits `default_stop_loss_pct` away from the entry.
    pub fn with_default_stop(
        symbol: impl Into<String>,
        side: Side,
        entry_price: Decimal,
        risk_pct: Decimal,
        config: &RiskConfig,
    ) -> Self {
        let stop_loss = config.default_stop_price(side, entry_price);
        Self::new(symbol, side, entry_price, stop_loss, risk_pct)
    }

    pub fn with_lot_size(mut self, lot_size: Decimal) -> Self {
        self.lot_size = Some(lot_size);
        self
    }

    /// Loss per unit if the stop is hit.
    pub fn price_risk(&self) -> Decimal {
        (self.entry_price - self.stop_loss).abs()
    }
}

/// Broker-side view of the account at evaluation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Account equity in quote currency
    pub equity: Decimal,

    /// Open positions keyed by symbol
    #[serde(default)]
    pub positions: HashMap<String, Position>,
}

impl AccountSnapshot {
    pub fn new(equity: Decimal) -> Self {
        Self {
            equity,
            positions: HashMap::new(),
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.positions.insert(position.symbol.clone(), position);
        self
    }

    pub fn open_positions(&self) -> usize {
        self.positions.len()
    }
}

/// Execution report from the broker for an approved trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    /// Reservation returned with the approval, when the fill answers one
    #[serde(default)]
    pub reservation_id: Option<Uuid>,

    pub symbol: String,

    pub side: Side,

    /// Quantity actually executed
    pub quantity: Decimal,

    /// Average execution price
    pub price: Decimal,

    /// Stop-loss placed with the order
    pub stop_loss: Decimal,
}

impl Fill {
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        stop_loss: Decimal,
    ) -> Self {
        Self {
            reservation_id: None,
            symbol: symbol.into(),
            side,
            quantity,
            price,
            stop_loss,
        }
    }

    pub fn for_reservation(mut self, reservation_id: Uuid) -> Self {
        self.reservation_id = Some(reservation_id);
        self
    }

    pub fn into_position(self) -> Position {
        Position::new(self.symbol, self.side, self.quantity, self.price, self.stop_loss)
    }
}
