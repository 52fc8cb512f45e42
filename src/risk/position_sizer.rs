//! Fixed-fractional position sizing: risk budget divided by stop distance.

use rust_decimal::Decimal;
use tracing::debug;

use super::{InvalidInput, RiskConfig};
use crate::models::{Side, TradeProposal};

/// Result of sizing a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizedOrder {
    /// Units to trade, a whole multiple of the lot size
    pub quantity: Decimal,

    /// `quantity * entry_price`
    pub notional: Decimal,

    /// Loss if the stop is hit at this quantity
    pub risk_amount: Decimal,

    /// True when the max position size, not the risk budget, set the quantity
    pub capped: bool,
}

/// Calculator for order quantities.
pub struct PositionSizer {
    config: RiskConfig,
}

impl PositionSizer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Size a proposal against the given account equity.
    ///
    /// Also rejects stops placed on the profitable side of the entry.
    pub fn size(&self, proposal: &TradeProposal, equity: Decimal) -> Result<SizedOrder, InvalidInput> {
        let wrong_side = match proposal.side {
            Side::Long => proposal.stop_loss > proposal.entry_price,
            Side::Short => proposal.stop_loss < proposal.entry_price,
        };
        if wrong_side {
            return Err(InvalidInput::StopOnWrongSide {
                side: proposal.side,
                entry: proposal.entry_price,
                stop: proposal.stop_loss,
            });
        }

        let lot_size = proposal.lot_size.unwrap_or(self.config.default_lot_size);
        let (quantity, capped) = self.quantity_for(
            equity,
            proposal.risk_pct,
            proposal.entry_price,
            proposal.stop_loss,
            lot_size,
        )?;

        let sized = SizedOrder {
            quantity,
            notional: quantity * proposal.entry_price,
            risk_amount: quantity * proposal.price_risk(),
            capped,
        };

        debug!(
            symbol = %proposal.symbol,
            quantity = %sized.quantity,
            notional = %sized.notional,
            risk_amount = %sized.risk_amount,
            capped = sized.capped,
            "Sized proposal"
        );

        Ok(sized)
    }

    /// Quantity `Q` with `Q * |entry - stop| <= equity * risk_pct`, rounded down to `lot_size`.
    ///
    /// When the resulting notional would exceed the max position size, the
    /// limit-derived quantity is used instead.
    pub fn calculate_quantity(
        &self,
        equity: Decimal,
        risk_pct: Decimal,
        entry: Decimal,
        stop: Decimal,
        lot_size: Decimal,
    ) -> Result<Decimal, InvalidInput> {
        self.quantity_for(equity, risk_pct, entry, stop, lot_size)
            .map(|(quantity, _)| quantity)
    }

    fn quantity_for(
        &self,
        equity: Decimal,
        risk_pct: Decimal,
        entry: Decimal,
        stop: Decimal,
        lot_size: Decimal,
    ) -> Result<(Decimal, bool), InvalidInput> {
        if equity <= Decimal::ZERO {
            return Err(InvalidInput::NonPositiveEquity(equity));
        }
        if risk_pct <= Decimal::ZERO || risk_pct > self.config.max_position_size_pct {
            return Err(InvalidInput::RiskOutOfRange {
                risk: risk_pct,
                max: self.config.max_position_size_pct,
            });
        }
        positive("entry_price", entry)?;
        positive("stop_loss", stop)?;
        positive("lot_size", lot_size)?;

        let price_risk = (entry - stop).abs();
        if price_risk.is_zero() {
            return Err(InvalidInput::ZeroPriceRisk);
        }

        let by_risk = equity
            .checked_mul(risk_pct)
            .and_then(|budget| budget.checked_div(price_risk))
            .ok_or(InvalidInput::SizeOverflow)?;

        let by_limit = equity
            .checked_mul(self.config.max_position_size_pct)
            .and_then(|max_notional| max_notional.checked_div(entry))
            .ok_or(InvalidInput::SizeOverflow)?;

        let capped = by_limit < by_risk;
        let quantity = round_down(by_risk.min(by_limit), lot_size)?;

        Ok((quantity, capped))
    }
}

/// Round `quantity` down to a whole number of lots.
fn round_down(quantity: Decimal, lot_size: Decimal) -> Result<Decimal, InvalidInput> {
    quantity
        .checked_div(lot_size)
        .and_then(|lots| lots.floor().checked_mul(lot_size))
        .map(|q| q.normalize())
        .ok_or(InvalidInput::SizeOverflow)
}

fn positive(field: &'static str, value: Decimal) -> Result<(), InvalidInput> {
    if value <= Decimal::ZERO {
        return Err(InvalidInput::NonPositive { field, value });
    }
    Ok(())
}
