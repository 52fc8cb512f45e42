//! Data models for positions, trade proposals, account snapshots and fills.

mod position;
mod proposal;

pub use position::{Position, Side};
pub use proposal::{AccountSnapshot, Fill, TradeProposal};
