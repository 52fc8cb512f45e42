//! Pre-trade risk management for automated trading.
//!
//! Every trade a strategy proposes goes through [`risk::RiskGate::evaluate`],
//! which sizes it from the account's risk budget and checks it against the
//! exposure limits and the daily circuit breaker. Approved trades reserve
//! their exposure until the broker fill is confirmed.

pub mod db;
pub mod models;
pub mod risk;
