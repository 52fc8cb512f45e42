//! Risk gate operator CLI
//!
//! Evaluates trade proposals, records fills and closes, and manages the
//! circuit breaker. State is kept in SQLite between invocations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn, Level};
use tokio::sync::mpsc;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use omnitrade_risk::db::Database;
use omnitrade_risk::models::{AccountSnapshot, Fill, Side, TradeProposal};
use omnitrade_risk::risk::{spawn_daily_reset, RiskConfig, RiskGate};

/// Pre-trade risk gate CLI.
#[derive(Parser)]
#[command(name = "riskctl")]
#[command(about = "Size trades and enforce exposure limits and daily circuit breakers", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "RISK_DATABASE_URL", default_value = "sqlite:./riskctl.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration
    Config,

    /// Show breaker state, exposure and open positions
    Status,

    /// Evaluate a trade proposal and reserve its exposure if approved
    Evaluate {
        /// Instrument symbol
        symbol: String,

        /// Trade direction (long, short)
        side: Side,

        /// Planned entry price
        #[arg(short, long)]
        entry: Decimal,

        /// Stop-loss price (defaults to the configured stop distance)
        #[arg(short, long)]
        stop: Option<Decimal>,

        /// Fraction of equity to risk (0.01 = 1%)
        #[arg(short, long, default_value = "0.01")]
        risk: Decimal,

        /// Current account equity
        #[arg(short = 'q', long)]
        equity: Decimal,

        /// Lot size for this instrument
        #[arg(long)]
        lot: Option<Decimal>,
    },

    /// Record a broker fill
    Fill {
        symbol: String,

        side: Side,

        /// Filled quantity
        #[arg(short, long)]
        quantity: Decimal,

        /// Average fill price
        #[arg(short, long)]
        price: Decimal,

        /// Stop-loss placed with the order
        #[arg(short, long)]
        stop: Decimal,

        /// Reservation id from the approval
        #[arg(short, long)]
        reservation: Option<Uuid>,
    },

    /// Record a realized close
    Close {
        symbol: String,

        /// Realized P&L of the close
        #[arg(short, long, allow_hyphen_values = true)]
        pnl: Decimal,

        /// Quantity closed; omit for a full close
        #[arg(short, long)]
        quantity: Option<Decimal>,
    },

    /// Mark a position to market and check its stop
    Mark {
        symbol: String,

        /// Current market price
        price: Decimal,
    },

    /// Halt trading until resumed or the next daily reset
    Halt,

    /// Resume trading after a halt or trip
    Resume,

    /// Start a new trading day now
    ResetDaily,

    /// Recompute exposure from the open positions
    Reconcile,

    /// Show recent decisions and closes
    History {
        /// Number of rows per table
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Run the daily reset scheduler until Ctrl+C
    Watch {
        /// Check interval in seconds
        #[arg(short, long, default_value = "60")]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = RiskConfig::from_env().context("Invalid risk configuration")?;

    // Initialize database and restore the gate
    let db = Database::new(&cli.database).await?;
    let gate = match db.load_snapshot().await? {
        Some(snapshot) => RiskGate::restore(config, snapshot)?,
        None => RiskGate::new(config)?,
    };

    if gate.roll_day_if_due(Utc::now()) {
        info!("Trading day rolled over since last run");
    }

    match cli.command {
        Commands::Config => print_config(gate.config()),

        Commands::Status => {
            let metrics = gate.metrics();
            let (total, approved, rejected) = db
                .decision_stats()
                .await
                .context("Failed to load decision stats")?;

            println!("\n=== Circuit Breaker ===");
            println!("Can Trade:        {}", if metrics.can_trade { "Yes" } else { "No" });
            println!(
                "Tripped:          {}",
                metrics
                    .trip_reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "No".to_string())
            );
            println!("Trips Today:      {}", metrics.trips_today);
            println!("Daily P&L:        ${:.2} ({:.2}%)", metrics.daily_pnl, metrics.daily_pnl_pct * dec!(100));
            println!("Losing Streak:    {}", metrics.consecutive_losses);
            println!("Last Reset:       {}", metrics.last_reset.format("%Y-%m-%d %H:%M:%S UTC"));

            println!("\n=== Exposure ===");
            println!(
                "Equity:           {}",
                metrics
                    .equity
                    .map(|e| format!("${:.2}", e))
                    .unwrap_or_else(|| "Unknown".to_string())
            );
            println!("Exposure:         ${:.2} ({:.1}%)", metrics.total_exposure, metrics.exposure_pct * dec!(100));
            println!("Open Positions:   {}", metrics.open_positions);
            println!("Reservations:     {} (${:.2})", metrics.pending_reservations, metrics.reserved_notional);

            println!("\n=== Decisions ===");
            println!("Total:            {}", total);
            println!("Approved:         {}", approved);
            println!("Rejected:         {}", rejected);

            let positions = gate.positions();
            if !positions.is_empty() {
                println!(
                    "\n{:<12} {:<6} {:>12} {:>12} {:>12} {:>12}",
                    "SYMBOL", "SIDE", "QTY", "ENTRY", "STOP", "P&L"
                );
                println!("{}", "-".repeat(71));
                for pos in &positions {
                    println!(
                        "{:<12} {:<6} {:>12} {:>12.4} {:>12.4} {:>12.2}",
                        truncate(&pos.symbol, 12),
                        pos.side.as_str(),
                        pos.quantity,
                        pos.entry_price,
                        pos.stop_loss,
                        pos.unrealized_pnl
                    );
                }
            }
        }

        Commands::Evaluate {
            symbol,
            side,
            entry,
            stop,
            risk,
            equity,
            lot,
        } => {
            let mut proposal = match stop {
                Some(stop) => TradeProposal::new(symbol, side, entry, stop, risk),
                None => TradeProposal::with_default_stop(symbol, side, entry, risk, gate.config()),
            };
            if let Some(lot) = lot {
                proposal = proposal.with_lot_size(lot);
            }

            let decision = gate.evaluate(&proposal, &AccountSnapshot::new(equity));
            db.record_decision(&decision, side).await?;

            if decision.approved {
                println!("\nAPPROVED {} {}", proposal.side, proposal.symbol);
                println!("Quantity:     {}", decision.quantity.unwrap_or_default());
                println!("Notional:     ${:.2}", decision.notional.unwrap_or_default());
                println!("Stop Loss:    {}", proposal.stop_loss);
                println!("Reservation:  {}", decision.id);
                println!(
                    "\nConfirm with: riskctl fill {} {} -q <qty> -p <price> -s {} -r {}",
                    proposal.symbol,
                    proposal.side.as_str().to_lowercase(),
                    proposal.stop_loss,
                    decision.id
                );
            } else {
                println!("\nREJECTED {} {}", proposal.side, proposal.symbol);
                println!("Reason:       {}", decision.reason());
            }
        }

        Commands::Fill {
            symbol,
            side,
            quantity,
            price,
            stop,
            reservation,
        } => {
            let mut fill = Fill::new(symbol, side, quantity, price, stop);
            if let Some(id) = reservation {
                fill = fill.for_reservation(id);
            }

            let report = gate.confirm_fill(fill)?;
            println!(
                "Recorded {} {} {} @ {:.4} (exposure {:.1}%)",
                report.position.side,
                report.position.quantity,
                report.position.symbol,
                report.position.entry_price,
                report.exposure_pct * dec!(100)
            );
            for breach in &report.breaches {
                println!("  WARNING: {}", breach);
            }
        }

        Commands::Close {
            symbol,
            pnl,
            quantity,
        } => {
            let tripped = match quantity {
                Some(quantity) => gate.record_partial_close(&symbol, quantity, pnl)?,
                None => gate.record_trade_close(&symbol, pnl),
            };
            db.record_close(&symbol, quantity, pnl, tripped).await?;

            println!("Recorded close of {} (P&L ${:.2})", symbol, pnl);
            if let Some(reason) = tripped {
                println!("CIRCUIT BREAKER TRIPPED: {}", reason);
            }
        }

        Commands::Mark { symbol, price } => match gate.mark_price(&symbol, price) {
            Some(check) => {
                println!(
                    "{} @ {:.4} | stop {:.4} | P&L ${:.2}",
                    check.symbol, check.mark_price, check.stop_loss, check.unrealized_pnl
                );
                if let Some(stop) = check.trailed_to {
                    println!("  Trailing stop moved to {:.4}", stop);
                }
                if check.triggered {
                    println!("  STOP HIT: close the position");
                }
            }
            None => println!("No open position for {}", symbol),
        },

        Commands::Halt => {
            if gate.manual_halt() {
                println!("Trading halted.");
            } else {
                println!("Trading already halted.");
            }
        }

        Commands::Resume => {
            if gate.manual_resume() {
                println!("Trading resumed.");
            } else {
                println!("Trading was not halted.");
            }
        }

        Commands::ResetDaily => {
            gate.reset_daily();
            println!("Daily counters reset.");
        }

        Commands::Reconcile => match gate.reconcile() {
            Some(drift) => println!(
                "Exposure corrected: ${:.2} -> ${:.2} ({:.2})",
                drift.cached,
                drift.recomputed,
                drift.difference()
            ),
            None => println!("Exposure consistent with open positions."),
        },

        Commands::History { limit } => {
            let decisions = db.recent_decisions(limit).await?;
            println!(
                "\n{:<20} {:<12} {:<6} {:<9} {:>12} {}",
                "TIME", "SYMBOL", "SIDE", "RESULT", "QTY", "REASON"
            );
            println!("{}", "-".repeat(90));
            for d in &decisions {
                println!(
                    "{:<20} {:<12} {:<6} {:<9} {:>12} {}",
                    truncate(&d.evaluated_at, 19),
                    truncate(&d.symbol, 12),
                    d.side,
                    if d.approved { "APPROVED" } else { "REJECTED" },
                    d.quantity.as_deref().unwrap_or("-"),
                    truncate(&d.reason, 40)
                );
            }

            let closes = db.recent_closes(limit).await?;
            println!("\n{:<20} {:<12} {:>12} {:>12} {}", "TIME", "SYMBOL", "QTY", "P&L", "TRIP");
            println!("{}", "-".repeat(72));
            for c in &closes {
                println!(
                    "{:<20} {:<12} {:>12} {:>12} {}",
                    truncate(&c.closed_at, 19),
                    truncate(&c.symbol, 12),
                    c.quantity.as_deref().unwrap_or("all"),
                    c.realized_pnl,
                    c.trip_reason.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Watch { interval } => {
            let gate = Arc::new(gate);
            let (resets_tx, mut resets) = mpsc::unbounded_channel();
            let handle = spawn_daily_reset(gate.clone(), Duration::from_secs(interval.max(1)), resets_tx);

            println!("\nWatching for daily resets ({}).", gate.config().daily_reset);
            println!("Press Ctrl+C to stop.\n");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    Some(at) = resets.recv() => {
                        db.save_snapshot(&gate.snapshot()).await?;
                        println!("[{}] Trading day rolled over", at.format("%Y-%m-%d %H:%M:%S UTC"));
                    }
                }
            }
            handle.abort();

            println!("\nStopping scheduler...");
            db.save_snapshot(&gate.snapshot()).await?;
            return Ok(());
        }
    }

    db.save_snapshot(&gate.snapshot()).await?;
    if !gate.can_trade() {
        warn!("Trading is currently halted");
    }

    Ok(())
}

fn print_config(config: &RiskConfig) {
    let pct = |v: Decimal| v * dec!(100);

    println!("\n=== Risk Configuration ===\n");
    println!("Position Sizing:");
    println!("  Max Position Size:    {}%", pct(config.max_position_size_pct));
    println!("  Default Stop Loss:    {}%", pct(config.default_stop_loss_pct));
    println!("  Trailing Stop:        {}%", pct(config.trailing_stop_pct));
    println!("  Default Lot Size:     {}", config.default_lot_size);
    println!("  Min Order:            ${}", config.min_order_notional);

    println!("\nExposure:");
    println!("  Max Total Exposure:   {}%", pct(config.max_total_exposure_pct));
    println!("  Max Open Positions:   {}", config.max_open_positions);
    println!("  Drift Tolerance:      ${}", config.drift_tolerance);
    println!("  Reservation TTL:      {}s", config.reservation_ttl_secs);

    println!("\nCircuit Breaker:");
    println!("  Daily Loss Limit:     {}%", pct(config.daily_loss_limit_pct));
    println!("  Max Losing Streak:    {}", config.max_consecutive_losses);
    println!("  Daily Reset:          {}", config.daily_reset);
    println!("  Trading Enabled:      {}", config.trading_enabled);
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
