//! Database persistence for the risk gate.
//!
//! Stores everything needed to resume after restart:
//! - The gate snapshot (breaker counters, open positions, reservations)
//! - A journal of realized closes
//! - An audit trail of every evaluation decision

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::Side;
use crate::risk::{Decision, RiskSnapshot, TripReason};

/// Database connection pool with risk state management.
pub struct Database {
    pool: SqlitePool,
}

/// Stored realized close.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredClose {
    pub id: i64,
    pub symbol: String,
    /// Quantity closed; NULL for a full close
    pub quantity: Option<String>,
    pub realized_pnl: String,
    pub partial: bool,
    pub trip_reason: Option<String>,
    pub closed_at: String,
}

/// Stored evaluation decision.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredDecision {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub approved: bool,
    pub quantity: Option<String>,
    pub notional: Option<String>,
    pub code: Option<String>,
    pub reason: String,
    pub evaluated_at: String,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Each connection to an in-memory database sees its own empty database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Gate snapshot, single row
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS risk_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                snapshot TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_closes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                quantity TEXT,
                realized_pnl TEXT NOT NULL,
                partial INTEGER NOT NULL DEFAULT 0,
                trip_reason TEXT,
                closed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS decisions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                approved INTEGER NOT NULL,
                quantity TEXT,
                notional TEXT,
                code TEXT,
                reason TEXT NOT NULL,
                evaluated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trade_closes_time ON trade_closes(closed_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_decisions_time ON decisions(evaluated_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Gate State ====================

    /// Save the gate snapshot, replacing the previous one.
    pub async fn save_snapshot(&self, snapshot: &RiskSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot).context("Failed to serialize risk snapshot")?;

        sqlx::query(
            r#"
            INSERT INTO risk_state (id, snapshot, updated_at)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load the last saved snapshot, if any.
    pub async fn load_snapshot(&self) -> Result<Option<RiskSnapshot>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT snapshot FROM risk_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(json,)| serde_json::from_str(&json).context("Corrupt risk snapshot"))
            .transpose()
    }

    // ==================== Closes ====================

    /// Journal a realized close. `quantity` is `None` for a full close.
    pub async fn record_close(
        &self,
        symbol: &str,
        quantity: Option<Decimal>,
        realized_pnl: Decimal,
        trip_reason: Option<TripReason>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_closes (symbol, quantity, realized_pnl, partial, trip_reason, closed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(symbol)
        .bind(quantity.map(|q| q.to_string()))
        .bind(realized_pnl.to_string())
        .bind(quantity.is_some())
        .bind(trip_reason.map(|r| r.as_str()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent closes, newest first.
    pub async fn recent_closes(&self, limit: i64) -> Result<Vec<StoredClose>> {
        sqlx::query_as::<_, StoredClose>(
            "SELECT * FROM trade_closes ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load closes")
    }

    // ==================== Decisions ====================

    /// Append an evaluation decision to the audit trail.
    pub async fn record_decision(&self, decision: &Decision, side: Side) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO decisions (id, symbol, side, approved, quantity, notional, code, reason, evaluated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(decision.id.to_string())
        .bind(&decision.symbol)
        .bind(side.as_str())
        .bind(decision.approved)
        .bind(decision.quantity.map(|q| q.to_string()))
        .bind(decision.notional.map(|n| n.to_string()))
        .bind(decision.rejection.as_ref().map(|r| r.code()))
        .bind(decision.reason())
        .bind(decision.evaluated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent decisions, newest first.
    pub async fn recent_decisions(&self, limit: i64) -> Result<Vec<StoredDecision>> {
        sqlx::query_as::<_, StoredDecision>(
            "SELECT * FROM decisions ORDER BY evaluated_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load decisions")
    }

    /// Counts of (total, approved, rejected) decisions.
    pub async fn decision_stats(&self) -> Result<(i64, i64, i64)> {
        let (total, approved): (i64, Option<i64>) =
            sqlx::query_as("SELECT COUNT(*), SUM(approved) FROM decisions")
                .fetch_one(&self.pool)
                .await?;
        let approved = approved.unwrap_or(0);

        Ok((total, approved, total - approved))
    }
}
