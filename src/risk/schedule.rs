//! Trading-day boundary and the background daily-reset task.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

use super::{RiskError, RiskGate};

/// When the circuit breaker's trading day rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyReset {
    /// Only an explicit `reset_daily` call starts a new day.
    Manual,
    /// The day rolls at this UTC wall-clock time.
    UtcTime(NaiveTime),
}

impl DailyReset {
    /// Most recent boundary instant at or before `now`.
    pub fn last_boundary(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let DailyReset::UtcTime(at) = self else {
            return None;
        };

        let today = now.date_naive().and_time(*at).and_utc();
        if today <= now {
            Some(today)
        } else {
            Some(today - chrono::Duration::days(1))
        }
    }

    /// Whether a boundary lies in `(last_reset, now]`.
    pub fn is_due(&self, last_reset: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.last_boundary(now)
            .is_some_and(|boundary| boundary > last_reset)
    }
}

impl Default for DailyReset {
    fn default() -> Self {
        DailyReset::UtcTime(NaiveTime::MIN)
    }
}

impl fmt::Display for DailyReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DailyReset::Manual => f.write_str("manual"),
            DailyReset::UtcTime(at) => write!(f, "{} UTC", at.format("%H:%M")),
        }
    }
}

impl FromStr for DailyReset {
    type Err = RiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("manual") {
            return Ok(DailyReset::Manual);
        }

        NaiveTime::parse_from_str(s, "%H:%M")
            .map(DailyReset::UtcTime)
            .map_err(|e| RiskError::config("daily_reset", format!("expected HH:MM or 'manual': {e}")))
    }
}

/// Spawn a task that rolls the trading day whenever a boundary passes.
///
/// The task checks every `period`; a reset already performed for the current
/// boundary is not repeated. The time of each applied reset is sent on
/// `resets` so the owner can persist the new day.
pub fn spawn_daily_reset(
    gate: Arc<RiskGate>,
    period: Duration,
    resets: mpsc::UnboundedSender<DateTime<Utc>>,
) -> JoinHandle<()> {
    info!(schedule = %gate.config().daily_reset, "Starting daily reset scheduler");

    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if gate.roll_day_if_due(now) {
                debug!("Scheduled daily reset applied");
                if resets.send(now).is_err() {
                    debug!("Reset listener gone");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_last_boundary_before_and_after_cutover() {
        let schedule: DailyReset = "13:30".parse().unwrap();

        assert_eq!(schedule.last_boundary(at(14, 0)), Some(at(13, 30)));
        assert_eq!(
            schedule.last_boundary(at(9, 0)),
            Some(at(13, 30) - chrono::Duration::days(1))
        );
    }

    #[test]
    fn test_is_due_once_per_boundary() {
        let schedule: DailyReset = "13:30".parse().unwrap();

        assert!(schedule.is_due(at(9, 0), at(13, 30)));
        assert!(!schedule.is_due(at(13, 30), at(20, 0)));
        assert!(!schedule.is_due(at(13, 45), at(23, 59)));
    }

    #[test]
    fn test_manual_is_never_due() {
        assert!(!DailyReset::Manual.is_due(at(0, 0) - chrono::Duration::days(7), at(12, 0)));
        assert_eq!("MANUAL".parse::<DailyReset>().unwrap(), DailyReset::Manual);
    }

    #[test]
    fn test_rejects_bad_time() {
        assert!("25:00".parse::<DailyReset>().is_err());
        assert!("noon".parse::<DailyReset>().is_err());
    }

    #[tokio::test]
    async fn test_scheduler_leaves_manual_day_alone() {
        let config = crate::risk::RiskConfig {
            daily_reset: DailyReset::Manual,
            ..Default::default()
        };
        let gate = Arc::new(RiskGate::new(config).unwrap());
        gate.manual_halt();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_daily_reset(gate.clone(), Duration::from_millis(5), tx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();

        assert!(!gate.can_trade());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scheduler_reports_applied_reset() {
        let config = crate::risk::RiskConfig::default();
        let gate = RiskGate::new(config.clone()).unwrap();
        gate.manual_halt();

        let mut snapshot = gate.snapshot();
        snapshot.breaker.last_reset = Utc::now() - chrono::Duration::days(2);
        let gate = Arc::new(RiskGate::restore(config, snapshot).unwrap());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_daily_reset(gate.clone(), Duration::from_millis(5), tx);
        let reset_at = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        handle.abort();

        let reset_at = reset_at.unwrap().unwrap();
        assert!(gate.can_trade());
        assert_eq!(gate.metrics().last_reset, reset_at);
    }
}
