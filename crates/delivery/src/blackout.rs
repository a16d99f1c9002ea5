//! Blackout windows — prevents messaging during observance periods.
//!
//! Window tables are computed once per locality per calendar day by a
//! `WindowSource` and cached; the previous day's table is retained as a
//! shifted fallback when a refresh fails. Seasonal calendars (an extended
//! annual fasting-period blackout) are an extra interval set merged with
//! the daily windows, not a special-cased code path.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tabletalk_core::boundary::{BlackoutInterval, WindowSource};
use tabletalk_core::config::BlackoutConfig;
use tracing::{debug, info, warn};

/// Answer to "may we send at this instant?".
#[derive(Debug, Clone, PartialEq)]
pub struct BlackoutDecision {
    pub blocked: bool,
    /// Earliest instant at or after the queried one that is outside every
    /// buffered window. Equals the queried instant when not blocked.
    pub next_permissible: DateTime<Utc>,
    /// Label of the window that blocked the send, when one did.
    pub window: Option<String>,
}

pub struct BlackoutWindowProvider {
    source: Arc<dyn WindowSource>,
    config: BlackoutConfig,
    tables: DashMap<(String, NaiveDate), Vec<BlackoutInterval>>,
    seasonal: DashMap<String, Vec<BlackoutInterval>>,
}

impl BlackoutWindowProvider {
    pub fn new(source: Arc<dyn WindowSource>, config: BlackoutConfig) -> Self {
        Self {
            source,
            config,
            tables: DashMap::new(),
            seasonal: DashMap::new(),
        }
    }

    /// Refreshes the window table for one locality and day. On source
    /// failure the previous day's table is shifted forward 24h and kept as
    /// a stale stand-in, so a flaky timetable feed degrades instead of
    /// blanking the cache.
    pub fn refresh(&self, locality: &str, date: NaiveDate) {
        match self.source.day_table(locality, date) {
            Ok(mut intervals) => {
                intervals.sort_by_key(|i| i.start);
                self.tables.insert((locality.to_string(), date), intervals);
            }
            Err(err) => {
                warn!(locality, %date, error = %err, "Window table refresh failed");
                let previous = date.pred_opt().and_then(|prev| {
                    self.tables
                        .get(&(locality.to_string(), prev))
                        .map(|t| t.value().clone())
                });
                if let Some(previous) = previous {
                    let shifted: Vec<BlackoutInterval> = previous
                        .into_iter()
                        .map(|i| BlackoutInterval {
                            start: i.start + Duration::days(1),
                            end: i.end + Duration::days(1),
                            label: i.label,
                        })
                        .collect();
                    warn!(locality, %date, "Falling back to previous day's windows");
                    self.tables.insert((locality.to_string(), date), shifted);
                }
            }
        }
    }

    /// Background refresh: re-derives today's and tomorrow's tables for
    /// each served locality once per interval. Runs independently of
    /// scheduling and dispatch.
    pub async fn run_refresh(
        self: Arc<Self>,
        localities: Vec<String>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(
            self.config.refresh_interval_secs,
        ));
        info!(localities = localities.len(), "Blackout window refresh started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let today = Utc::now().date_naive();
                    for locality in &localities {
                        self.refresh(locality, today);
                        if let Some(tomorrow) = today.succ_opt() {
                            self.refresh(locality, tomorrow);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Blackout window refresh stopping");
                    return;
                }
            }
        }
    }

    /// Installs a seasonal interval set for a locality, merged with the
    /// daily windows on every check.
    pub fn set_seasonal(&self, locality: &str, intervals: Vec<BlackoutInterval>) {
        self.seasonal.insert(locality.to_string(), intervals);
    }

    pub fn clear_seasonal(&self, locality: &str) {
        self.seasonal.remove(locality);
    }

    /// Reports whether `instant` falls inside a prohibited send window and
    /// the next permissible instant. Unknown localities/days follow the
    /// configured fail mode; the default fails closed so a stale-data bug
    /// cannot cause a send during an observance.
    pub fn check(&self, locality: &str, instant: DateTime<Utc>) -> BlackoutDecision {
        let date = instant.date_naive();
        if !self.tables.contains_key(&(locality.to_string(), date)) {
            if self.config.fail_open {
                // Seasonal intervals still apply below.
                debug!(locality, %instant, "No window table; failing open");
            } else {
                warn!(locality, %instant, "No window table; failing closed");
                return BlackoutDecision {
                    blocked: true,
                    next_permissible: instant
                        + Duration::minutes(self.config.unknown_probe_minutes),
                    window: None,
                };
            }
        }

        let intervals = self.intervals_around(locality, date);
        let buffer = Duration::minutes(self.config.buffer_minutes);

        let mut candidate = instant;
        let mut window = None;
        // Bounded walk: each hit moves the candidate past one buffered
        // window, and re-scans in case it landed inside the next one.
        for _ in 0..intervals.len() + 1 {
            let hit = intervals
                .iter()
                .find(|i| i.start - buffer <= candidate && candidate < i.end + buffer);
            match hit {
                Some(hit) => {
                    candidate = hit.end + buffer;
                    window.get_or_insert_with(|| hit.label.clone());
                }
                None => break,
            }
        }

        BlackoutDecision {
            blocked: candidate != instant,
            next_permissible: candidate,
            window,
        }
    }

    /// Daily tables for the day and its neighbors (buffered intervals can
    /// straddle midnight) plus any seasonal set, sorted by start.
    fn intervals_around(&self, locality: &str, date: NaiveDate) -> Vec<BlackoutInterval> {
        let mut intervals = Vec::new();
        for day in [date.pred_opt(), Some(date), date.succ_opt()].into_iter().flatten() {
            if let Some(table) = self.tables.get(&(locality.to_string(), day)) {
                intervals.extend(table.value().clone());
            }
        }
        if let Some(seasonal) = self.seasonal.get(locality) {
            intervals.extend(seasonal.value().clone());
        }
        intervals.sort_by_key(|i| i.start);
        intervals
    }
}
