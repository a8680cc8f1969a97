use crate::{HarvestError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Hard ceiling on actions per minute
pub const MAX_ACTIONS_PER_MINUTE: u32 = 15;

/// Hard ceiling on actions per hour
pub const MAX_ACTIONS_PER_HOUR: u32 = 200;

/// Hard ceiling on actions per day
pub const MAX_ACTIONS_PER_DAY: u32 = 500;

/// Source of the current time for admission checks
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A sliding window the guard enforces a ceiling over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetWindow {
    Minute,
    Hour,
    Day,
}

impl BudgetWindow {
    pub fn span(&self) -> Duration {
        match self {
            Self::Minute => Duration::minutes(1),
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::hours(24),
        }
    }
}

impl fmt::Display for BudgetWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        };
        f.write_str(s)
    }
}

/// Ceilings the guard enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetCeilings {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl BudgetCeilings {
    /// The fixed local ceilings
    pub const LOCAL: BudgetCeilings = BudgetCeilings {
        per_minute: MAX_ACTIONS_PER_MINUTE,
        per_hour: MAX_ACTIONS_PER_HOUR,
        per_day: MAX_ACTIONS_PER_DAY,
    };

    /// Combines these ceilings with an advisory; the result is never looser
    pub fn tightened_by(&self, advisory: &AdvisoryCeilings) -> BudgetCeilings {
        let pick = |local: u32, external: Option<u32>| external.map_or(local, |e| e.min(local));
        BudgetCeilings {
            per_minute: pick(self.per_minute, advisory.per_minute),
            per_hour: pick(self.per_hour, advisory.per_hour),
            per_day: pick(self.per_day, advisory.per_day),
        }
    }

    fn for_window(&self, window: BudgetWindow) -> u32 {
        match window {
            BudgetWindow::Minute => self.per_minute,
            BudgetWindow::Hour => self.per_hour,
            BudgetWindow::Day => self.per_day,
        }
    }
}

/// Optional stricter ceilings supplied from outside
///
/// Read from the `[budget]` config section or pushed at runtime. Values
/// above the local ceilings have no effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct AdvisoryCeilings {
    #[serde(rename = "per-minute", default)]
    pub per_minute: Option<u32>,

    #[serde(rename = "per-hour", default)]
    pub per_hour: Option<u32>,

    #[serde(rename = "per-day", default)]
    pub per_day: Option<u32>,
}

/// Sliding-window admission control for actions against the external site
///
/// Every action that touches the automation session must be admitted first.
/// The guard keeps an append-only log of admitted actions, pruned to the last
/// 24 hours on every check.
pub struct ActionBudgetGuard {
    log: VecDeque<DateTime<Utc>>,
    advisory: AdvisoryCeilings,
    clock: Clock,
}

impl ActionBudgetGuard {
    /// Creates a guard enforcing the local ceilings only
    pub fn new() -> Self {
        Self::with_advisory(AdvisoryCeilings::default())
    }

    /// Creates a guard with an advisory applied on top of the local ceilings
    pub fn with_advisory(advisory: AdvisoryCeilings) -> Self {
        Self {
            log: VecDeque::new(),
            advisory,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replaces the time source (used to simulate long runs)
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the advisory ceilings
    pub fn set_advisory(&mut self, advisory: AdvisoryCeilings) {
        self.advisory = advisory;
    }

    /// The ceilings currently in force
    pub fn effective_ceilings(&self) -> BudgetCeilings {
        BudgetCeilings::LOCAL.tightened_by(&self.advisory)
    }

    /// Admits one action now, or fails with `RateLimitExceeded`
    pub fn admit(&mut self) -> Result<()> {
        let now = (self.clock)();
        self.admit_at(now)
    }

    /// Admits one action at the given time
    ///
    /// Prunes entries older than 24 hours, then checks the minute, hour and
    /// day ceilings. A denied action is not logged.
    pub fn admit_at(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.prune(now);

        let ceilings = self.effective_ceilings();
        for window in [BudgetWindow::Minute, BudgetWindow::Hour, BudgetWindow::Day] {
            let limit = ceilings.for_window(window);
            if self.count_within(now, window) >= limit as usize {
                let retry_after = (self.next_admission_at(now) - now)
                    .to_std()
                    .unwrap_or_default();
                tracing::warn!(
                    "Action budget exhausted: {} actions in the last {}, next admission in {:?}",
                    limit,
                    window,
                    retry_after
                );
                return Err(HarvestError::RateLimitExceeded {
                    window,
                    limit,
                    retry_after,
                });
            }
        }

        self.log.push_back(now);
        Ok(())
    }

    /// Earliest time at which an action would be admitted
    ///
    /// For every window at its ceiling, that is when enough of the oldest
    /// entries inside the window have aged out to leave one free slot.
    /// Returns `now` if nothing is exhausted.
    pub fn next_admission_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ceilings = self.effective_ceilings();
        let mut earliest = now;

        for window in [BudgetWindow::Minute, BudgetWindow::Hour, BudgetWindow::Day] {
            let limit = ceilings.for_window(window) as usize;
            let cutoff = now - window.span();
            let inside: Vec<&DateTime<Utc>> = self.log.iter().filter(|ts| **ts > cutoff).collect();
            if inside.len() < limit {
                continue;
            }

            // The log is in admission order, so `inside` is oldest first
            let frees_slot = inside[inside.len() - limit];
            earliest = earliest.max(*frees_slot + window.span());
        }

        earliest
    }

    /// Number of actions currently in the log
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Actions still available in each window at the given time
    pub fn remaining_at(&self, now: DateTime<Utc>) -> BudgetCeilings {
        let ceilings = self.effective_ceilings();
        let left = |window: BudgetWindow| {
            ceilings
                .for_window(window)
                .saturating_sub(self.count_within(now, window) as u32)
        };
        BudgetCeilings {
            per_minute: left(BudgetWindow::Minute),
            per_hour: left(BudgetWindow::Hour),
            per_day: left(BudgetWindow::Day),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - BudgetWindow::Day.span();
        while self.log.front().is_some_and(|ts| *ts <= cutoff) {
            self.log.pop_front();
        }
    }

    fn count_within(&self, now: DateTime<Utc>, window: BudgetWindow) -> usize {
        let cutoff = now - window.span();
        self.log.iter().filter(|ts| **ts > cutoff).count()
    }
}

impl Default for ActionBudgetGuard {
    fn default() -> Self {
        Self::new()
    }
}
