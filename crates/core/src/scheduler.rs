//! Scheduler clock: turns a schedule policy into due logical intervals.

use crate::config::SchedulerConfig;
use crate::error::SchedulingError;
use crate::storage::RunStore;
use crate::types::{GraphDefinition, LogicalInterval};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::str::FromStr;
use std::sync::Arc;

/// Parsed schedule policy of a graph
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Manual triggers only
    None,
    /// A single interval at the start date
    Once,
    /// Fixed period starting at the start date
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    /// Parse a schedule expression.
    ///
    /// Accepts `none`, `@once`, the `@hourly`/`@daily`/`@weekly`/`@monthly`/`@yearly`
    /// presets, `every <n><s|m|h|d>` and 5- or 6-field cron expressions.
    pub fn parse(expression: Option<&str>) -> Result<Self, SchedulingError> {
        let Some(raw) = expression.map(str::trim) else {
            return Ok(Schedule::None);
        };

        let lowered = raw.to_ascii_lowercase();
        let cron_expr = match lowered.as_str() {
            "" | "none" => return Ok(Schedule::None),
            "@once" => return Ok(Schedule::Once),
            "@hourly" => "0 0 * * * *".to_string(),
            "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
            "@weekly" => "0 0 0 * * Sun".to_string(),
            "@monthly" => "0 0 0 1 * *".to_string(),
            "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
            _ => {
                if let Some(period) = lowered.strip_prefix("every ") {
                    return parse_period(raw, period.trim()).map(Schedule::Every);
                }
                // Standard 5-field cron has no seconds field
                if raw.split_whitespace().count() == 5 {
                    format!("0 {}", raw)
                } else {
                    raw.to_string()
                }
            }
        };

        cron::Schedule::from_str(&cron_expr)
            .map(|s| Schedule::Cron(Box::new(s)))
            .map_err(|e| SchedulingError::InvalidExpression {
                expression: raw.to_string(),
                reason: e.to_string(),
            })
    }

    /// First schedule tick at or after `start`
    fn first_tick(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::None => None,
            Schedule::Once | Schedule::Every(_) => Some(start),
            Schedule::Cron(schedule) => schedule
                .after(&(start - Duration::seconds(1)))
                .find(|tick| *tick >= start),
        }
    }

    /// Tick following `tick`
    fn next_tick(&self, tick: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::None | Schedule::Once => None,
            Schedule::Every(period) => tick.checked_add_signed(*period),
            Schedule::Cron(schedule) => schedule.after(&tick).next(),
        }
    }
}

fn parse_period(raw: &str, period: &str) -> Result<Duration, SchedulingError> {
    let invalid = |reason: &str| SchedulingError::InvalidExpression {
        expression: raw.to_string(),
        reason: reason.to_string(),
    };

    let split = period
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| invalid("missing unit (s, m, h or d)"))?;
    let (amount, unit) = period.split_at(split);
    let amount: i64 = amount.parse().map_err(|_| invalid("invalid amount"))?;

    let unit_secs = match unit.trim() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        _ => return Err(invalid("unknown unit")),
    };

    if amount == 0 {
        return Err(SchedulingError::ZeroPeriod(raw.to_string()));
    }

    amount
        .checked_mul(unit_secs)
        .and_then(Duration::try_seconds)
        .ok_or_else(|| invalid("period too large"))
}

/// Cap on how many missed cron intervals are counted when catch-up is off
const SKIPPED_COUNT_LIMIT: usize = 10_000;

/// Result of one clock evaluation for a graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DueIntervals {
    /// Intervals to instantiate as runs, oldest first
    pub instantiate: Vec<LogicalInterval>,
    /// Missed intervals intentionally never instantiated (catch-up disabled).
    /// Cron schedules stop counting at `SKIPPED_COUNT_LIMIT`.
    pub skipped: usize,
}

impl DueIntervals {
    pub fn is_empty(&self) -> bool {
        self.instantiate.is_empty() && self.skipped == 0
    }

    /// Newest interval considered by this evaluation
    pub fn newest(&self) -> Option<LogicalInterval> {
        self.instantiate.iter().max_by_key(|i| i.start).copied()
    }
}

/// Compute intervals that are due at `now` and start after `last_instantiated`.
///
/// Enumeration starts at the tick following `last_instantiated`, so the cost
/// of a tick does not grow with the age of the graph. With catch-up disabled
/// only the newest due interval is materialized.
pub fn compute_due(
    schedule: &Schedule,
    definition: &GraphDefinition,
    last_instantiated: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_per_tick: usize,
) -> DueIntervals {
    if let Schedule::Once = schedule {
        let mut due = DueIntervals::default();
        if last_instantiated.is_none() && definition.start_date <= now {
            due.instantiate.push(LogicalInterval {
                start: definition.start_date,
                end: definition.start_date,
            });
        }
        return due;
    }

    let Some(first) = schedule.first_tick(definition.start_date) else {
        return DueIntervals::default();
    };
    let from = match last_instantiated {
        Some(last) => match schedule.next_tick(last) {
            Some(tick) => tick.max(first),
            None => return DueIntervals::default(),
        },
        None => first,
    };

    if definition.catchup {
        DueIntervals {
            instantiate: walk_forward(schedule, definition, from, now, max_per_tick.max(1)),
            skipped: 0,
        }
    } else {
        match latest_due(schedule, definition, from, now) {
            Some((interval, skipped)) => DueIntervals {
                instantiate: vec![interval],
                skipped,
            },
            None => DueIntervals::default(),
        }
    }
}

/// Up to `limit` consecutive complete intervals starting at `from`
fn walk_forward(
    schedule: &Schedule,
    definition: &GraphDefinition,
    from: DateTime<Utc>,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<LogicalInterval> {
    let mut due = Vec::new();
    let mut tick = Some(from);

    while let Some(start) = tick {
        if due.len() >= limit || definition.end_date.is_some_and(|end| start >= end) {
            break;
        }
        let Some(end) = schedule.next_tick(start) else {
            break;
        };
        if end > now {
            break;
        }
        due.push(LogicalInterval { start, end });
        tick = Some(end);
    }

    due
}

/// Newest complete interval starting at or after `from`, with the number of
/// older intervals it supersedes
fn latest_due(
    schedule: &Schedule,
    definition: &GraphDefinition,
    from: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<(LogicalInterval, usize)> {
    match schedule {
        Schedule::Every(period) => {
            let period_secs = period.num_seconds().max(1);
            let mut complete = (now - from).num_seconds().div_euclid(period_secs);
            if let Some(end_date) = definition.end_date {
                // Intervals starting before the end date
                let before_end = (end_date - from).num_seconds().max(0);
                complete = complete.min((before_end + period_secs - 1) / period_secs);
            }
            if complete <= 0 {
                return None;
            }

            let start = from.checked_add_signed(Duration::try_seconds((complete - 1) * period_secs)?)?;
            let end = start.checked_add_signed(*period)?;
            Some((LogicalInterval { start, end }, (complete - 1) as usize))
        }
        Schedule::Cron(cron) => {
            // Ticks strictly before the next whole second, i.e. at or before `now`
            let upper = now.trunc_subsecs(0) + Duration::seconds(1);
            let mut ticks = cron.after(&upper);

            let mut end = ticks.next_back()?;
            let mut start = ticks.next_back()?;
            if let Some(end_date) = definition.end_date.filter(|e| start >= *e) {
                // Last interval starting before the end date
                ticks = cron.after(&end_date);
                start = ticks.next_back()?;
                end = cron.after(&start).next()?;
            }
            if start < from {
                return None;
            }

            let skipped = ticks
                .rev()
                .take_while(|tick| *tick >= from)
                .take(SKIPPED_COUNT_LIMIT)
                .count();
            Some((LogicalInterval { start, end }, skipped))
        }
        Schedule::None | Schedule::Once => None,
    }
}

/// Tracks the last instantiated interval of every graph through the run store
pub struct SchedulerClock {
    store: Arc<dyn RunStore>,
    config: SchedulerConfig,
}

impl SchedulerClock {
    pub fn new(store: Arc<dyn RunStore>, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    /// Intervals of `definition` that are due at `now` but not yet instantiated
    pub fn due_intervals(
        &self,
        definition: &GraphDefinition,
        now: DateTime<Utc>,
    ) -> Result<DueIntervals, SchedulingError> {
        let schedule = Schedule::parse(definition.schedule_interval.as_deref())?;
        if matches!(schedule, Schedule::None) {
            return Ok(DueIntervals::default());
        }

        let last = self
            .store
            .load_last_instantiated(&definition.name)
            .map_err(SchedulingError::Storage)?;

        let due = compute_due(
            &schedule,
            definition,
            last,
            now,
            self.config.max_intervals_per_tick,
        );

        if due.skipped > 0 {
            tracing::info!(
                "Skipping {} missed interval(s) of graph {} (catchup disabled)",
                due.skipped,
                definition.name
            );
        }

        Ok(due)
    }

    /// Record that `interval` of `graph_name` has been handled
    pub fn mark_instantiated(
        &self,
        graph_name: &str,
        interval: &LogicalInterval,
    ) -> Result<(), SchedulingError> {
        self.store
            .record_instantiated(graph_name, interval.start)
            .map_err(SchedulingError::Storage)
    }
}
