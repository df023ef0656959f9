//! Per-calendar-day session ledger and the cross-midnight splitter.
//!
//! A closed interval `[start, end)` is cut at every local midnight of the
//! reference timezone. Each piece lands in the `SessionInterval` of the
//! day it belongs to. Pieces cut at a boundary store the inclusive end
//! `23:59:59.999` and are flagged `continues`; their duration still runs
//! to midnight, so chunk durations always sum to `end - start` exactly.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

fn one_ms() -> TimeDelta {
    TimeDelta::milliseconds(1)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("interval end {end} is not after start {start}")]
    NonPositiveInterval { start: DateTime<Utc>, end: DateTime<Utc> },
    #[error("calendar day out of range after {0}")]
    OutOfRange(NaiveDate),
}

/// One `{start, end}` pair inside a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Cut at midnight; the interval carries on into the next day.
    #[serde(default)]
    pub continues: bool,
}

impl Timing {
    pub fn duration(&self) -> TimeDelta {
        let raw = self.end - self.start;
        if self.continues {
            raw + one_ms()
        } else {
            raw
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration().num_milliseconds()
    }
}

/// All attendance of one principal on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInterval {
    pub day: NaiveDate,
    pub timings: Vec<Timing>,
    /// Sum of timing durations, in milliseconds.
    pub online_ms: i64,
}

impl SessionInterval {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            timings: Vec::new(),
            online_ms: 0,
        }
    }

    fn append(&mut self, timing: Timing) {
        self.online_ms += timing.duration_ms();
        self.timings.push(timing);
    }

    /// Recompute the total from the timings.
    pub fn recomputed_online_ms(&self) -> i64 {
        self.timings.iter().map(Timing::duration_ms).sum()
    }
}

/// A piece of an interval confined to one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayChunk {
    pub day: NaiveDate,
    pub timing: Timing,
}

/// First instant of `day` in the reference timezone.
pub fn day_start(day: NaiveDate, tz: &FixedOffset) -> Result<DateTime<Utc>, LedgerError> {
    tz.from_local_datetime(&day.and_time(NaiveTime::MIN))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or(LedgerError::OutOfRange(day))
}

/// Calendar day of `instant` in the reference timezone.
pub fn day_of(instant: DateTime<Utc>, tz: &FixedOffset) -> NaiveDate {
    instant.with_timezone(tz).date_naive()
}

/// Cut `[start, end)` into one chunk per calendar day touched.
pub fn split_interval(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tz: &FixedOffset,
) -> Result<Vec<DayChunk>, LedgerError> {
    if end <= start {
        return Err(LedgerError::NonPositiveInterval { start, end });
    }

    let end_day = day_of(end, tz);
    let mut cursor = start;
    let mut chunks = Vec::new();

    loop {
        let day = day_of(cursor, tz);
        if day == end_day {
            chunks.push(DayChunk {
                day,
                timing: Timing {
                    start: cursor,
                    end,
                    continues: false,
                },
            });
            return Ok(chunks);
        }

        let next_day = day.succ_opt().ok_or(LedgerError::OutOfRange(day))?;
        let next_midnight = day_start(next_day, tz)?;
        chunks.push(DayChunk {
            day,
            timing: Timing {
                start: cursor,
                end: next_midnight - one_ms(),
                continues: true,
            },
        });
        cursor = next_midnight;
    }
}

/// A principal's attendance history, one entry per day in first-touched order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger {
    intervals: Vec<SessionInterval>,
}

/// Result of folding an interval into a ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerUpdate {
    pub ledger: Ledger,
    /// Days written by this update, in chunk order.
    pub touched: Vec<NaiveDate>,
    pub chunks: Vec<DayChunk>,
}

impl LedgerUpdate {
    /// The updated intervals for every touched day.
    pub fn touched_intervals(&self) -> impl Iterator<Item = (usize, &SessionInterval)> {
        self.touched.iter().filter_map(|day| self.ledger.position(day).map(|pos| (pos, &self.ledger.intervals[pos])))
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored intervals, already in first-touched order.
    pub fn from_intervals(intervals: Vec<SessionInterval>) -> Self {
        Self { intervals }
    }

    pub fn intervals(&self) -> &[SessionInterval] {
        &self.intervals
    }

    pub fn into_intervals(self) -> Vec<SessionInterval> {
        self.intervals
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn day(&self, day: &NaiveDate) -> Option<&SessionInterval> {
        self.intervals.iter().find(|i| &i.day == day)
    }

    fn position(&self, day: &NaiveDate) -> Option<usize> {
        self.intervals.iter().position(|i| &i.day == day)
    }

    pub fn total_online_ms(&self) -> i64 {
        self.intervals.iter().map(|i| i.online_ms).sum()
    }

    /// Fold a closed interval into a copy of this ledger.
    ///
    /// `self` is untouched; the caller persists `LedgerUpdate::ledger`
    /// (or just its touched days) as one unit.
    pub fn with_interval(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tz: &FixedOffset,
    ) -> Result<LedgerUpdate, LedgerError> {
        let chunks = split_interval(start, end, tz)?;
        let mut ledger = self.clone();
        let mut touched = Vec::with_capacity(chunks.len());

        for chunk in &chunks {
            let pos = match ledger.position(&chunk.day) {
                Some(pos) => pos,
                None => {
                    ledger.intervals.push(SessionInterval::new(chunk.day));
                    ledger.intervals.len() - 1
                }
            };
            ledger.intervals[pos].append(chunk.timing);
            if !touched.contains(&chunk.day) {
                touched.push(chunk.day);
            }
        }

        tracing::debug!(
            start = %start,
            end = %end,
            chunks = chunks.len(),
            "interval folded into ledger"
        );

        Ok(LedgerUpdate {
            ledger,
            touched,
            chunks,
        })
    }
}
