//! Time ranges during which a stage's drop table is fixed

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Server;

/// End-time sentinel stored by game-data ingestion for "until further notice" (year 3939).
pub const FAKE_END_TIME_MILLI: i64 = 62141368179000;

/// Reference from an element to the time range it was computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum RangeRef {
    /// A row of the `time_ranges` table.
    Stored(i32),
    /// A bespoke range carried on the element itself (stored as range id 0).
    AdHoc,
}

impl RangeRef {
    pub fn to_db(self) -> i32 {
        match self {
            RangeRef::Stored(id) => id,
            RangeRef::AdHoc => 0,
        }
    }

    pub fn stored_id(self) -> Option<i32> {
        match self {
            RangeRef::Stored(id) => Some(id),
            RangeRef::AdHoc => None,
        }
    }
}

impl From<i32> for RangeRef {
    fn from(id: i32) -> Self {
        if id == 0 {
            RangeRef::AdHoc
        } else {
            RangeRef::Stored(id)
        }
    }
}

impl From<RangeRef> for i32 {
    fn from(range: RangeRef) -> Self {
        range.to_db()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RangeEnd {
    Open,
    ClosedAt(DateTime<Utc>),
}

impl RangeEnd {
    pub fn from_millis(ms: i64) -> Self {
        if ms >= FAKE_END_TIME_MILLI {
            return RangeEnd::Open;
        }
        match DateTime::from_timestamp_millis(ms) {
            Some(t) => RangeEnd::ClosedAt(t),
            None => RangeEnd::Open,
        }
    }

    pub fn from_db(t: DateTime<Utc>) -> Self {
        Self::from_millis(t.timestamp_millis())
    }

    /// Value written back to the `end_time` column.
    pub fn to_db(self) -> DateTime<Utc> {
        match self {
            RangeEnd::ClosedAt(t) => t,
            RangeEnd::Open => {
                DateTime::from_timestamp_millis(FAKE_END_TIME_MILLI).unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
        }
    }

    /// Wire projection: open ends are absent.
    pub fn to_millis(self) -> Option<i64> {
        match self {
            RangeEnd::Open => None,
            RangeEnd::ClosedAt(t) => Some(t.timestamp_millis()),
        }
    }

    /// Concrete end no later than `cutoff`.
    pub fn clamp(self, cutoff: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            RangeEnd::Open => cutoff,
            RangeEnd::ClosedAt(t) => t.min(cutoff),
        }
    }

    pub fn is_after(self, t: DateTime<Utc>) -> bool {
        match self {
            RangeEnd::Open => true,
            RangeEnd::ClosedAt(end) => end > t,
        }
    }

    /// The later of two ends; open beats everything.
    pub fn max(self, other: RangeEnd) -> RangeEnd {
        match (self, other) {
            (RangeEnd::Open, _) | (_, RangeEnd::Open) => RangeEnd::Open,
            (RangeEnd::ClosedAt(a), RangeEnd::ClosedAt(b)) => RangeEnd::ClosedAt(a.max(b)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub range: RangeRef,
    pub server: Server,
    pub start_time: DateTime<Utc>,
    pub end: RangeEnd,
}

impl TimeRange {
    pub fn ad_hoc(server: Server, start_time: DateTime<Utc>, end: RangeEnd) -> Self {
        Self {
            range: RangeRef::AdHoc,
            server,
            start_time,
            end,
        }
    }

    /// Part of this range inside `[start, end)`, keeping the range reference.
    pub fn intersect(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<TimeRange> {
        let new_start = self.start_time.max(start);
        let new_end = self.end.clamp(end);
        if new_start >= new_end {
            return None;
        }
        Some(TimeRange {
            range: self.range,
            server: self.server,
            start_time: new_start,
            end: RangeEnd::ClosedAt(new_end),
        })
    }
}
