use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::BlockError;
use crate::limits::*;

/// Unix milliseconds, UTC.
pub type Ms = i64;

pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Validating constructor for untrusted bounds.
    pub fn checked(start: Ms, end: Ms) -> Result<Self, BlockError> {
        if end <= start {
            return Err(BlockError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict overlap: touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Why a resource is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockKind {
    OwnerBlock,
    Maintenance,
    /// Generated from a confirmed reservation. Never merged or removed here.
    Booking,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::OwnerBlock => "owner-block",
            BlockKind::Maintenance => "maintenance",
            BlockKind::Booking => "booking",
        }
    }
}

impl std::str::FromStr for BlockKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner-block" | "owner" => Ok(BlockKind::OwnerBlock),
            "maintenance" => Ok(BlockKind::Maintenance),
            "booking" => Ok(BlockKind::Booking),
            other => Err(format!("unknown block kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrencePattern {
    Daily,
    /// Same weekday as the template's first occurrence.
    Weekly,
    Weekdays,
    Weekends,
}

impl RecurrencePattern {
    /// Does `date` carry an occurrence, given the weekday the template starts on?
    pub fn matches(&self, date: NaiveDate, anchor: Weekday) -> bool {
        let wd = date.weekday();
        match self {
            RecurrencePattern::Daily => true,
            RecurrencePattern::Weekly => wd == anchor,
            RecurrencePattern::Weekdays => !matches!(wd, Weekday::Sat | Weekday::Sun),
            RecurrencePattern::Weekends => matches!(wd, Weekday::Sat | Weekday::Sun),
        }
    }
}

impl std::str::FromStr for RecurrencePattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(RecurrencePattern::Daily),
            "weekly" => Ok(RecurrencePattern::Weekly),
            "weekdays" => Ok(RecurrencePattern::Weekdays),
            "weekends" => Ok(RecurrencePattern::Weekends),
            other => Err(format!("unknown recurrence pattern: {other}")),
        }
    }
}

/// Turns a stored interval into a template: its span gives the time of day
/// and first occurrence, `until` is the last date that may carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub pattern: RecurrencePattern,
    pub until: NaiveDate,
}

/// A persisted blocked interval on a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedInterval {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub kind: BlockKind,
    pub reason: Option<String>,
    pub recurrence: Option<Recurrence>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl BlockedInterval {
    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    pub fn is_booking(&self) -> bool {
        self.kind == BlockKind::Booking
    }

    /// Eligible to be absorbed by a merge.
    pub fn is_mergeable(&self) -> bool {
        !self.is_recurring() && !self.is_booking()
    }

    /// A concrete occurrence of this template, carrying the template's id.
    pub fn occurrence(&self, span: Span) -> BlockedInterval {
        BlockedInterval {
            span,
            ..self.clone()
        }
    }
}

/// A not-yet-persisted proposal. Bounds are raw so that invalid ranges can
/// be expressed and rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub start: Ms,
    pub end: Ms,
    pub kind: BlockKind,
    pub reason: Option<String>,
    pub recurrence: Option<Recurrence>,
}

impl Candidate {
    pub fn new(start: Ms, end: Ms, kind: BlockKind) -> Self {
        Self {
            start,
            end,
            kind,
            reason: None,
            recurrence: None,
        }
    }

    pub fn from_span(span: Span, kind: BlockKind) -> Self {
        Self::new(span.start, span.end, kind)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.reason = if reason.is_empty() { None } else { Some(reason) };
        self
    }

    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    /// Check the range first, then the limits. Returns the validated span.
    pub fn validate(&self) -> Result<Span, BlockError> {
        let span = Span::checked(self.start, self.end)?;
        if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
            return Err(BlockError::LimitExceeded("timestamp out of range"));
        }
        if span.duration_ms() > MAX_SPAN_DURATION_MS {
            return Err(BlockError::LimitExceeded("span too wide"));
        }
        if let Some(ref r) = self.reason
            && r.chars().count() > MAX_REASON_LEN
        {
            return Err(BlockError::LimitExceeded("reason too long"));
        }
        Ok(span)
    }

    /// Materialize into a persisted record.
    pub fn into_interval(self, id: Ulid, resource_id: Ulid, span: Span, now: Ms) -> BlockedInterval {
        BlockedInterval {
            id,
            resource_id,
            span,
            kind: self.kind,
            reason: self.reason,
            recurrence: self.recurrence,
            created_at: now,
            updated_at: now,
        }
    }
}

/// All intervals of one resource, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct IntervalSet {
    pub resource_id: Ulid,
    intervals: Vec<BlockedInterval>,
}

impl IntervalSet {
    pub fn new(resource_id: Ulid) -> Self {
        Self {
            resource_id,
            intervals: Vec::new(),
        }
    }

    pub fn from_intervals(resource_id: Ulid, intervals: Vec<BlockedInterval>) -> Self {
        let mut set = Self::new(resource_id);
        set.replace(intervals);
        set
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn as_slice(&self) -> &[BlockedInterval] {
        &self.intervals
    }

    pub fn get(&self, id: Ulid) -> Option<&BlockedInterval> {
        self.intervals.iter().find(|i| i.id == id)
    }

    /// Swap in a fresh listing.
    pub fn replace(&mut self, mut intervals: Vec<BlockedInterval>) {
        intervals.sort_by_key(|i| i.span.start);
        self.intervals = intervals;
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert(&mut self, interval: BlockedInterval) {
        let pos = self
            .intervals
            .partition_point(|i| i.span.start <= interval.span.start);
        self.intervals.insert(pos, interval);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<BlockedInterval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Intervals whose stored span overlaps the query window. Everything at
    /// index >= the partition point starts at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &BlockedInterval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }
}

/// WAL record format for the local store. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BlockCreated {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        kind: BlockKind,
        reason: Option<String>,
        recurrence: Option<Recurrence>,
        created_at: Ms,
    },
    BlockDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    pub fn created(interval: &BlockedInterval) -> Self {
        Event::BlockCreated {
            id: interval.id,
            resource_id: interval.resource_id,
            span: interval.span,
            kind: interval.kind,
            reason: interval.reason.clone(),
            recurrence: interval.recurrence,
            created_at: interval.created_at,
        }
    }

    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::BlockCreated { resource_id, .. } | Event::BlockDeleted { resource_id, .. } => {
                *resource_id
            }
        }
    }
}
