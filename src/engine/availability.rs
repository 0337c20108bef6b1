use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::model::*;

use super::recurrence::expand;

// ── Local calendar helpers ────────────────────────────────────────

pub(crate) fn to_local(ms: Ms, tz: FixedOffset) -> DateTime<FixedOffset> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .with_timezone(&tz)
}

pub(crate) fn local_ms(local: NaiveDateTime, tz: FixedOffset) -> Ms {
    local.and_utc().timestamp_millis() - i64::from(tz.local_minus_utc()) * 1000
}

/// `[local 00:00:00.000, next local midnight)`, i.e. the inclusive
/// `00:00:00.000..=23:59:59.999` day at millisecond resolution.
pub fn day_window(day: NaiveDate, tz: FixedOffset) -> Span {
    let start = local_ms(day.and_time(NaiveTime::MIN), tz);
    Span::new(start, start + DAY_MS)
}

/// Does `span` count as blocking the whole of `day`?
///
/// Either it covers `00:00:00.000..=23:59:59.999`, or it starts and ends on
/// `day` with a start hour of at most 1 and an end hour of at least 23. An
/// end exactly at the next midnight is read as 23:59:59.999 of `day`.
pub fn is_full_day(span: &Span, day: NaiveDate, tz: FixedOffset) -> bool {
    let window = day_window(day, tz);
    if span.start <= window.start && span.end >= window.end - 1 {
        return true;
    }
    let start = to_local(span.start, tz);
    if start.date_naive() != day || start.hour() > 1 {
        return false;
    }
    if span.end == window.end {
        return true;
    }
    let end = to_local(span.end, tz);
    end.date_naive() == day && end.hour() >= 23
}

// ── View bounds ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            other => Err(format!("unknown view: {other} (expected day, week or month)")),
        }
    }
}

/// Inclusive range of calendar days shown by a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ViewBounds {
    pub first: NaiveDate,
    pub last: NaiveDate,
}

impl ViewBounds {
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let last = self.last;
        self.first.iter_days().take_while(move |d| *d <= last)
    }

    pub fn len_days(&self) -> i64 {
        (self.last - self.first).num_days() + 1
    }

    /// `[first local midnight, midnight after last)`.
    pub fn span(&self, tz: FixedOffset) -> Span {
        Span::new(day_window(self.first, tz).start, day_window(self.last, tz).end)
    }
}

/// Day: the date itself. Week: Sunday through Saturday around it. Month:
/// first through last day of its month.
pub fn view_bounds(date: NaiveDate, granularity: Granularity) -> ViewBounds {
    match granularity {
        Granularity::Day => ViewBounds {
            first: date,
            last: date,
        },
        Granularity::Week => {
            let back = Days::new(u64::from(date.weekday().num_days_from_sunday()));
            let first = date.checked_sub_days(back).unwrap_or(date);
            ViewBounds {
                first,
                last: first.checked_add_days(Days::new(6)).unwrap_or(first),
            }
        }
        Granularity::Month => {
            let first = date.with_day(1).unwrap_or(date);
            let last = first
                .checked_add_months(chrono::Months::new(1))
                .and_then(|next| next.pred_opt())
                .unwrap_or(date);
            ViewBounds { first, last }
        }
    }
}

// ── Day queries ───────────────────────────────────────────────────

/// Blocks applying to one calendar day, split by origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayBlocks {
    pub date: NaiveDate,
    pub blocks: Vec<BlockedInterval>,
    /// Materialized occurrences of recurring templates.
    pub recurring_blocks: Vec<BlockedInterval>,
}

impl DayBlocks {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.recurring_blocks.is_empty()
    }
}

fn collect_day(set: &[BlockedInterval], day: NaiveDate, tz: FixedOffset) -> DayBlocks {
    let window = day_window(day, tz);
    let mut blocks = Vec::new();
    let mut recurring_blocks = Vec::new();
    for interval in set {
        if interval.is_recurring() {
            recurring_blocks.extend(expand(interval, window, tz).map(|o| interval.occurrence(o.span)));
        } else if interval.span.overlaps(&window) {
            blocks.push(interval.clone());
        }
    }
    DayBlocks {
        date: day,
        blocks,
        recurring_blocks,
    }
}

/// Every interval overlapping the day, recurring occurrences included
/// (after the one-off blocks).
pub fn blocks_on_day(set: &[BlockedInterval], day: NaiveDate, tz: FixedOffset) -> Vec<BlockedInterval> {
    let DayBlocks {
        mut blocks,
        recurring_blocks,
        ..
    } = collect_day(set, day, tz);
    blocks.extend(recurring_blocks);
    blocks
}

/// The first block on `day` that covers it entirely, if any.
pub fn fully_blocked_day(set: &[BlockedInterval], day: NaiveDate, tz: FixedOffset) -> Option<BlockedInterval> {
    blocks_on_day(set, day, tz)
        .into_iter()
        .find(|b| is_full_day(&b.span, day, tz))
}

/// One entry per day of `[first, last]` that has any block. Days without
/// blocks are left out.
pub fn blocks_by_range(
    set: &[BlockedInterval],
    first: NaiveDate,
    last: NaiveDate,
    tz: FixedOffset,
) -> Vec<DayBlocks> {
    ViewBounds { first, last }
        .days()
        .map(|day| collect_day(set, day, tz))
        .filter(|d| !d.is_empty())
        .collect()
}

/// Free windows of a day: the day minus every block applying to it.
pub fn open_spans(set: &[BlockedInterval], day: NaiveDate, tz: FixedOffset) -> Vec<Span> {
    let window = day_window(day, tz);
    let mut blocked: Vec<Span> = blocks_on_day(set, day, tz)
        .iter()
        .map(|b| Span::new(b.span.start.max(window.start), b.span.end.min(window.end)))
        .collect();
    blocked.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&blocked);
    subtract_intervals(&[window], &blocked)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Remove sorted, disjoint `to_remove` spans from sorted `base` spans.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
