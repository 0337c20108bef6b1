use chrono::{Datelike, Days, FixedOffset, NaiveDate, NaiveTime, Weekday};
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::availability::{local_ms, to_local};

/// One dated instance of a recurrence template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Occurrence {
    pub template_id: Ulid,
    /// Local date the occurrence starts on.
    pub date: NaiveDate,
    pub span: Span,
}

/// Lazy walk over the candidate dates of a template. Finite (bounded by the
/// window and `until`) and restartable: clone it, or call [`expand`] again.
#[derive(Debug, Clone)]
pub struct Occurrences {
    template_id: Ulid,
    pattern: RecurrencePattern,
    anchor: Weekday,
    time: NaiveTime,
    duration: Ms,
    window: Span,
    tz: FixedOffset,
    next: Option<NaiveDate>,
    last: NaiveDate,
}

/// Project `template` onto `window`. Occurrences keep the template's local
/// time of day and duration; only those overlapping the window are yielded.
/// Intervals without a recurrence expand to nothing.
pub fn expand(template: &BlockedInterval, window: Span, tz: FixedOffset) -> Occurrences {
    let first = to_local(template.span.start, tz);
    let first_date = first.date_naive();
    let duration = template.span.duration_ms();

    // An occurrence that starts this many days before the window can still reach into it.
    let time_of_day = first.time().signed_duration_since(NaiveTime::MIN).num_milliseconds();
    let spill = Days::new(((time_of_day + duration - 1) / DAY_MS) as u64);
    let from = to_local(window.start, tz)
        .date_naive()
        .checked_sub_days(spill)
        .unwrap_or(first_date)
        .max(first_date);
    let window_last = to_local(window.end - 1, tz).date_naive();

    let (pattern, last) = match template.recurrence {
        Some(r) => (r.pattern, window_last.min(r.until)),
        None => (RecurrencePattern::Daily, window_last),
    };
    let next = (template.recurrence.is_some() && from <= last).then_some(from);

    Occurrences {
        template_id: template.id,
        pattern,
        anchor: first_date.weekday(),
        time: first.time(),
        duration,
        window,
        tz,
        next,
        last,
    }
}

impl Iterator for Occurrences {
    type Item = Occurrence;

    fn next(&mut self) -> Option<Occurrence> {
        while let Some(date) = self.next {
            self.next = date.succ_opt().filter(|d| *d <= self.last);
            if !self.pattern.matches(date, self.anchor) {
                continue;
            }
            let start = local_ms(date.and_time(self.time), self.tz);
            let span = Span::new(start, start + self.duration);
            if span.overlaps(&self.window) {
                return Some(Occurrence {
                    template_id: self.template_id,
                    date,
                    span,
                });
            }
        }
        None
    }
}
