use serde::Serialize;
use ulid::Ulid;

use crate::limits::MAX_REASON_LEN;
use crate::model::*;

use super::BlockError;

/// Classification of a candidate against a resource's existing intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// An existing interval already covers the whole candidate. Nothing to write.
    AlreadyBlocked { covering: Ulid },
    /// Persist `merged`, then delete every id in `superseded`.
    Merged { merged: Candidate, superseded: Vec<Ulid> },
    /// Persist the candidate as-is.
    Inserted { candidate: Candidate },
}

/// Knobs for how a merge is assembled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergePolicy {
    /// Join superseded reasons and the candidate's reason with `"; "`.
    pub combine_reasons: bool,
    /// Refuse candidates that overlap a booking instead of blocking alongside it.
    pub reject_booking_overlap: bool,
}

/// Resolve `candidate` against `existing` with the default policy.
pub fn propose(existing: &[BlockedInterval], candidate: &Candidate) -> Result<Outcome, BlockError> {
    propose_with(existing, candidate, &MergePolicy::default())
}

/// Pure and deterministic: containment wins over merge, merge over insert.
/// Recurring templates on either side never take part.
pub fn propose_with(
    existing: &[BlockedInterval],
    candidate: &Candidate,
    policy: &MergePolicy,
) -> Result<Outcome, BlockError> {
    let span = candidate.validate()?;

    if policy.reject_booking_overlap
        && let Some(booking) = existing
            .iter()
            .find(|i| i.is_booking() && !i.is_recurring() && i.span.overlaps(&span))
    {
        return Err(BlockError::BookingConflict(booking.id));
    }

    if candidate.recurrence.is_some() {
        return Ok(Outcome::Inserted {
            candidate: candidate.clone(),
        });
    }

    if let Some(covering) = existing
        .iter()
        .find(|i| !i.is_recurring() && i.span.contains_span(&span))
    {
        return Ok(Outcome::AlreadyBlocked {
            covering: covering.id,
        });
    }

    let overlapping: Vec<&BlockedInterval> = existing
        .iter()
        .filter(|i| i.is_mergeable() && i.span.overlaps(&span))
        .collect();

    if overlapping.is_empty() {
        return Ok(Outcome::Inserted {
            candidate: candidate.clone(),
        });
    }

    let mut start = span.start;
    let mut end = span.end;
    for i in &overlapping {
        start = start.min(i.span.start);
        end = end.max(i.span.end);
    }

    let reason = if policy.combine_reasons {
        combine_reasons(&overlapping, candidate.reason.as_deref())
    } else {
        candidate.reason.clone()
    };

    let merged = Candidate {
        start,
        end,
        kind: candidate.kind,
        reason,
        recurrence: None,
    };
    // The union of in-limit spans can itself exceed the span limit.
    merged.validate()?;

    Ok(Outcome::Merged {
        merged,
        superseded: overlapping.iter().map(|i| i.id).collect(),
    })
}

fn combine_reasons(superseded: &[&BlockedInterval], own: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = superseded
        .iter()
        .filter_map(|i| i.reason.as_deref())
        .chain(own)
        .filter(|r| !r.is_empty())
        .collect();
    if parts.is_empty() {
        return None;
    }
    let joined = parts.join("; ");
    match joined.char_indices().nth(MAX_REASON_LEN) {
        Some((cut, _)) => Some(joined[..cut].to_string()),
        None => Some(joined),
    }
}
