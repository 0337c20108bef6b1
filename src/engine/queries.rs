use std::time::Instant;

use chrono::NaiveDate;
use tokio::sync::OwnedRwLockReadGuard;
use ulid::Ulid;

use crate::limits::MAX_QUERY_DAYS;
use crate::model::*;

use super::availability::{self, view_bounds, DayBlocks, Granularity, ViewBounds};
use super::{BlockError, Calendar, CalendarView, FullyBlocked, ResourceView, ViewBlocks};

impl Calendar {
    /// Read access to a loaded view. Loads it on first use.
    async fn read_view(&self, resource_id: Ulid) -> Result<OwnedRwLockReadGuard<ResourceView>, BlockError> {
        let view = self.view(resource_id);
        let guard = view.clone().read_owned().await;
        if guard.loaded {
            return Ok(guard);
        }
        drop(guard);
        let mut guard = view.write_owned().await;
        self.ensure_loaded(resource_id, &mut guard).await?;
        Ok(guard.downgrade())
    }

    /// Render the day, week or month view around `date`.
    pub async fn query(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        granularity: Granularity,
    ) -> Result<CalendarView, BlockError> {
        let started = Instant::now();
        let guard = self.read_view(resource_id).await?;
        let set = guard.set.as_slice();
        let tz = self.tz();
        let bounds = view_bounds(date, granularity);

        let blocks = match granularity {
            Granularity::Day => ViewBlocks::Day(availability::blocks_on_day(set, date, tz)),
            Granularity::Week | Granularity::Month => {
                ViewBlocks::Range(availability::blocks_by_range(set, bounds.first, bounds.last, tz))
            }
        };
        let fully_blocked = bounds
            .days()
            .filter_map(|day| {
                availability::fully_blocked_day(set, day, tz).map(|b| FullyBlocked {
                    date: day,
                    covering: b.id,
                })
            })
            .collect();

        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "view" => granularity.as_str())
            .record(started.elapsed().as_secs_f64());

        Ok(CalendarView {
            bounds,
            granularity,
            blocks,
            fully_blocked,
        })
    }

    /// Drop the cached view and list again. Returns the interval count.
    pub async fn refresh(&self, resource_id: Ulid) -> Result<usize, BlockError> {
        let view = self.view(resource_id);
        let mut guard = view.write().await;
        guard.loaded = false;
        self.ensure_loaded(resource_id, &mut guard).await?;
        Ok(guard.set.len())
    }

    /// Stored intervals sorted by start; templates are not expanded.
    pub async fn intervals(&self, resource_id: Ulid) -> Result<Vec<BlockedInterval>, BlockError> {
        let guard = self.read_view(resource_id).await?;
        Ok(guard.set.as_slice().to_vec())
    }

    pub async fn blocks_in_range(
        &self,
        resource_id: Ulid,
        first: NaiveDate,
        last: NaiveDate,
    ) -> Result<Vec<DayBlocks>, BlockError> {
        if (ViewBounds { first, last }).len_days() > MAX_QUERY_DAYS {
            return Err(BlockError::LimitExceeded("query window too wide"));
        }
        let guard = self.read_view(resource_id).await?;
        Ok(availability::blocks_by_range(guard.set.as_slice(), first, last, self.tz()))
    }

    pub async fn fully_blocked(&self, resource_id: Ulid, day: NaiveDate) -> Result<Option<BlockedInterval>, BlockError> {
        let guard = self.read_view(resource_id).await?;
        Ok(availability::fully_blocked_day(guard.set.as_slice(), day, self.tz()))
    }

    /// Free windows of `day`.
    pub async fn open_spans(&self, resource_id: Ulid, day: NaiveDate) -> Result<Vec<Span>, BlockError> {
        let guard = self.read_view(resource_id).await?;
        Ok(availability::open_spans(guard.set.as_slice(), day, self.tz()))
    }
}
