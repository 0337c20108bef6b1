mod availability;
mod error;
mod mutations;
mod queries;
mod recurrence;
mod resolver;

pub use availability::{
    blocks_by_range, blocks_on_day, day_window, fully_blocked_day, is_full_day, merge_overlapping,
    open_spans, subtract_intervals, view_bounds, DayBlocks, Granularity, ViewBounds,
};
pub use error::BlockError;
pub use recurrence::{expand, Occurrence, Occurrences};
pub use resolver::{propose, propose_with, MergePolicy, Outcome};

use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;
use ulid::Ulid;

use crate::gateway::{GatewayError, PersistenceGateway};
use crate::model::*;

/// Local view of one resource. `loaded == false` means the next access
/// must list from the gateway first.
pub(crate) struct ResourceView {
    pub(crate) set: IntervalSet,
    pub(crate) loaded: bool,
}

impl ResourceView {
    fn empty(resource_id: Ulid) -> Self {
        Self {
            set: IntervalSet::new(resource_id),
            loaded: false,
        }
    }

    fn reset(&mut self, intervals: Vec<BlockedInterval>) {
        self.set.replace(intervals);
        self.loaded = true;
    }
}

pub(crate) type SharedResourceView = Arc<RwLock<ResourceView>>;

/// What a proposal did once applied through the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Applied {
    AlreadyBlocked { covering: Ulid },
    Merged {
        interval: BlockedInterval,
        superseded: Vec<Ulid>,
    },
    Inserted { interval: BlockedInterval },
}

impl Applied {
    /// Owner-facing confirmation text.
    pub fn message(&self) -> String {
        match self {
            Applied::AlreadyBlocked { .. } => "This time period is already blocked".into(),
            Applied::Merged { superseded, .. } => format!(
                "Time period blocked (merged with {} existing block{})",
                superseded.len(),
                if superseded.len() == 1 { "" } else { "s" }
            ),
            Applied::Inserted { .. } => "Time period blocked".into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Applied::AlreadyBlocked { .. } => "already_blocked",
            Applied::Merged { .. } => "merged",
            Applied::Inserted { .. } => "inserted",
        }
    }

    /// The interval now covering the proposal, when one was written.
    pub fn interval(&self) -> Option<&BlockedInterval> {
        match self {
            Applied::AlreadyBlocked { .. } => None,
            Applied::Merged { interval, .. } | Applied::Inserted { interval } => Some(interval),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Removal {
    Deleted,
    /// Someone else deleted it first.
    AlreadyGone,
}

impl Removal {
    pub fn label(&self) -> &'static str {
        match self {
            Removal::Deleted => "deleted",
            Removal::AlreadyGone => "already_gone",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "view", content = "days", rename_all = "snake_case")]
pub enum ViewBlocks {
    /// Every block touching the selected day, occurrences included.
    Day(Vec<BlockedInterval>),
    /// Sparse per-day listing for week and month views.
    Range(Vec<DayBlocks>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FullyBlocked {
    pub date: NaiveDate,
    pub covering: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarView {
    pub bounds: ViewBounds,
    pub granularity: Granularity,
    pub blocks: ViewBlocks,
    pub fully_blocked: Vec<FullyBlocked>,
}

/// Calendar service for blocked intervals: resolves proposals, applies them
/// through the gateway and answers view queries from a per-resource cache.
///
/// Every write to a resource holds that resource's write lock across the
/// whole list, resolve, create, delete sequence.
pub struct Calendar {
    gateway: Arc<dyn PersistenceGateway>,
    cache: DashMap<Ulid, SharedResourceView>,
    tz: FixedOffset,
    policy: MergePolicy,
}

impl Calendar {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, tz: FixedOffset) -> Self {
        Self::with_policy(gateway, tz, MergePolicy::default())
    }

    pub fn with_policy(gateway: Arc<dyn PersistenceGateway>, tz: FixedOffset, policy: MergePolicy) -> Self {
        Self {
            gateway,
            cache: DashMap::new(),
            tz,
            policy,
        }
    }

    pub fn tz(&self) -> FixedOffset {
        self.tz
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    pub(super) fn view(&self, resource_id: Ulid) -> SharedResourceView {
        self.cache
            .entry(resource_id)
            .or_insert_with(|| Arc::new(RwLock::new(ResourceView::empty(resource_id))))
            .clone()
    }

    /// Fill the view from the gateway if it is not loaded yet.
    pub(super) async fn ensure_loaded(&self, resource_id: Ulid, view: &mut ResourceView) -> Result<(), BlockError> {
        if !view.loaded {
            let intervals = self.list(resource_id).await?;
            view.reset(intervals);
        }
        Ok(())
    }

    pub(super) async fn list(&self, resource_id: Ulid) -> Result<Vec<BlockedInterval>, GatewayError> {
        self.gateway
            .list_intervals(resource_id)
            .await
            .inspect_err(|_| gateway_failed("list"))
    }

    pub(super) fn gateway(&self) -> &dyn PersistenceGateway {
        self.gateway.as_ref()
    }
}

/// Change the local view ahead of the gateway call it mirrors.
pub(super) fn apply_optimistic<R>(view: &mut ResourceView, f: impl FnOnce(&mut IntervalSet) -> R) -> R {
    f(&mut view.set)
}

/// Replace the local view with a fresh listing after a failed write. When
/// that read fails too, mark the view unloaded so the next access retries.
pub(super) async fn reconcile_on_failure(calendar: &Calendar, resource_id: Ulid, view: &mut ResourceView) {
    metrics::counter!(crate::observability::RECONCILES_TOTAL).increment(1);
    match calendar.list(resource_id).await {
        Ok(intervals) => view.reset(intervals),
        Err(e) => {
            warn!(%resource_id, error = %e, "reconcile failed, dropping cached view");
            view.set.replace(Vec::new());
            view.loaded = false;
        }
    }
}

pub(super) fn gateway_failed(op: &'static str) {
    metrics::counter!(crate::observability::GATEWAY_FAILURES_TOTAL, "op" => op).increment(1);
}
