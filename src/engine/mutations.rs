use chrono::NaiveDate;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::gateway::Deletion;
use crate::limits::MAX_INTERVALS_PER_RESOURCE;
use crate::model::*;

use super::availability::{view_bounds, Granularity};
use super::resolver::{propose_with, Outcome};
use super::{apply_optimistic, gateway_failed, reconcile_on_failure, Applied, BlockError, Calendar, Removal};

impl Calendar {
    /// Resolve `candidate` against the resource's current intervals and
    /// apply the outcome. Merges create the merged record first, then delete
    /// the superseded ones.
    pub async fn propose(&self, resource_id: Ulid, candidate: Candidate) -> Result<Applied, BlockError> {
        candidate.validate()?;

        let view = self.view(resource_id);
        let mut guard = view.write().await;
        let listed = self.list(resource_id).await?;
        guard.reset(listed);

        let outcome = propose_with(guard.set.as_slice(), &candidate, &self.policy())?;
        if matches!(outcome, Outcome::Inserted { .. }) && guard.set.len() >= MAX_INTERVALS_PER_RESOURCE {
            return Err(BlockError::LimitExceeded("too many intervals on resource"));
        }

        let applied = match outcome {
            Outcome::AlreadyBlocked { covering } => Applied::AlreadyBlocked { covering },
            Outcome::Inserted { candidate } => {
                let interval = self
                    .gateway()
                    .create_interval(resource_id, &candidate)
                    .await
                    .inspect_err(|_| gateway_failed("create"))?;
                guard.set.insert(interval.clone());
                Applied::Inserted { interval }
            }
            Outcome::Merged { merged, superseded } => {
                let interval = self
                    .gateway()
                    .create_interval(resource_id, &merged)
                    .await
                    .inspect_err(|_| gateway_failed("create"))?;
                guard.set.insert(interval.clone());

                for &id in &superseded {
                    match self.gateway().delete_interval(id).await {
                        Ok(Deletion::Deleted) => {}
                        Ok(Deletion::NotFound) => debug!(%id, "superseded block already gone"),
                        Err(e) => {
                            gateway_failed("delete");
                            warn!(%resource_id, %id, merged = %interval.id, error = %e, "merge left a superseded block behind");
                            reconcile_on_failure(self, resource_id, &mut guard).await;
                            return Err(e.into());
                        }
                    }
                    guard.set.remove(id);
                }
                Applied::Merged { interval, superseded }
            }
        };

        metrics::counter!(crate::observability::PROPOSALS_TOTAL, "outcome" => applied.label()).increment(1);
        info!(%resource_id, outcome = applied.label(), "{}", applied.message());
        Ok(applied)
    }

    /// Remove one block. The local view drops it immediately; a gateway
    /// failure restores the view from a fresh listing.
    pub async fn remove(&self, resource_id: Ulid, id: Ulid) -> Result<Removal, BlockError> {
        let view = self.view(resource_id);
        let mut guard = view.write().await;
        self.ensure_loaded(resource_id, &mut guard).await?;

        if guard.set.get(id).is_some_and(BlockedInterval::is_booking) {
            return Err(BlockError::BookingImmutable(id));
        }

        apply_optimistic(&mut guard, |set| set.remove(id));

        let removal = match self.gateway().delete_interval(id).await {
            Ok(Deletion::Deleted) => Removal::Deleted,
            Ok(Deletion::NotFound) => Removal::AlreadyGone,
            Err(e) => {
                gateway_failed("delete");
                warn!(%resource_id, %id, error = %e, "delete failed, reloading");
                reconcile_on_failure(self, resource_id, &mut guard).await;
                return Err(e.into());
            }
        };

        metrics::counter!(crate::observability::REMOVALS_TOTAL, "result" => removal.label()).increment(1);
        info!(%resource_id, %id, result = removal.label(), "block removed");
        Ok(removal)
    }

    /// Quick action: block every day of the view containing `date`.
    pub async fn block_entire_view(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        granularity: Granularity,
    ) -> Result<Applied, BlockError> {
        let span = view_bounds(date, granularity).span(self.tz());
        let candidate = Candidate::from_span(span, BlockKind::OwnerBlock)
            .with_reason(format!("Blocked entire {}", granularity.as_str()));
        self.propose(resource_id, candidate).await
    }
}
