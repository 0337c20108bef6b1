//! Embedded, durable [`PersistenceGateway`] backed by the WAL.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::gateway::{Deletion, GatewayError, PersistenceGateway};
use crate::limits::MAX_STORED_INTERVALS_PER_RESOURCE;
use crate::model::*;
use crate::wal::Wal;

pub type SharedIntervalSet = Arc<RwLock<IntervalSet>>;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each wake-up drains every append already queued, writes
/// them with one fsync, then answers all of their senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so no half batch lingers in the buffer.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// Apply an event to a resource's set (caller holds the lock).
fn apply_event(set: &mut IntervalSet, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BlockCreated {
            id,
            resource_id,
            span,
            kind,
            reason,
            recurrence,
            created_at,
        } => {
            set.insert(BlockedInterval {
                id: *id,
                resource_id: *resource_id,
                span: *span,
                kind: *kind,
                reason: reason.clone(),
                recurrence: *recurrence,
                created_at: *created_at,
                updated_at: *created_at,
            });
            entity_map.insert(*id, *resource_id);
        }
        Event::BlockDeleted { id, .. } => {
            set.remove(*id);
            entity_map.remove(id);
        }
    }
}

fn wal_error(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Wal(e.to_string())
}

/// Intervals of every resource, held in memory and made durable through
/// the WAL before each change becomes visible.
pub struct LocalStore {
    sets: DashMap<Ulid, SharedIntervalSet>,
    /// Interval id → resource id.
    entity_to_resource: DashMap<Ulid, Ulid>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Creates hold it shared, compaction exclusively, so no resource can
    /// appear between the compaction snapshot and the log swap.
    compaction: RwLock<()>,
    path: PathBuf,
}

impl LocalStore {
    /// Replay the log at `path` and start its writer task. Must be called
    /// from inside a tokio runtime.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let events = Wal::replay(&path)?;
        let wal = Wal::open(&path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let entity_to_resource = DashMap::new();
        let mut replayed: HashMap<Ulid, IntervalSet> = HashMap::new();
        for event in &events {
            let resource_id = event.resource_id();
            let set = replayed
                .entry(resource_id)
                .or_insert_with(|| IntervalSet::new(resource_id));
            apply_event(set, event, &entity_to_resource);
        }

        let sets = DashMap::new();
        for (resource_id, set) in replayed {
            sets.insert(resource_id, Arc::new(RwLock::new(set)));
        }

        info!(path = %path.display(), events = events.len(), resources = sets.len(), "local store opened");
        Ok(Self {
            sets,
            entity_to_resource,
            wal_tx,
            compaction: RwLock::new(()),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn get_set(&self, resource_id: &Ulid) -> Option<SharedIntervalSet> {
        self.sets.get(resource_id).map(|e| e.value().clone())
    }

    fn get_or_create_set(&self, resource_id: Ulid) -> SharedIntervalSet {
        self.sets
            .entry(resource_id)
            .or_insert_with(|| Arc::new(RwLock::new(IntervalSet::new(resource_id))))
            .clone()
    }

    async fn wal_append(&self, event: &Event) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| GatewayError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| GatewayError::Wal("WAL writer dropped response".into()))?
            .map_err(wal_error)
    }

    /// WAL-append then apply, under the caller's write lock.
    async fn persist_and_apply(&self, set: &mut IntervalSet, event: &Event) -> Result<(), GatewayError> {
        self.wal_append(event).await?;
        apply_event(set, event, &self.entity_to_resource);
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> Result<u64, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| GatewayError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| GatewayError::Wal("WAL writer dropped response".into()))
    }

    /// Rewrite the log as one `BlockCreated` per live interval. Returns the
    /// number of events written. Writers wait until the swap is done.
    pub async fn compact(&self) -> Result<usize, GatewayError> {
        let _exclusive = self.compaction.write().await;
        let handles: Vec<SharedIntervalSet> = self.sets.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(handles.len());
        for handle in &handles {
            guards.push(handle.read().await);
        }
        let events: Vec<Event> = guards
            .iter()
            .flat_map(|g| g.as_slice().iter().map(Event::created))
            .collect();
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| GatewayError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| GatewayError::Wal("WAL writer dropped response".into()))?
            .map_err(wal_error)?;

        info!(path = %self.path.display(), events = count, "WAL compacted");
        Ok(count)
    }

    /// Compact once `threshold` appends have accumulated. Returns whether it ran.
    pub async fn compact_if_needed(&self, threshold: u64) -> Result<bool, GatewayError> {
        if self.appends_since_compact().await? < threshold {
            return Ok(false);
        }
        self.compact().await?;
        Ok(true)
    }
}

#[async_trait]
impl PersistenceGateway for LocalStore {
    async fn list_intervals(&self, resource_id: Ulid) -> Result<Vec<BlockedInterval>, GatewayError> {
        match self.get_set(&resource_id) {
            Some(set) => Ok(set.read().await.as_slice().to_vec()),
            None => Ok(Vec::new()),
        }
    }

    async fn create_interval(
        &self,
        resource_id: Ulid,
        candidate: &Candidate,
    ) -> Result<BlockedInterval, GatewayError> {
        let span = candidate
            .validate()
            .map_err(|e| GatewayError::Rejected(e.to_string()))?;
        let _shared = self.compaction.read().await;
        let set = self.get_or_create_set(resource_id);
        let mut guard = set.write().await;
        if guard.len() >= MAX_STORED_INTERVALS_PER_RESOURCE {
            return Err(GatewayError::Limit("too many intervals on resource"));
        }

        let interval = candidate
            .clone()
            .into_interval(Ulid::new(), resource_id, span, now_ms());
        self.persist_and_apply(&mut guard, &Event::created(&interval)).await?;
        Ok(interval)
    }

    async fn delete_interval(&self, id: Ulid) -> Result<Deletion, GatewayError> {
        let Some(resource_id) = self.entity_to_resource.get(&id).map(|e| *e.value()) else {
            return Ok(Deletion::NotFound);
        };
        let Some(set) = self.get_set(&resource_id) else {
            return Ok(Deletion::NotFound);
        };
        let mut guard = set.write().await;
        if guard.get(id).is_none() {
            return Ok(Deletion::NotFound);
        }
        self.persist_and_apply(&mut guard, &Event::BlockDeleted { id, resource_id })
            .await?;
        Ok(Deletion::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockKind;

    const H: Ms = 3_600_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("blockcal_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn create_list_delete() {
        let store = LocalStore::open(test_wal_path("create_list_delete.wal")).unwrap();
        let rid = Ulid::new();

        let b = store
            .create_interval(rid, &Candidate::new(10 * H, 12 * H, BlockKind::OwnerBlock))
            .await
            .unwrap();
        let a = store
            .create_interval(rid, &Candidate::new(H, 2 * H, BlockKind::Maintenance).with_reason("sealing"))
            .await
            .unwrap();
        assert_eq!(a.resource_id, rid);
        assert_eq!(a.created_at, a.updated_at);

        let listed = store.list_intervals(rid).await.unwrap();
        assert_eq!(listed.iter().map(|i| i.id).collect::<Vec<_>>(), vec![a.id, b.id]);

        assert_eq!(store.delete_interval(a.id).await.unwrap(), Deletion::Deleted);
        assert_eq!(store.delete_interval(a.id).await.unwrap(), Deletion::NotFound);
        assert_eq!(store.delete_interval(Ulid::new()).await.unwrap(), Deletion::NotFound);
        assert_eq!(store.list_intervals(rid).await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn unknown_resource_lists_empty() {
        let store = LocalStore::open(test_wal_path("unknown_resource.wal")).unwrap();
        assert!(store.list_intervals(Ulid::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_candidate_is_rejected() {
        let store = LocalStore::open(test_wal_path("invalid_candidate.wal")).unwrap();
        let err = store
            .create_interval(Ulid::new(), &Candidate::new(5 * H, 5 * H, BlockKind::OwnerBlock))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
    }

    #[tokio::test]
    async fn reopen_replays_state() {
        let path = test_wal_path("reopen_replays.wal");
        let rid = Ulid::new();
        let (kept, gone) = {
            let store = LocalStore::open(&path).unwrap();
            let kept = store
                .create_interval(rid, &Candidate::new(0, H, BlockKind::OwnerBlock).with_reason("family visit"))
                .await
                .unwrap();
            let gone = store
                .create_interval(rid, &Candidate::new(2 * H, 3 * H, BlockKind::OwnerBlock))
                .await
                .unwrap();
            store.delete_interval(gone.id).await.unwrap();
            (kept, gone)
        };

        let store = LocalStore::open(&path).unwrap();
        assert_eq!(store.list_intervals(rid).await.unwrap(), vec![kept]);
        assert_eq!(store.delete_interval(gone.id).await.unwrap(), Deletion::NotFound);
    }

    #[tokio::test]
    async fn compaction_keeps_live_intervals() {
        let path = test_wal_path("compaction_live.wal");
        let rid = Ulid::new();
        let store = LocalStore::open(&path).unwrap();

        for i in 0..20 {
            let tmp = store
                .create_interval(rid, &Candidate::new(i * H, i * H + 1, BlockKind::OwnerBlock))
                .await
                .unwrap();
            store.delete_interval(tmp.id).await.unwrap();
        }
        let live = store
            .create_interval(rid, &Candidate::new(100 * H, 101 * H, BlockKind::Maintenance))
            .await
            .unwrap();
        assert_eq!(store.appends_since_compact().await.unwrap(), 41);

        assert!(!store.compact_if_needed(1000).await.unwrap());
        assert!(store.compact_if_needed(41).await.unwrap());
        assert_eq!(store.appends_since_compact().await.unwrap(), 0);
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);

        let reopened = LocalStore::open(&path).unwrap();
        assert_eq!(reopened.list_intervals(rid).await.unwrap(), vec![live]);
    }

    #[tokio::test]
    async fn concurrent_creates_are_all_durable() {
        let path = test_wal_path("concurrent_creates.wal");
        let store = Arc::new(LocalStore::open(&path).unwrap());
        let rid = Ulid::new();

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .create_interval(rid, &Candidate::new(i * H, i * H + H / 2, BlockKind::OwnerBlock))
                        .await
                })
            })
            .collect();
        for t in futures::future::join_all(tasks).await {
            t.unwrap().unwrap();
        }

        assert_eq!(store.list_intervals(rid).await.unwrap().len(), 50);
        assert_eq!(Wal::replay(&path).unwrap().len(), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn compaction_keeps_resources_created_meanwhile() {
        let path = test_wal_path("compaction_new_resources.wal");
        let store = Arc::new(LocalStore::open(&path).unwrap());
        store
            .create_interval(Ulid::new(), &Candidate::new(0, H, BlockKind::OwnerBlock))
            .await
            .unwrap();

        let creates: Vec<_> = (0..40)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let rid = Ulid::new();
                    store
                        .create_interval(rid, &Candidate::new(0, H, BlockKind::OwnerBlock))
                        .await
                        .map(|_| rid)
                })
            })
            .collect();
        let compactions: Vec<_> = (0..5)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.compact().await })
            })
            .collect();

        let mut rids = Vec::new();
        for t in futures::future::join_all(creates).await {
            rids.push(t.unwrap().unwrap());
        }
        for t in futures::future::join_all(compactions).await {
            t.unwrap().unwrap();
        }

        let reopened = LocalStore::open(&path).unwrap();
        for rid in rids {
            assert_eq!(reopened.list_intervals(rid).await.unwrap().len(), 1);
        }
    }
}
