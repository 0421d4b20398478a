//! Optimistic, revisioned local state for one entity namespace.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use sanctuary_common::{EntityId, Error, LibraryItem, ReaderSettings, Result};
use sanctuary_storage::{read_json, write_json, QueueStore};

use crate::meta::{AckOutcome, Revision, SyncMeta};
use crate::reconcile::{reconcile, Disposition, Reconcilable, ReconcileReport};

/// A record managed by [`EntitySync`].
pub trait Entity: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifier the record is stored and synchronized under.
    fn entity_id(&self) -> EntityId;
}

impl Entity for LibraryItem {
    fn entity_id(&self) -> EntityId {
        self.id.clone()
    }
}

impl Entity for ReaderSettings {
    fn entity_id(&self) -> EntityId {
        ReaderSettings::entity_id()
    }
}

/// Value to restore if a failed revision is ever rolled back to.
struct Undo<T> {
    base: Revision,
    value: T,
}

struct EntityTable<T> {
    items: HashMap<EntityId, T>,
    meta: HashMap<EntityId, SyncMeta>,
    /// Failed revisions whose value was already buried under a newer edit.
    failed: HashMap<EntityId, BTreeMap<Revision, Undo<T>>>,
}

/// Local state captured right before a remote snapshot fetch.
///
/// Any entity that was protected or queued at capture time, or whose
/// revision moved since, keeps its local fields when the snapshot is
/// reconciled: the snapshot may predate that edit reaching the remote.
#[derive(Debug, Clone, Default)]
pub struct SnapshotMark {
    revisions: HashMap<EntityId, Revision>,
    protected: HashSet<EntityId>,
}

impl SnapshotMark {
    /// Also protect `ids`, e.g. entities with queued mutations.
    pub fn protect(mut self, ids: impl IntoIterator<Item = EntityId>) -> Self {
        self.protected.extend(ids);
        self
    }

    /// Whether reconciling must keep the local fields of `id`.
    pub fn covers(&self, id: &EntityId, meta: Option<&SyncMeta>) -> bool {
        if self.protected.contains(id) || meta.is_some_and(SyncMeta::is_protected) {
            return true;
        }
        self.revisions.get(id).copied() != meta.map(|m| m.local_revision)
    }
}

/// Entity map plus per-entity sync bookkeeping for one namespace.
///
/// Every mutation is committed in memory and to the store before the
/// remote call starts. Remote completions are matched against the entity's
/// revision counter, so a slow stale response never clobbers a newer edit.
pub struct EntitySync<T: Entity> {
    namespace: String,
    store: Arc<dyn QueueStore>,
    sync_enabled: bool,
    call_timeout: Duration,
    table: RwLock<EntityTable<T>>,
    /// Orders commits, their store writes and rollbacks per namespace.
    commit_lock: tokio::sync::Mutex<()>,
}

impl<T: Entity> EntitySync<T> {
    /// Create an empty namespace backed by `store`.
    pub fn new(namespace: impl Into<String>, store: Arc<dyn QueueStore>) -> Self {
        Self {
            namespace: namespace.into(),
            store,
            sync_enabled: true,
            call_timeout: Duration::from_secs(15),
            table: RwLock::new(EntityTable {
                items: HashMap::new(),
                meta: HashMap::new(),
                failed: HashMap::new(),
            }),
            commit_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Enable or disable remote calls. Disabled means local-only mode.
    pub fn with_sync_enabled(mut self, enabled: bool) -> Self {
        self.sync_enabled = enabled;
        self
    }

    /// Set the deadline for one remote call.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Namespace name.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, id: &EntityId) -> String {
        format!("{}:{}", self.namespace, id)
    }

    fn read(&self) -> RwLockReadGuard<'_, EntityTable<T>> {
        self.table
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntityTable<T>> {
        self.table
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a user mutation optimistically and push it to the remote.
    ///
    /// `updater` computes the next value from the current one. The result
    /// is committed in memory and persisted first; a persistence failure
    /// restores the previous value and is returned. `remote_sync` then
    /// receives the committed value. On remote failure the entity is
    /// restored to the newest value not produced by a failed call, unless a
    /// newer edit is still shown, and stays dirty. Commits to one namespace
    /// are serialized, so revisions follow call order.
    ///
    /// # Errors
    /// - `NotFound` if the entity does not exist
    /// - Storage errors from persisting the new value
    /// - Whatever `remote_sync` returns, or `Timeout`
    pub async fn apply<U, F, Fut>(&self, id: &EntityId, updater: U, remote_sync: F) -> Result<T>
    where
        U: FnOnce(&T) -> T,
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let (previous, next, base, revision) = {
            let _commit = self.commit_lock.lock().await;
            let (previous, next) = {
                let mut table = self.write();
                let previous = table.items.get(id).cloned().ok_or_else(|| {
                    Error::NotFound(format!("{} entity {}", self.namespace, id))
                })?;
                let next = updater(&previous);
                table.items.insert(id.clone(), next.clone());
                (previous, next)
            };

            if let Err(e) = write_json(self.store.as_ref(), &self.key(id), &next).await {
                warn!(
                    "Failed to persist {} {}, rolling back: {}",
                    self.namespace, id, e
                );
                self.restore_if_current(id, &next, previous);
                return Err(e);
            }

            let mut table = self.write();
            let meta = table.meta.entry(id.clone()).or_default();
            let base = meta.shown_revision();
            let revision = meta.begin_local();
            meta.begin_sync();
            (previous, next, base, revision)
        };
        debug!("{} {}: committed revision {}", self.namespace, id, revision);

        if !self.sync_enabled {
            if let Some(meta) = self.write().meta.get_mut(id) {
                meta.acknowledge_locally(revision);
            }
            return Ok(next);
        }

        match self.call_remote(remote_sync(next.clone())).await {
            Ok(()) => {
                self.acknowledge(id, revision);
                Ok(next)
            }
            Err(e) => {
                let _commit = self.commit_lock.lock().await;
                match self.roll_back(id, revision, Undo { base, value: previous }) {
                    Some(restored) => {
                        warn!(
                            "Remote sync of {} {} failed, rolled back: {}",
                            self.namespace, id, e
                        );
                        if let Err(store_err) =
                            write_json(self.store.as_ref(), &self.key(id), &restored).await
                        {
                            warn!(
                                "Failed to persist rollback of {} {}: {}",
                                self.namespace, id, store_err
                            );
                        }
                    }
                    None => warn!(
                        "Remote sync of {} {} revision {} failed after a newer edit; keeping it: {}",
                        self.namespace, id, revision, e
                    ),
                }
                Err(e)
            }
        }
    }

    /// Undo failed `revision` if its value is the one in memory.
    ///
    /// Walks back through earlier failed revisions whose values it would
    /// otherwise expose, and returns the value restored. A revision already
    /// covered by a newer edit is remembered so a later rollback of that
    /// edit skips past it.
    fn roll_back(&self, id: &EntityId, revision: Revision, undo: Undo<T>) -> Option<T> {
        let mut table = self.write();
        let EntityTable { items, meta, failed } = &mut *table;
        let meta = meta.entry(id.clone()).or_default();
        meta.fail();

        if meta.shown_revision() != revision {
            failed.entry(id.clone()).or_default().insert(revision, undo);
            return None;
        }

        let mut target = undo;
        if let Some(earlier) = failed.get_mut(id) {
            while let Some(older) = earlier.remove(&target.base) {
                target = older;
            }
            if earlier.is_empty() {
                failed.remove(id);
            }
        }
        meta.roll_back_to(target.base);
        items.insert(id.clone(), target.value.clone());
        Some(target.value)
    }

    /// Push the current value of a dirty entity again without creating a
    /// new revision.
    ///
    /// Returns the pushed value, or the current value untouched if the
    /// entity is already clean.
    pub async fn resync<F, Fut>(&self, id: &EntityId, remote_sync: F) -> Result<T>
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let (value, revision) = {
            let mut table = self.write();
            let value = table.items.get(id).cloned().ok_or_else(|| {
                Error::NotFound(format!("{} entity {}", self.namespace, id))
            })?;
            let meta = table.meta.entry(id.clone()).or_default();
            if !meta.dirty {
                return Ok(value);
            }
            meta.begin_sync();
            (value, meta.local_revision)
        };

        if !self.sync_enabled {
            if let Some(meta) = self.write().meta.get_mut(id) {
                meta.acknowledge_locally(revision);
            }
            return Ok(value);
        }

        match self.call_remote(remote_sync(value.clone())).await {
            Ok(()) => {
                self.acknowledge(id, revision);
                Ok(value)
            }
            Err(e) => {
                if let Some(meta) = self.write().meta.get_mut(id) {
                    meta.fail();
                }
                warn!("Resync of {} {} failed: {}", self.namespace, id, e);
                Err(e)
            }
        }
    }

    async fn call_remote<Fut>(&self, call: Fut) -> Result<()>
    where
        Fut: Future<Output = Result<()>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.call_timeout)),
        }
    }

    fn acknowledge(&self, id: &EntityId, revision: Revision) {
        let outcome = {
            let mut table = self.write();
            let outcome = table.meta.entry(id.clone()).or_default().acknowledge(revision);
            if outcome == AckOutcome::Clean {
                table.failed.remove(id);
            }
            outcome
        };
        match outcome {
            AckOutcome::Clean => debug!("{} {}: revision {} acknowledged", self.namespace, id, revision),
            AckOutcome::Superseded => debug!(
                "{} {}: revision {} acknowledged after a newer edit, still dirty",
                self.namespace, id, revision
            ),
        }
    }

    fn restore_if_current(&self, id: &EntityId, expected: &T, previous: T) {
        let mut table = self.write();
        if table.items.get(id) == Some(expected) {
            table.items.insert(id.clone(), previous);
        }
    }

    /// Add a new entity without any remote call.
    ///
    /// # Errors
    /// - `AlreadyExists` if the id is taken
    /// - Storage errors from persisting it
    pub async fn insert_local(&self, item: T) -> Result<()> {
        let id = item.entity_id();
        let _commit = self.commit_lock.lock().await;
        {
            let mut table = self.write();
            if table.items.contains_key(&id) {
                return Err(Error::AlreadyExists(format!(
                    "{} entity {}",
                    self.namespace, id
                )));
            }
            table.items.insert(id.clone(), item.clone());
            table.meta.insert(id.clone(), SyncMeta::default());
        }

        if let Err(e) = write_json(self.store.as_ref(), &self.key(&id), &item).await {
            let mut table = self.write();
            table.items.remove(&id);
            table.meta.remove(&id);
            return Err(e);
        }
        self.persist_index().await
    }

    /// Load one entity from the store into memory.
    ///
    /// Returns `None` if nothing is stored under the id. An entity already
    /// in memory is left as is and returned.
    pub async fn load(&self, id: &EntityId) -> Result<Option<T>> {
        if let Some(existing) = self.get(id) {
            return Ok(Some(existing));
        }
        let Some(stored) = read_json::<_, T>(self.store.as_ref(), &self.key(id)).await? else {
            return Ok(None);
        };

        let mut table = self.write();
        let value = table
            .items
            .entry(id.clone())
            .or_insert(stored)
            .clone();
        table.meta.entry(id.clone()).or_default();
        Ok(Some(value))
    }

    /// Load every entity listed in the namespace index.
    ///
    /// Entries that fail to decode are skipped. Returns the number loaded.
    pub async fn hydrate(&self) -> Result<usize> {
        let ids: Vec<EntityId> = read_json(self.store.as_ref(), &self.namespace)
            .await?
            .unwrap_or_default();

        let mut loaded = 0;
        for id in ids {
            match self.load(&id).await {
                Ok(Some(_)) => loaded += 1,
                Ok(None) => debug!("{} {} is indexed but not stored", self.namespace, id),
                Err(e) => warn!("Skipping stored {} {}: {}", self.namespace, id, e),
            }
        }
        info!("Loaded {} {} entities", loaded, self.namespace);
        Ok(loaded)
    }

    async fn persist_index(&self) -> Result<()> {
        let mut ids: Vec<EntityId> = self.read().items.keys().cloned().collect();
        ids.sort();
        write_json(self.store.as_ref(), &self.namespace, &ids).await
    }

    /// Capture local state before fetching a snapshot to reconcile.
    pub fn mark_snapshot(&self) -> SnapshotMark {
        let table = self.read();
        let revisions = table
            .items
            .keys()
            .map(|id| {
                let revision = table.meta.get(id).map_or(0, |m| m.local_revision);
                (id.clone(), revision)
            })
            .collect();
        let protected = table
            .meta
            .iter()
            .filter(|(_, meta)| meta.is_protected())
            .map(|(id, _)| id.clone())
            .collect();
        SnapshotMark {
            revisions,
            protected,
        }
    }

    /// Merge a remote snapshot fetched after `mark` into local state.
    ///
    /// Entities covered by the mark keep their local mutable fields. The
    /// in-memory swap is atomic; persisting the result is best-effort.
    pub async fn reconcile(&self, remote: Vec<T>, mark: &SnapshotMark) -> ReconcileReport
    where
        T: Reconcilable,
    {
        let _commit = self.commit_lock.lock().await;
        let (report, changed) = {
            let mut table = self.write();
            let result = {
                let meta = &table.meta;
                reconcile(remote, &table.items, |id| mark.covers(id, meta.get(id)))
            };

            let mut items = HashMap::with_capacity(result.entities.len());
            let mut changed = Vec::new();
            for (entity, disposition) in result.entities {
                let id = entity.entity_id();
                let meta = table.meta.entry(id.clone()).or_default();
                if disposition != Disposition::KeptLocal {
                    if let Some(updated_at) = entity.server_updated_at() {
                        meta.server_updated_at = Some(updated_at);
                    }
                    changed.push(entity.clone());
                }
                items.insert(id, entity);
            }
            for id in &result.report.dropped {
                table.meta.remove(id);
                table.failed.remove(id);
            }
            table.items = items;
            (result.report, changed)
        };

        for entity in changed {
            let id = entity.entity_id();
            if self.get(&id).as_ref() != Some(&entity) {
                continue;
            }
            if let Err(e) = write_json(self.store.as_ref(), &self.key(&id), &entity).await {
                warn!("Failed to persist reconciled {} {}: {}", self.namespace, id, e);
            }
        }
        for id in &report.dropped {
            if let Err(e) = self.store.delete(&self.key(id)).await {
                warn!("Failed to delete dropped {} {}: {}", self.namespace, id, e);
            }
        }
        if let Err(e) = self.persist_index().await {
            warn!("Failed to persist {} index: {}", self.namespace, e);
        }

        info!(
            "Reconciled {}: {} adopted, {} merged, {} kept, {} dropped",
            self.namespace,
            report.adopted,
            report.merged,
            report.kept_local,
            report.dropped.len()
        );
        report
    }

    /// Current in-memory value.
    pub fn get(&self, id: &EntityId) -> Option<T> {
        self.read().items.get(id).cloned()
    }

    /// All entities, ordered by id.
    pub fn items(&self) -> Vec<T> {
        let table = self.read();
        let mut ids: Vec<&EntityId> = table.items.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| table.items.get(id).cloned())
            .collect()
    }

    /// Sync bookkeeping for an entity.
    pub fn meta(&self, id: &EntityId) -> Option<SyncMeta> {
        self.read().meta.get(id).cloned()
    }

    /// Whether a remote snapshot must not overwrite the entity's local fields.
    pub fn is_protected(&self, id: &EntityId) -> bool {
        self.read()
            .meta
            .get(id)
            .is_some_and(SyncMeta::is_protected)
    }

    /// Ids of entities with unacknowledged local edits, ordered by id.
    pub fn dirty_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .read()
            .meta
            .iter()
            .filter(|(_, meta)| meta.dirty)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of entities in memory.
    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    /// Check if the namespace holds no entities.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use proptest::prelude::*;
    use sanctuary_storage::MemoryStore;
    use tokio::sync::oneshot;

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    async fn library_with(store: Arc<dyn QueueStore>, ids: &[&str]) -> EntitySync<LibraryItem> {
        let library = EntitySync::new("library", store);
        for i in ids {
            library
                .insert_local(LibraryItem::new(id(i), "Dune", "Frank Herbert"))
                .await
                .unwrap();
        }
        library
    }

    fn set_progress(p: u8) -> impl FnOnce(&LibraryItem) -> LibraryItem {
        move |item| item.with_progress(p as f64, &format!("cfi-{}", p), Utc::now())
    }

    /// Store whose writes start failing on demand.
    struct FlakyStore {
        inner: MemoryStore,
        failing: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl QueueStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Storage("disk full".to_string()));
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
    }

    /// Store whose writes park until permits are added, once gated.
    struct GatedStore {
        inner: MemoryStore,
        gated: std::sync::atomic::AtomicBool,
        parked: std::sync::atomic::AtomicUsize,
        writes: tokio::sync::Semaphore,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                gated: std::sync::atomic::AtomicBool::new(false),
                parked: std::sync::atomic::AtomicUsize::new(0),
                writes: tokio::sync::Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl QueueStore for GatedStore {
        fn name(&self) -> &str {
            "gated"
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
            if self.gated.load(std::sync::atomic::Ordering::SeqCst) {
                self.parked.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let _permit = self.writes.acquire().await.unwrap();
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_apply_success_marks_clean() {
        let store = Arc::new(MemoryStore::new());
        let library = library_with(store.clone(), &["b1"]).await;

        let next = library
            .apply(&id("b1"), set_progress(30), |_| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(next.progress_percent, 30);
        let meta = library.meta(&id("b1")).unwrap();
        assert!(!meta.dirty);
        assert_eq!(meta.local_revision, 1);
        assert_eq!(meta.last_ack_revision, 1);

        let stored: LibraryItem = read_json(store.as_ref(), "library:b1").await.unwrap().unwrap();
        assert_eq!(stored.progress_percent, 30);
    }

    #[tokio::test]
    async fn test_remote_failure_rolls_back() {
        let store = Arc::new(MemoryStore::new());
        let library = library_with(store.clone(), &["b1"]).await;

        let result = library
            .apply(&id("b1"), set_progress(30), |_| async {
                Err(Error::Network("offline".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(library.get(&id("b1")).unwrap().progress_percent, 0);
        let meta = library.meta(&id("b1")).unwrap();
        assert!(meta.dirty);
        assert!(!meta.sync_in_flight());
        assert_eq!(library.dirty_ids(), vec![id("b1")]);

        let stored: LibraryItem = read_json(store.as_ref(), "library:b1").await.unwrap().unwrap();
        assert_eq!(stored.progress_percent, 0);
    }

    #[tokio::test]
    async fn test_persist_failure_rolls_back_without_remote_call() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failing: std::sync::atomic::AtomicBool::new(false),
        });
        let library = library_with(store.clone(), &["b1"]).await;
        store.failing.store(true, std::sync::atomic::Ordering::SeqCst);

        let called = std::sync::atomic::AtomicBool::new(false);
        let called_ref = &called;
        let result = library
            .apply(&id("b1"), set_progress(55), move |_| async move {
                called_ref.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(library.get(&id("b1")).unwrap().progress_percent, 0);
        assert_eq!(library.meta(&id("b1")).unwrap().local_revision, 0);
    }

    #[tokio::test]
    async fn test_missing_entity_is_not_found() {
        let library = library_with(Arc::new(MemoryStore::new()), &[]).await;
        let result = library
            .apply(&id("nope"), set_progress(1), |_| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_local_only_mode_skips_remote() {
        let library = library_with(Arc::new(MemoryStore::new()), &["b1"])
            .await
            .with_sync_enabled(false);

        let result = library
            .apply(&id("b1"), set_progress(70), |_| async {
                Err(Error::Network("must not be called".to_string()))
            })
            .await
            .unwrap();

        assert_eq!(result.progress_percent, 70);
        let meta = library.meta(&id("b1")).unwrap();
        assert!(!meta.dirty);
        assert_eq!(meta.last_ack_revision, 1);
    }

    #[tokio::test]
    async fn test_slow_stale_ack_does_not_clobber_newer_edit() {
        let library = Arc::new(library_with(Arc::new(MemoryStore::new()), &["b1"]).await);
        let (release_first, first_gate) = oneshot::channel::<()>();

        let first = tokio::spawn({
            let library = library.clone();
            async move {
                library
                    .apply(&id("b1"), set_progress(10), |_| async move {
                        let _ = first_gate.await;
                        Ok(())
                    })
                    .await
            }
        });
        // Let the first mutation commit and park on its remote call.
        while library.meta(&id("b1")).is_none_or(|m| m.local_revision < 1) {
            tokio::task::yield_now().await;
        }

        let second = library
            .apply(&id("b1"), set_progress(20), |_| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(second.progress_percent, 20);
        assert!(library.is_protected(&id("b1")));

        let _ = release_first.send(());
        first.await.unwrap().unwrap();

        let item = library.get(&id("b1")).unwrap();
        let meta = library.meta(&id("b1")).unwrap();
        assert_eq!(item.progress_percent, 20);
        assert!(meta.dirty);
        assert_eq!(meta.local_revision, 2);
        assert_eq!(meta.last_ack_revision, 2);
        assert!(!meta.sync_in_flight());
    }

    #[tokio::test]
    async fn test_failed_stale_call_keeps_newer_edit() {
        let library = Arc::new(library_with(Arc::new(MemoryStore::new()), &["b1"]).await);
        let (release_first, first_gate) = oneshot::channel::<()>();

        let first = tokio::spawn({
            let library = library.clone();
            async move {
                library
                    .apply(&id("b1"), set_progress(10), |_| async move {
                        let _ = first_gate.await;
                        Err(Error::Network("dropped".to_string()))
                    })
                    .await
            }
        });
        while library.meta(&id("b1")).is_none_or(|m| m.local_revision < 1) {
            tokio::task::yield_now().await;
        }

        library
            .apply(&id("b1"), set_progress(20), |_| async { Ok(()) })
            .await
            .unwrap();
        let _ = release_first.send(());
        assert!(first.await.unwrap().is_err());

        assert_eq!(library.get(&id("b1")).unwrap().progress_percent, 20);
        assert!(library.meta(&id("b1")).unwrap().dirty);
    }

    #[tokio::test]
    async fn test_overlapping_failures_restore_last_good_value() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let library = Arc::new(library_with(store.clone(), &["b1"]).await);
        let (release_first, first_gate) = oneshot::channel::<()>();

        let first = tokio::spawn({
            let library = library.clone();
            async move {
                library
                    .apply(&id("b1"), set_progress(10), |_| async move {
                        let _ = first_gate.await;
                        Err(Error::Network("dropped".to_string()))
                    })
                    .await
            }
        });
        while library.meta(&id("b1")).is_none_or(|m| m.local_revision < 1) {
            tokio::task::yield_now().await;
        }

        let second = library
            .apply(&id("b1"), set_progress(20), |_| async {
                Err(Error::Network("offline".to_string()))
            })
            .await;
        assert!(second.is_err());
        assert_eq!(library.get(&id("b1")).unwrap().progress_percent, 10);

        let _ = release_first.send(());
        assert!(first.await.unwrap().is_err());

        assert_eq!(library.get(&id("b1")).unwrap().progress_percent, 0);
        let stored: LibraryItem = read_json(store.as_ref(), "library:b1").await.unwrap().unwrap();
        assert_eq!(stored.progress_percent, 0);
        let meta = library.meta(&id("b1")).unwrap();
        assert!(meta.dirty);
        assert_eq!(meta.shown_revision(), 0);
    }

    #[tokio::test]
    async fn test_buried_failure_is_skipped_by_later_rollback() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let library = Arc::new(library_with(store.clone(), &["b1"]).await);
        let (release_second, second_gate) = oneshot::channel::<()>();
        let (release_first, first_gate) = oneshot::channel::<()>();

        let first = tokio::spawn({
            let library = library.clone();
            async move {
                library
                    .apply(&id("b1"), set_progress(10), |_| async move {
                        let _ = first_gate.await;
                        Err(Error::Network("dropped".to_string()))
                    })
                    .await
            }
        });
        while library.meta(&id("b1")).is_none_or(|m| m.local_revision < 1) {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let library = library.clone();
            async move {
                library
                    .apply(&id("b1"), set_progress(20), |_| async move {
                        let _ = second_gate.await;
                        Err(Error::Network("dropped".to_string()))
                    })
                    .await
            }
        });
        while library.meta(&id("b1")).is_none_or(|m| m.local_revision < 2) {
            tokio::task::yield_now().await;
        }

        // The older call fails first while the newer edit is still shown.
        let _ = release_first.send(());
        assert!(first.await.unwrap().is_err());
        assert_eq!(library.get(&id("b1")).unwrap().progress_percent, 20);

        let _ = release_second.send(());
        assert!(second.await.unwrap().is_err());
        assert_eq!(library.get(&id("b1")).unwrap().progress_percent, 0);
        let stored: LibraryItem = read_json(store.as_ref(), "library:b1").await.unwrap().unwrap();
        assert_eq!(stored.progress_percent, 0);
    }

    #[tokio::test]
    async fn test_rollback_stops_at_acknowledged_edit() {
        let library = Arc::new(library_with(Arc::new(MemoryStore::new()), &["b1"]).await);
        let (release_first, first_gate) = oneshot::channel::<()>();

        let first = tokio::spawn({
            let library = library.clone();
            async move {
                library
                    .apply(&id("b1"), set_progress(10), |_| async move {
                        let _ = first_gate.await;
                        Ok(())
                    })
                    .await
            }
        });
        while library.meta(&id("b1")).is_none_or(|m| m.local_revision < 1) {
            tokio::task::yield_now().await;
        }

        assert!(library
            .apply(&id("b1"), set_progress(20), |_| async {
                Err(Error::Network("offline".to_string()))
            })
            .await
            .is_err());
        let _ = release_first.send(());
        first.await.unwrap().unwrap();

        assert_eq!(library.get(&id("b1")).unwrap().progress_percent, 10);
        assert!(library.meta(&id("b1")).unwrap().dirty);
    }

    #[tokio::test]
    async fn test_concurrent_applies_commit_in_call_order() {
        let store = Arc::new(GatedStore::new());
        let library = Arc::new(library_with(store.clone(), &["b1"]).await);
        store.gated.store(true, std::sync::atomic::Ordering::SeqCst);
        let (release_first, first_gate) = oneshot::channel::<()>();

        let first = tokio::spawn({
            let library = library.clone();
            async move {
                library
                    .apply(&id("b1"), set_progress(10), |_| async move {
                        let _ = first_gate.await;
                        Err(Error::Network("dropped".to_string()))
                    })
                    .await
            }
        });
        while store.parked.load(std::sync::atomic::Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = tokio::spawn({
            let library = library.clone();
            async move {
                library
                    .apply(&id("b1"), set_progress(20), |_| async { Ok(()) })
                    .await
            }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // The second edit waits behind the first one's store write.
        assert_eq!(store.parked.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(library.get(&id("b1")).unwrap().progress_percent, 10);
        assert_eq!(library.meta(&id("b1")).unwrap().local_revision, 0);

        store.writes.add_permits(16);
        let committed = second.await.unwrap().unwrap();
        assert_eq!(committed.progress_percent, 20);
        assert_eq!(library.meta(&id("b1")).unwrap().local_revision, 2);

        let _ = release_first.send(());
        assert!(first.await.unwrap().is_err());

        assert_eq!(library.get(&id("b1")).unwrap().progress_percent, 20);
        let stored: LibraryItem = read_json(store.as_ref(), "library:b1").await.unwrap().unwrap();
        assert_eq!(stored.progress_percent, 20);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_edit_acknowledged_during_fetch() {
        let library = library_with(Arc::new(MemoryStore::new()), &["b1", "b2"]).await;
        let mark = library.mark_snapshot();

        // Snapshot read on the remote before the edit arrived.
        let stale = vec![
            LibraryItem::new(id("b1"), "Dune", "Frank Herbert"),
            LibraryItem::new(id("b2"), "Dune Messiah", "Frank Herbert"),
        ];
        library
            .apply(&id("b1"), |item| LibraryItem { favorite: true, ..item.clone() }, |_| async {
                Ok(())
            })
            .await
            .unwrap();
        assert!(!library.is_protected(&id("b1")));

        let report = library.reconcile(stale, &mark).await;
        assert_eq!(report.merged, 1);
        assert_eq!(report.adopted, 1);
        assert!(library.get(&id("b1")).unwrap().favorite);
        assert_eq!(library.get(&id("b2")).unwrap().title, "Dune Messiah");
    }

    #[tokio::test]
    async fn test_reconcile_keeps_entity_added_during_fetch() {
        let library = library_with(Arc::new(MemoryStore::new()), &["b1"]).await;
        let mark = library.mark_snapshot();
        library
            .insert_local(LibraryItem::new(id("b9"), "Children of Dune", "Frank Herbert"))
            .await
            .unwrap();

        let report = library
            .reconcile(vec![LibraryItem::new(id("b1"), "Dune", "Frank Herbert")], &mark)
            .await;
        assert!(report.dropped.is_empty());
        assert!(library.get(&id("b9")).is_some());
    }

    #[tokio::test]
    async fn test_resync_cleans_dirty_entity() {
        let library = library_with(Arc::new(MemoryStore::new()), &["b1"]).await;
        let _ = library
            .apply(&id("b1"), set_progress(30), |_| async {
                Err(Error::Network("offline".to_string()))
            })
            .await;
        assert!(library.meta(&id("b1")).unwrap().dirty);

        let pushed = library
            .resync(&id("b1"), |_| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(pushed.progress_percent, 0);
        let meta = library.meta(&id("b1")).unwrap();
        assert!(!meta.dirty);
        assert_eq!(meta.local_revision, 1);
        assert!(library.dirty_ids().is_empty());
    }

    #[tokio::test]
    async fn test_hydrate_restores_indexed_entities() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let library = library_with(store.clone(), &["b1", "b2"]).await;
        library
            .apply(&id("b2"), set_progress(64), |_| async { Ok(()) })
            .await
            .unwrap();

        let restored: EntitySync<LibraryItem> = EntitySync::new("library", store);
        assert_eq!(restored.hydrate().await.unwrap(), 2);
        assert_eq!(restored.get(&id("b2")).unwrap().progress_percent, 64);
        assert!(!restored.is_protected(&id("b2")));
    }

    #[tokio::test]
    async fn test_insert_local_rejects_duplicates() {
        let library = library_with(Arc::new(MemoryStore::new()), &["b1"]).await;
        let result = library
            .insert_local(LibraryItem::new(id("b1"), "Other", "Other"))
            .await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_reconcile_protects_dirty_items() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let library = library_with(store.clone(), &["b1", "b2", "b3"]).await;
        library
            .apply(&id("b1"), set_progress(42), |_| async {
                Err(Error::Timeout(Duration::from_secs(1)))
            })
            .await
            .unwrap_err();

        let mut remote_b1 = LibraryItem::new(id("b1"), "Dune (Deluxe)", "F. Herbert");
        remote_b1.progress_percent = 10;
        remote_b1.updated_at = Some(Utc::now());
        let mut remote_b2 = LibraryItem::new(id("b2"), "Dune", "Frank Herbert");
        remote_b2.progress_percent = 90;

        let mark = library.mark_snapshot().protect([id("b3")]);
        let report = library.reconcile(vec![remote_b1, remote_b2], &mark).await;

        assert_eq!(report.merged, 1);
        assert_eq!(report.adopted, 1);
        assert_eq!(report.kept_local, 1);
        assert!(report.dropped.is_empty());

        let b1 = library.get(&id("b1")).unwrap();
        assert_eq!(b1.progress_percent, 0);
        assert_eq!(b1.title, "Dune (Deluxe)");
        assert_eq!(b1.author, "F. Herbert");
        assert_eq!(library.get(&id("b2")).unwrap().progress_percent, 90);
        assert!(library.get(&id("b3")).is_some());
        assert!(library.meta(&id("b1")).unwrap().server_updated_at.is_some());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_local_progress_over_remote() {
        let library = library_with(Arc::new(MemoryStore::new()), &["b1"]).await;
        let gate = Arc::new(tokio::sync::Notify::new());
        let library = Arc::new(library);

        let pending = tokio::spawn({
            let library = library.clone();
            let gate = gate.clone();
            async move {
                library
                    .apply(&id("b1"), set_progress(42), |_| async move {
                        gate.notified().await;
                        Ok(())
                    })
                    .await
            }
        });
        while !library.is_protected(&id("b1")) {
            tokio::task::yield_now().await;
        }

        let mut remote = LibraryItem::new(id("b1"), "New Title", "New Author");
        remote.progress_percent = 10;
        let mark = library.mark_snapshot();
        library.reconcile(vec![remote], &mark).await;

        let merged = library.get(&id("b1")).unwrap();
        assert_eq!(merged.progress_percent, 42);
        assert_eq!(merged.title, "New Title");
        assert_eq!(merged.author, "New Author");

        gate.notify_one();
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_drops_clean_missing_items() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let library = library_with(store.clone(), &["b1", "b2"]).await;

        let mark = library.mark_snapshot();
        let report = library
            .reconcile(vec![LibraryItem::new(id("b1"), "T", "A")], &mark)
            .await;

        assert_eq!(report.dropped, vec![id("b2")]);
        assert!(library.get(&id("b2")).is_none());
        assert!(store.get("library:b2").await.unwrap().is_none());
        let index: Vec<EntityId> = read_json(store.as_ref(), "library").await.unwrap().unwrap();
        assert_eq!(index, vec![id("b1")]);
    }

    proptest! {
        #[test]
        fn prop_revisions_strictly_increase(outcomes in prop::collection::vec(any::<bool>(), 1..20)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let library = library_with(Arc::new(MemoryStore::new()), &["b1"]).await;
                let mut last = 0;
                for (n, succeed) in outcomes.into_iter().enumerate() {
                    let _ = library
                        .apply(&id("b1"), set_progress((n % 100) as u8), move |_| async move {
                            if succeed {
                                Ok(())
                            } else {
                                Err(Error::Network("flaky".to_string()))
                            }
                        })
                        .await;
                    let meta = library.meta(&id("b1")).unwrap();
                    prop_assert!(meta.local_revision > last);
                    prop_assert_eq!(meta.dirty, !succeed);
                    last = meta.local_revision;
                }
                Ok(())
            })?;
        }
    }
}
