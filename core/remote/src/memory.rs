//! In-memory remote for testing and offline runs.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

use sanctuary_common::{
    EntityId, Error, LibraryItem, LibraryPatch, ReaderSettings, ReadingSession, Result,
};

use crate::client::RemoteSyncClient;

#[derive(Default)]
struct RemoteData {
    library: BTreeMap<EntityId, LibraryItem>,
    sessions: HashMap<EntityId, ReadingSession>,
    settings: Option<ReaderSettings>,
    patches: Vec<(EntityId, LibraryPatch)>,
}

/// In-memory remote store.
///
/// Behaves like the CRUD API: patches update stored items and bump their
/// `updatedAt`, sessions are upserted by id. Failures can be injected to
/// exercise retry paths. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    data: Arc<RwLock<RemoteData>>,
    fail_next: Arc<AtomicU32>,
    offline: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl MemoryRemote {
    /// Create an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a remote pre-populated with library items.
    pub fn with_library(items: impl IntoIterator<Item = LibraryItem>) -> Self {
        let remote = Self::new();
        if let Ok(mut data) = remote.data.write() {
            for item in items {
                data.library.insert(item.id.clone(), item);
            }
        }
        remote
    }

    /// Make the next `count` calls fail with a network error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every call until switched back online.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Total number of calls received, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Current server-side copy of a library item.
    pub fn item(&self, id: &str) -> Option<LibraryItem> {
        self.data.read().ok()?.library.get(id).cloned()
    }

    /// Insert or replace a library item directly on the "server".
    pub fn put_item(&self, item: LibraryItem) {
        if let Ok(mut data) = self.data.write() {
            data.library.insert(item.id.clone(), item);
        }
    }

    /// Server-side copy of a session.
    pub fn session(&self, id: &str) -> Option<ReadingSession> {
        self.data.read().ok()?.sessions.get(id).cloned()
    }

    /// Every patch accepted so far, in arrival order.
    pub fn patches(&self) -> Vec<(EntityId, LibraryPatch)> {
        self.data
            .read()
            .map(|d| d.patches.clone())
            .unwrap_or_default()
    }

    /// Stored reader settings.
    pub fn stored_settings(&self) -> Option<ReaderSettings> {
        self.data.read().ok()?.settings.clone()
    }

    fn check_available(&self, what: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network(format!("{}: remote unreachable", what)));
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Network(format!("{}: injected failure", what)));
        }
        Ok(())
    }

    fn poisoned() -> Error {
        Error::Storage("memory remote lock poisoned".to_string())
    }
}

#[async_trait]
impl RemoteSyncClient for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn patch_library_item(&self, id: &EntityId, patch: &LibraryPatch) -> Result<()> {
        self.check_available("patch library item")?;
        let mut data = self.data.write().map_err(|_| Self::poisoned())?;

        let item = data
            .library
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Library item {}", id)))?;
        patch.apply_to(item);
        item.updated_at = Some(Utc::now());

        data.patches.push((id.clone(), patch.clone()));
        debug!("Remote accepted patch for {}", id);
        Ok(())
    }

    async fn save_session(&self, session: &ReadingSession) -> Result<()> {
        self.check_available("save session")?;
        let mut data = self.data.write().map_err(|_| Self::poisoned())?;
        data.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_library(&self) -> Result<Vec<LibraryItem>> {
        self.check_available("fetch library")?;
        let data = self.data.read().map_err(|_| Self::poisoned())?;
        Ok(data.library.values().cloned().collect())
    }

    async fn get_sessions(&self) -> Result<Vec<ReadingSession>> {
        self.check_available("fetch sessions")?;
        let data = self.data.read().map_err(|_| Self::poisoned())?;
        let mut sessions: Vec<ReadingSession> = data.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(sessions)
    }

    async fn get_settings(&self) -> Result<Option<ReaderSettings>> {
        self.check_available("fetch settings")?;
        let data = self.data.read().map_err(|_| Self::poisoned())?;
        Ok(data.settings.clone())
    }

    async fn save_settings(&self, settings: &ReaderSettings) -> Result<()> {
        self.check_available("save settings")?;
        let mut data = self.data.write().map_err(|_| Self::poisoned())?;
        data.settings = Some(settings.clone());
        Ok(())
    }
}
