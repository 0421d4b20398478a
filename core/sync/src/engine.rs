//! Sync engine that wires queues, entity state and the remote for one app
//! session.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use sanctuary_common::{
    Bookmark, EntityId, LibraryItem, LibraryPatch, ReaderSettings, ReadingSession, ReadingStatus,
    Result,
};
use sanctuary_remote::RemoteSyncClient;
use sanctuary_storage::QueueStore;

use crate::channels::{ProgressChannel, ProgressQueue, SessionChannel, SessionQueue};
use crate::entity::EntitySync;
use crate::queue::{FlushOutcome, QueueConfig, QueueState};
use crate::reconcile::ReconcileReport;
use crate::retry::{RetryConfig, RetryExecutor};

/// Store namespace of library items.
pub const LIBRARY_NAMESPACE: &str = "library";

/// Store namespace of reader settings.
pub const SETTINGS_NAMESPACE: &str = "settings";

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// When false, mutations stay local and nothing is sent to the remote.
    pub sync_enabled: bool,
    /// Timing of the reading-progress queue.
    pub progress_queue: QueueConfig,
    /// Timing of the reading-session queue.
    pub session_queue: QueueConfig,
    /// Deadline for direct remote calls.
    pub call_timeout: Duration,
    /// Retry policy for library snapshot fetches.
    pub library_fetch_retry: RetryConfig,
}

impl EngineConfig {
    /// Set whether mutations are sent to the remote.
    pub fn with_sync_enabled(mut self, enabled: bool) -> Self {
        self.sync_enabled = enabled;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_enabled: true,
            progress_queue: QueueConfig::progress(),
            session_queue: QueueConfig::sessions(),
            call_timeout: Duration::from_secs(15),
            library_fetch_retry: RetryConfig::fetch(),
        }
    }
}

/// Combined status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncIndicator {
    Synced,
    Syncing,
    SyncError,
}

impl SyncIndicator {
    /// Fold queue states into one indicator. An error anywhere wins.
    pub fn from_states(states: &[QueueState]) -> Self {
        if states.contains(&QueueState::Error) {
            SyncIndicator::SyncError
        } else if states.contains(&QueueState::Syncing) {
            SyncIndicator::Syncing
        } else {
            SyncIndicator::Synced
        }
    }
}

/// Outcome of flushing both queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub progress: FlushOutcome,
    pub sessions: FlushOutcome,
}

/// One app session's sync engine.
///
/// Owns the progress and session queues plus the library and settings
/// entity namespaces. Construct it once at startup and pass it around;
/// nothing here is global.
pub struct SyncEngine {
    remote: Arc<dyn RemoteSyncClient>,
    progress: ProgressQueue,
    sessions: SessionQueue,
    library: EntitySync<LibraryItem>,
    settings: EntitySync<ReaderSettings>,
    fetcher: RetryExecutor,
    config: EngineConfig,
}

impl SyncEngine {
    /// Create an engine over `store` talking to `remote`.
    pub fn new(
        remote: Arc<dyn RemoteSyncClient>,
        store: Arc<dyn QueueStore>,
        config: EngineConfig,
    ) -> Self {
        let progress = ProgressQueue::new(
            ProgressChannel::new(Arc::clone(&remote)),
            Arc::clone(&store),
            config.progress_queue.clone(),
        );
        let sessions = SessionQueue::new(
            SessionChannel::new(Arc::clone(&remote)),
            Arc::clone(&store),
            config.session_queue.clone(),
        );
        let library = EntitySync::new(LIBRARY_NAMESPACE, Arc::clone(&store))
            .with_sync_enabled(config.sync_enabled)
            .with_call_timeout(config.call_timeout);
        let settings = EntitySync::new(SETTINGS_NAMESPACE, store)
            .with_sync_enabled(config.sync_enabled)
            .with_call_timeout(config.call_timeout);

        Self {
            remote,
            progress,
            sessions,
            library,
            settings,
            fetcher: RetryExecutor::new(config.library_fetch_retry.clone()),
            config,
        }
    }

    /// Restore persisted state and schedule delivery of anything pending.
    ///
    /// # Errors
    /// - Storage errors while loading the library index or settings
    pub async fn init(&self) -> Result<()> {
        self.progress.init().await;
        self.sessions.init().await;
        let books = self.library.hydrate().await?;

        let settings_id = ReaderSettings::entity_id();
        if self.settings.load(&settings_id).await?.is_none() {
            self.settings.insert_local(ReaderSettings::default()).await?;
        }

        info!(
            "Sync engine ready with {} books, {} queued progress updates, {} queued sessions (sync {})",
            books,
            self.progress.len(),
            self.sessions.len(),
            if self.config.sync_enabled { "on" } else { "off" }
        );
        Ok(())
    }

    /// Record a new reading position.
    ///
    /// Committed locally right away; delivery goes through the debounced
    /// progress queue.
    pub async fn update_progress(
        &self,
        book_id: &EntityId,
        percent: f64,
        location: &str,
    ) -> Result<LibraryItem> {
        let queue = self.progress.clone();
        let id = book_id.clone();
        self.library
            .apply(
                book_id,
                |item| item.with_progress(percent, location, Utc::now()),
                move |next| async move {
                    queue.enqueue(id, LibraryPatch::progress_of(&next)).await;
                    Ok(())
                },
            )
            .await
    }

    /// Add a bookmark; an existing bookmark at the same position is kept.
    pub async fn add_bookmark(&self, book_id: &EntityId, bookmark: Bookmark) -> Result<LibraryItem> {
        self.apply_library(
            book_id,
            move |item| {
                let mut next = item.clone();
                if !next.has_bookmark(&bookmark.cfi) {
                    next.bookmarks.push(bookmark);
                }
                next
            },
            bookmarks_patch,
        )
        .await
    }

    /// Remove the bookmark at `cfi`, if present.
    pub async fn remove_bookmark(&self, book_id: &EntityId, cfi: &str) -> Result<LibraryItem> {
        self.apply_library(
            book_id,
            |item| {
                let mut next = item.clone();
                next.bookmarks.retain(|b| b.cfi != cfi);
                next
            },
            bookmarks_patch,
        )
        .await
    }

    /// Flip the favorite flag.
    pub async fn toggle_favorite(&self, book_id: &EntityId) -> Result<LibraryItem> {
        self.apply_library(
            book_id,
            |item| {
                let mut next = item.clone();
                next.favorite = !item.favorite;
                next
            },
            |item| LibraryPatch {
                favorite: Some(item.favorite),
                ..LibraryPatch::default()
            },
        )
        .await
    }

    /// Move a book to another reading list.
    pub async fn set_reading_status(
        &self,
        book_id: &EntityId,
        status: ReadingStatus,
    ) -> Result<LibraryItem> {
        self.apply_library(
            book_id,
            |item| item.with_status(status, Utc::now()),
            LibraryPatch::local_fields_of,
        )
        .await
    }

    async fn apply_library<U>(
        &self,
        book_id: &EntityId,
        updater: U,
        patch_of: fn(&LibraryItem) -> LibraryPatch,
    ) -> Result<LibraryItem>
    where
        U: FnOnce(&LibraryItem) -> LibraryItem,
    {
        let remote = Arc::clone(&self.remote);
        let id = book_id.clone();
        self.library
            .apply(book_id, updater, move |next| async move {
                remote.patch_library_item(&id, &patch_of(&next)).await
            })
            .await
    }

    /// Queue a finished or ongoing reading session for delivery.
    pub async fn record_session(&self, session: ReadingSession) {
        if !self.config.sync_enabled {
            debug!("Sync disabled, not queueing session {}", session.id);
            return;
        }
        self.sessions.enqueue(session.id.clone(), session).await;
    }

    /// Change reader settings and push them to the remote.
    pub async fn save_settings<U>(&self, updater: U) -> Result<ReaderSettings>
    where
        U: FnOnce(&ReaderSettings) -> ReaderSettings,
    {
        let remote = Arc::clone(&self.remote);
        self.settings
            .apply(&ReaderSettings::entity_id(), updater, move |next| async move {
                remote.save_settings(&next).await
            })
            .await
    }

    /// Current reader settings.
    pub fn settings(&self) -> ReaderSettings {
        self.settings
            .get(&ReaderSettings::entity_id())
            .unwrap_or_default()
    }

    /// Fetch the remote library and merge it into local state.
    ///
    /// Books with unacknowledged edits or queued progress keep their local
    /// reading state, and so do books edited while the fetch was running.
    ///
    /// # Errors
    /// - Remote errors once the fetch retries are exhausted
    pub async fn refresh_library(&self) -> Result<ReconcileReport> {
        let mark = self
            .library
            .mark_snapshot()
            .protect(self.progress.pending_ids());
        let remote = Arc::clone(&self.remote);
        let snapshot = self
            .fetcher
            .execute(|| {
                let remote = Arc::clone(&remote);
                async move { remote.get_library().await }
            })
            .await?;
        debug!("Fetched {} library items", snapshot.len());

        let mark = mark.protect(self.progress.pending_ids());
        Ok(self.library.reconcile(snapshot, &mark).await)
    }

    /// Fetch remote settings and adopt them unless local edits are pending.
    ///
    /// Returns the settings in effect afterwards.
    pub async fn refresh_settings(&self) -> Result<ReaderSettings> {
        let mark = self.settings.mark_snapshot();
        let remote = Arc::clone(&self.remote);
        let fetched = self
            .fetcher
            .execute(|| {
                let remote = Arc::clone(&remote);
                async move { remote.get_settings().await }
            })
            .await?;

        match fetched {
            Some(settings) => {
                self.settings.reconcile(vec![settings], &mark).await;
            }
            None => debug!("Remote has no settings yet"),
        }
        Ok(self.settings())
    }

    /// Push every library item left dirty by a failed direct call.
    ///
    /// Returns the number of items that are clean afterwards.
    pub async fn resync_dirty(&self) -> usize {
        let mut cleaned = 0;
        for id in self.library.dirty_ids() {
            let remote = Arc::clone(&self.remote);
            let target = id.clone();
            let result = self
                .library
                .resync(&id, move |item| async move {
                    remote
                        .patch_library_item(&target, &LibraryPatch::local_fields_of(&item))
                        .await
                })
                .await;
            match result {
                Ok(_) => cleaned += 1,
                Err(e) => warn!("Book {} still dirty: {}", id, e),
            }
        }
        cleaned
    }

    /// One library item.
    pub fn book(&self, book_id: &EntityId) -> Option<LibraryItem> {
        self.library.get(book_id)
    }

    /// Every library item, ordered by id.
    pub fn library(&self) -> Vec<LibraryItem> {
        self.library.items()
    }

    /// Add a book to the local library without contacting the remote.
    pub async fn add_local_book(&self, item: LibraryItem) -> Result<()> {
        self.library.insert_local(item).await
    }

    /// Library entity state, for inspection.
    pub fn library_state(&self) -> &EntitySync<LibraryItem> {
        &self.library
    }

    /// Progress queue handle.
    pub fn progress_queue(&self) -> &ProgressQueue {
        &self.progress
    }

    /// Session queue handle.
    pub fn session_queue(&self) -> &SessionQueue {
        &self.sessions
    }

    /// Combined indicator over both queues.
    pub fn status(&self) -> SyncIndicator {
        SyncIndicator::from_states(&[self.progress.state(), self.sessions.state()])
    }

    /// Flush both queues now.
    pub async fn flush(&self) -> FlushReport {
        let (progress, sessions) = futures::join!(self.progress.flush(), self.sessions.flush());
        FlushReport { progress, sessions }
    }

    /// Stop both queues and persist them.
    pub async fn dispose(&self) {
        futures::join!(self.progress.dispose(), self.sessions.dispose());
        info!("Sync engine disposed");
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn bookmarks_patch(item: &LibraryItem) -> LibraryPatch {
    LibraryPatch {
        bookmarks: Some(item.bookmarks.clone()),
        ..LibraryPatch::default()
    }
}
