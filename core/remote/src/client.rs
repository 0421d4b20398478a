//! Remote sync client trait definition.

use async_trait::async_trait;

use sanctuary_common::{EntityId, LibraryItem, LibraryPatch, ReaderSettings, ReadingSession, Result};

/// One network call per mutation kind, plus the snapshot reads used for
/// reconciliation.
///
/// Every write carries the full desired field set for what it touches, so
/// repeating a call is harmless. Failures are reported as errors; the
/// caller never inspects status codes. Implementations are stateless from
/// the engine's point of view and may be shared freely.
#[async_trait]
pub trait RemoteSyncClient: Send + Sync {
    /// Get the client name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Update the listed fields of one library item.
    ///
    /// # Errors
    /// - Item not found
    /// - Network/remote errors
    async fn patch_library_item(&self, id: &EntityId, patch: &LibraryPatch) -> Result<()>;

    /// Store a reading session record, replacing any record with the same id.
    async fn save_session(&self, session: &ReadingSession) -> Result<()>;

    /// Fetch the full library listing.
    async fn get_library(&self) -> Result<Vec<LibraryItem>>;

    /// Fetch all recorded reading sessions.
    async fn get_sessions(&self) -> Result<Vec<ReadingSession>>;

    /// Fetch reader settings; `None` when the user never saved any.
    async fn get_settings(&self) -> Result<Option<ReaderSettings>>;

    /// Replace reader settings.
    async fn save_settings(&self, settings: &ReaderSettings) -> Result<()>;
}
