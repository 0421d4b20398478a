//! Queue channels for the two background mutation kinds.

use async_trait::async_trait;
use std::sync::Arc;

use sanctuary_common::{EntityId, Error, LibraryPatch, ReadingSession, Result};
use sanctuary_remote::RemoteSyncClient;

use crate::queue::{MutationQueue, QueueChannel};

/// Store key of the persisted progress queue.
pub const PROGRESS_QUEUE_KEY: &str = "sanctuary:v2:progress-queue";

/// Store key of the persisted session queue.
pub const SESSION_QUEUE_KEY: &str = "sanctuary:v2:sessions-queue";

/// Queue of reading-progress patches.
pub type ProgressQueue = MutationQueue<ProgressChannel>;

/// Queue of reading-session records.
pub type SessionQueue = MutationQueue<SessionChannel>;

/// Delivers progress patches with `patch_library_item`.
///
/// Entries persist as the patch object plus an `id` field.
pub struct ProgressChannel {
    remote: Arc<dyn RemoteSyncClient>,
}

impl ProgressChannel {
    pub fn new(remote: Arc<dyn RemoteSyncClient>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl QueueChannel for ProgressChannel {
    type Payload = LibraryPatch;

    fn label(&self) -> &str {
        "progress"
    }

    fn storage_key(&self) -> &str {
        PROGRESS_QUEUE_KEY
    }

    fn encode(&self, entity_id: &EntityId, payload: &LibraryPatch) -> Result<serde_json::Value> {
        let mut value =
            serde_json::to_value(payload).map_err(|e| Error::Serialization(e.to_string()))?;
        match value.as_object_mut() {
            Some(fields) => {
                fields.insert(
                    "id".to_string(),
                    serde_json::Value::String(entity_id.to_string()),
                );
                Ok(value)
            }
            None => Err(Error::Serialization(
                "library patch did not serialize to an object".to_string(),
            )),
        }
    }

    fn decode(&self, raw: serde_json::Value) -> Option<(EntityId, LibraryPatch)> {
        let id = raw.get("id")?.as_str()?;
        let entity_id = EntityId::new(id).ok()?;
        let patch = serde_json::from_value(raw).ok()?;
        Some((entity_id, patch))
    }

    async fn deliver(&self, entity_id: &EntityId, payload: &LibraryPatch) -> Result<()> {
        self.remote.patch_library_item(entity_id, payload).await
    }
}

/// Delivers reading sessions with `save_session`.
///
/// Entries persist as the session record itself; records without a book id
/// are dropped on load.
pub struct SessionChannel {
    remote: Arc<dyn RemoteSyncClient>,
}

impl SessionChannel {
    pub fn new(remote: Arc<dyn RemoteSyncClient>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl QueueChannel for SessionChannel {
    type Payload = ReadingSession;

    fn label(&self) -> &str {
        "sessions"
    }

    fn storage_key(&self) -> &str {
        SESSION_QUEUE_KEY
    }

    fn encode(&self, _entity_id: &EntityId, payload: &ReadingSession) -> Result<serde_json::Value> {
        serde_json::to_value(payload).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode(&self, raw: serde_json::Value) -> Option<(EntityId, ReadingSession)> {
        let session: ReadingSession = serde_json::from_value(raw).ok()?;
        Some((session.id.clone(), session))
    }

    async fn deliver(&self, _entity_id: &EntityId, payload: &ReadingSession) -> Result<()> {
        self.remote.save_session(payload).await
    }
}
