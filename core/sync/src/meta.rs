//! Per-entity revision bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Revision of a locally applied mutation. Starts at 1 for the first edit.
pub type Revision = u64;

/// Sync bookkeeping for one entity.
///
/// `local_revision` counts locally applied mutations; `last_ack_revision`
/// is the newest revision the remote confirmed while it was still the
/// newest local one. `dirty` is true whenever `local_revision` is ahead of
/// `last_ack_revision`, and may also be true when a stale write landed on
/// the remote after a newer one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    pub dirty: bool,
    pub local_revision: Revision,
    pub last_ack_revision: Revision,
    #[serde(skip)]
    in_flight: u32,
    #[serde(skip)]
    shown_revision: Revision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_updated_at: Option<DateTime<Utc>>,
}

/// Outcome of acknowledging a remote success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The acknowledged revision is the newest; the entity is clean.
    Clean,
    /// A newer local edit exists; the entity stays dirty.
    Superseded,
}

impl SyncMeta {
    /// Record a new local mutation and return its revision.
    pub fn begin_local(&mut self) -> Revision {
        self.local_revision += 1;
        self.dirty = true;
        self.shown_revision = self.local_revision;
        self.local_revision
    }

    /// Revision whose value is currently held in memory. Lower than
    /// `local_revision` after a rollback; 0 means no local edit survives.
    pub fn shown_revision(&self) -> Revision {
        self.shown_revision
    }

    /// Record that memory was rolled back to the value of `revision`.
    pub fn roll_back_to(&mut self, revision: Revision) {
        self.shown_revision = revision.min(self.local_revision);
    }

    /// Mark a remote call as outstanding.
    pub fn begin_sync(&mut self) {
        self.in_flight += 1;
    }

    fn end_sync(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Acknowledge that the remote call carrying `revision` succeeded.
    pub fn acknowledge(&mut self, revision: Revision) -> AckOutcome {
        self.end_sync();
        if self.local_revision == revision {
            self.last_ack_revision = self.last_ack_revision.max(revision);
            self.dirty = false;
            AckOutcome::Clean
        } else {
            // The remote may now hold this older value on top of a newer
            // one, so the entity must be pushed again.
            self.dirty = true;
            AckOutcome::Superseded
        }
    }

    /// Record that the remote call carrying a revision failed.
    pub fn fail(&mut self) {
        self.end_sync();
        self.dirty = true;
    }

    /// Mark `revision` as acknowledged without a remote call (local-only mode).
    pub fn acknowledge_locally(&mut self, revision: Revision) {
        self.end_sync();
        if self.local_revision == revision {
            self.last_ack_revision = revision;
            self.dirty = false;
        }
    }

    /// Whether at least one remote call is outstanding.
    pub fn sync_in_flight(&self) -> bool {
        self.in_flight > 0
    }

    /// Whether remote snapshots must not overwrite local mutable fields.
    pub fn is_protected(&self) -> bool {
        self.dirty || self.sync_in_flight()
    }
}
