//! Reconciliation of remote snapshots with optimistic local state.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use sanctuary_common::{EntityId, LibraryItem, ReaderSettings};

use crate::entity::Entity;

/// An entity whose remote snapshot can be combined with local edits.
pub trait Reconcilable: Entity {
    /// Take the locally mutable fields from `local` and everything else from
    /// `remote`.
    fn keep_local_fields(remote: Self, local: &Self) -> Self;

    /// Server-side modification time carried by a snapshot, if any.
    fn server_updated_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

impl Reconcilable for LibraryItem {
    fn keep_local_fields(remote: Self, local: &Self) -> Self {
        LibraryItem {
            progress_percent: local.progress_percent,
            total_pages: local.total_pages,
            last_location: local.last_location.clone(),
            location_history: local.location_history.clone(),
            bookmarks: local.bookmarks.clone(),
            status: local.status,
            favorite: local.favorite,
            completed_at: local.completed_at,
            last_opened_at: local.last_opened_at,
            ..remote
        }
    }

    fn server_updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

impl Reconcilable for ReaderSettings {
    // Every settings field is locally mutable.
    fn keep_local_fields(_remote: Self, local: &Self) -> Self {
        local.clone()
    }
}

/// How one entity ended up in the reconciled set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remote value taken as is.
    Adopted,
    /// Remote value with local mutable fields kept.
    Merged,
    /// Protected local entity missing from the snapshot, kept unchanged.
    KeptLocal,
}

/// Summary of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub adopted: usize,
    pub merged: usize,
    pub kept_local: usize,
    /// Clean local entities that vanished from the remote.
    pub dropped: Vec<EntityId>,
}

/// Reconciled entity set plus its report.
#[derive(Debug, Clone)]
pub struct Reconciled<T> {
    pub entities: Vec<(T, Disposition)>,
    pub report: ReconcileReport,
}

/// Combine a remote snapshot with local state.
///
/// Protected entities (dirty, in flight or queued) keep their local
/// mutable fields; clean ones take the remote value. A local entity absent
/// from the snapshot survives only while protected.
pub fn reconcile<T, P>(remote: Vec<T>, local: &HashMap<EntityId, T>, is_protected: P) -> Reconciled<T>
where
    T: Reconcilable,
    P: Fn(&EntityId) -> bool,
{
    let mut report = ReconcileReport::default();
    let mut entities = Vec::with_capacity(remote.len());
    let mut seen = std::collections::HashSet::with_capacity(remote.len());

    for snapshot in remote {
        let id = snapshot.entity_id();
        let resolved = match local.get(&id) {
            Some(current) if is_protected(&id) => {
                report.merged += 1;
                (T::keep_local_fields(snapshot, current), Disposition::Merged)
            }
            _ => {
                report.adopted += 1;
                (snapshot, Disposition::Adopted)
            }
        };
        seen.insert(id);
        entities.push(resolved);
    }

    let mut leftovers: Vec<(&EntityId, &T)> =
        local.iter().filter(|(id, _)| !seen.contains(*id)).collect();
    leftovers.sort_by(|a, b| a.0.cmp(b.0));

    for (id, current) in leftovers {
        if is_protected(id) {
            report.kept_local += 1;
            entities.push((current.clone(), Disposition::KeptLocal));
        } else {
            report.dropped.push(id.clone());
        }
    }

    Reconciled { entities, report }
}
