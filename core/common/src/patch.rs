//! Partial library item updates sent to the remote store.

use serde::{Deserialize, Serialize};

use crate::types::{Bookmark, LibraryItem};

/// Field subset of a library item, as accepted by the remote PATCH call.
///
/// Every field is optional; absent fields are left untouched by the remote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favorite: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmarks: Option<Vec<Bookmark>>,
}

impl LibraryPatch {
    /// Patch carrying the reading position of an item.
    pub fn progress_of(item: &LibraryItem) -> Self {
        Self {
            progress: Some(item.progress_percent),
            total_pages: item.total_pages,
            last_location: item.last_location.clone(),
            ..Self::default()
        }
    }

    /// Patch carrying every locally mutable field the remote accepts.
    pub fn local_fields_of(item: &LibraryItem) -> Self {
        Self {
            favorite: Some(item.favorite),
            bookmarks: Some(item.bookmarks.clone()),
            ..Self::progress_of(item)
        }
    }

    /// Shallow merge: every field set in `later` overwrites this patch.
    pub fn merge(&mut self, later: LibraryPatch) {
        if later.title.is_some() {
            self.title = later.title;
        }
        if later.author.is_some() {
            self.author = later.author;
        }
        if later.progress.is_some() {
            self.progress = later.progress;
        }
        if later.total_pages.is_some() {
            self.total_pages = later.total_pages;
        }
        if later.last_location.is_some() {
            self.last_location = later.last_location;
        }
        if later.favorite.is_some() {
            self.favorite = later.favorite;
        }
        if later.bookmarks.is_some() {
            self.bookmarks = later.bookmarks;
        }
    }

    /// Write the patched fields onto an item.
    pub fn apply_to(&self, item: &mut LibraryItem) {
        if let Some(title) = &self.title {
            item.title = title.clone();
        }
        if let Some(author) = &self.author {
            item.author = author.clone();
        }
        if let Some(progress) = self.progress {
            item.progress_percent = progress.min(100);
        }
        if let Some(total_pages) = self.total_pages {
            item.total_pages = Some(total_pages);
        }
        if let Some(location) = &self.last_location {
            item.last_location = Some(location.clone());
        }
        if let Some(favorite) = self.favorite {
            item.favorite = favorite;
        }
        if let Some(bookmarks) = &self.bookmarks {
            item.bookmarks = bookmarks.clone();
        }
    }

    /// Check if the patch carries no fields.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityId;
    use proptest::prelude::*;

    #[test]
    fn test_merge_later_fields_win() {
        let mut patch = LibraryPatch {
            progress: Some(10),
            last_location: Some("a".to_string()),
            ..Default::default()
        };
        patch.merge(LibraryPatch {
            progress: Some(20),
            favorite: Some(true),
            ..Default::default()
        });

        assert_eq!(patch.progress, Some(20));
        assert_eq!(patch.last_location.as_deref(), Some("a"));
        assert_eq!(patch.favorite, Some(true));
    }

    #[test]
    fn test_absent_fields_are_not_serialized() {
        let patch = LibraryPatch {
            progress: Some(50),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "progress": 50 }));
    }

    #[test]
    fn test_apply_to_item() {
        let mut item = LibraryItem::new(EntityId::new("b1").unwrap(), "Dune", "Herbert");
        LibraryPatch {
            progress: Some(42),
            favorite: Some(true),
            ..Default::default()
        }
        .apply_to(&mut item);
        assert_eq!(item.progress_percent, 42);
        assert!(item.favorite);
        assert_eq!(item.title, "Dune");
    }

    fn arb_patch() -> impl Strategy<Value = LibraryPatch> {
        (
            proptest::option::of(0u8..=100),
            proptest::option::of("[a-z]{1,6}"),
            proptest::option::of(any::<bool>()),
        )
            .prop_map(|(progress, last_location, favorite)| LibraryPatch {
                progress,
                last_location,
                favorite,
                ..Default::default()
            })
    }

    proptest! {
        #[test]
        fn prop_merge_matches_sequential_apply(a in arb_patch(), b in arb_patch()) {
            let base = LibraryItem::new(EntityId::new("b1").unwrap(), "T", "A");

            let mut sequential = base.clone();
            a.apply_to(&mut sequential);
            b.apply_to(&mut sequential);

            let mut merged = a.clone();
            merged.merge(b);
            let mut combined = base;
            merged.apply_to(&mut combined);

            prop_assert_eq!(sequential, combined);
        }

        #[test]
        fn prop_merge_with_empty_is_identity(a in arb_patch()) {
            let mut merged = a.clone();
            merged.merge(LibraryPatch::default());
            prop_assert_eq!(merged, a);
        }
    }
}
