//! Domain records synchronized between clients and the remote store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Number of previous reading locations remembered per book.
pub const MAX_LOCATION_HISTORY: usize = 10;

/// Identifier of an addressable record (library item, session, settings).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create a new EntityId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or only whitespace
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "EntityId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A saved position inside a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    /// EPUB canonical fragment identifier of the position.
    pub cfi: String,
    /// Display label.
    pub title: String,
}

/// Reading list a book belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadingStatus {
    #[default]
    ToRead,
    Reading,
    Finished,
}

impl ReadingStatus {
    /// Derive the reading status implied by a progress percentage.
    pub fn from_progress(percent: u8) -> Self {
        match percent {
            0 => ReadingStatus::ToRead,
            p if p >= 100 => ReadingStatus::Finished,
            _ => ReadingStatus::Reading,
        }
    }
}

/// A book in the user's library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryItem {
    pub id: EntityId,
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub progress_percent: u8,
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub last_location: Option<String>,
    #[serde(default)]
    pub location_history: Vec<String>,
    #[serde(default)]
    pub bookmarks: Vec<Bookmark>,
    #[serde(default)]
    pub status: ReadingStatus,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LibraryItem {
    /// Create a fresh, unread library item.
    pub fn new(id: EntityId, title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            author: author.into(),
            cover_url: None,
            progress_percent: 0,
            total_pages: None,
            last_location: None,
            location_history: Vec::new(),
            bookmarks: Vec::new(),
            status: ReadingStatus::ToRead,
            favorite: false,
            completed_at: None,
            last_opened_at: None,
            updated_at: None,
        }
    }

    /// Return a copy with new reading progress applied.
    ///
    /// The percentage is rounded and clamped to `0..=100`, the reading
    /// status follows the percentage, and the previous location is pushed
    /// onto the bounded location history when it changes.
    pub fn with_progress(&self, percent: f64, location: &str, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        let percent = clamp_percent(percent);

        if let Some(previous) = &self.last_location {
            if !previous.is_empty() && previous != location {
                next.location_history.push(previous.clone());
                if next.location_history.len() > MAX_LOCATION_HISTORY {
                    let overflow = next.location_history.len() - MAX_LOCATION_HISTORY;
                    next.location_history.drain(..overflow);
                }
            }
        }

        next.progress_percent = percent;
        next.last_location = Some(location.to_string());
        next.status = ReadingStatus::from_progress(percent);
        next.last_opened_at = Some(now);
        if next.status == ReadingStatus::Finished && next.completed_at.is_none() {
            next.completed_at = Some(now);
        }
        next
    }

    /// Return a copy moved to another reading list.
    pub fn with_status(&self, status: ReadingStatus, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.completed_at = match status {
            ReadingStatus::Finished => Some(self.completed_at.unwrap_or(now)),
            _ => None,
        };
        next
    }

    /// Check whether a bookmark already exists at the given position.
    pub fn has_bookmark(&self, cfi: &str) -> bool {
        self.bookmarks.iter().any(|b| b.cfi == cfi)
    }
}

fn clamp_percent(percent: f64) -> u8 {
    if percent.is_nan() {
        return 0;
    }
    percent.round().clamp(0.0, 100.0) as u8
}

/// Client that recorded a reading session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Android,
    Desktop,
    Web,
}

/// A contiguous stretch of reading, used for statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingSession {
    pub id: EntityId,
    pub book_id: EntityId,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_sec: u64,
    pub pages_advanced: u32,
    pub device: Device,
}

/// Reader appearance and navigation preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderSettings {
    pub theme_preset: ThemePreset,
    pub font_scale: f32,
    pub line_height: f32,
    pub text_width: u32,
    pub motion: Motion,
    pub tap_zones: bool,
    pub swipe_nav: bool,
    pub auto_hide_ms: u32,
    pub show_progress: bool,
    pub show_page_meta: bool,
    pub accent: String,
}

impl ReaderSettings {
    /// Identifier under which the settings record is synchronized.
    pub const ENTITY_ID: &'static str = "settings";

    /// [`Self::ENTITY_ID`] as an entity id.
    pub fn entity_id() -> EntityId {
        EntityId(Self::ENTITY_ID.to_string())
    }
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            theme_preset: ThemePreset::Paper,
            font_scale: 1.0,
            line_height: 1.6,
            text_width: 680,
            motion: Motion::Full,
            tap_zones: true,
            swipe_nav: true,
            auto_hide_ms: 2500,
            show_progress: true,
            show_page_meta: true,
            accent: "#8b5e34".to_string(),
        }
    }
}

/// Page color scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemePreset {
    Paper,
    Ivory,
    Ink,
}

/// Page-turn animation preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Motion {
    Full,
    Reduced,
}
