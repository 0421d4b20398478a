//! Common utilities and types shared across the Sanctuary sync crates.
//!
//! This module provides the error type and the domain records (library
//! items, reading sessions, reader settings) that the storage, remote and
//! sync layers pass between each other.

pub mod error;
pub mod patch;
pub mod types;

pub use error::{Error, Result};
pub use patch::LibraryPatch;
pub use types::{
    Bookmark, Device, EntityId, LibraryItem, Motion, ReaderSettings, ReadingSession, ReadingStatus,
    ThemePreset,
};
