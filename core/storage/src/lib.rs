//! Durable queue store abstraction for Sanctuary sync.
//!
//! The sync engine only needs atomic per-key `get`/`set`/`delete` on opaque
//! bytes. This crate defines that contract, an in-memory store for tests and
//! guest sessions, a local filesystem store, and a registry that resolves a
//! store by name and configuration.
//!
//! # Design Principles
//! - Opaque values: stores never interpret the bytes they hold
//! - Atomic per key: a reader sees either the old or the new value
//! - Async operations: all I/O is async

pub mod local;
pub mod memory;
pub mod registry;
pub mod store;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use store::{read_json, write_json, QueueStore};
