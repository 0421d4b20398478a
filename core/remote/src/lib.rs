//! Remote sync client abstraction for Sanctuary.
//!
//! The sync engine treats the remote CRUD API as a black box that either
//! succeeds or fails per call. This crate defines that contract, an HTTP
//! implementation against the `/api/v2` endpoints, and an in-memory remote
//! used by tests and offline runs.

pub mod client;
pub mod http;
pub mod memory;

pub use client::RemoteSyncClient;
pub use http::HttpRemoteClient;
pub use memory::MemoryRemote;
