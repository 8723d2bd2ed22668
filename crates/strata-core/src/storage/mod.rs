//! # Persistent Storage
//!
//! Disk-backed implementations of [`crate::store::VersionStore`].

pub mod redb_store;

pub use redb_store::RedbStore;
