//! # keyspan
//!
//! A partitioned key-value storage abstraction that sits between
//! application code and a remote, conditionally-writable sorted-partition
//! backend, plus an optional overflow blob store for oversized payloads.
//!
//! Callers get at-most-one-writer-wins conditional inserts and updates,
//! multi-item atomic transactions with automatic conflict retry,
//! transparent spillover of large payloads to secondary storage, and
//! cursor-based forward/backward partition scanning with attribute
//! filtering.
//!
//! ## Quick Start
//!
//! ```
//! use keyspan_core::{
//!     Item, MemoryBackend, MemoryOverflow, PartitionedStore, ScanRequest, StoreConfig,
//! };
//!
//! let store = PartitionedStore::new(
//!     MemoryBackend::new(),
//!     MemoryOverflow::new(),
//!     StoreConfig::new("directory"),
//! )
//! .unwrap();
//!
//! // Conditional insert: fails ObjectExists if the key is taken.
//! let item = Item::new("users", "alice", r#"{"name":"Alice"}"#, "profile");
//! store.insert(&item, true).unwrap();
//!
//! // Point fetch.
//! let fetched = store.fetch("users", "alice").unwrap().unwrap();
//! assert_eq!(fetched.payload.as_deref(), Some(r#"{"name":"Alice"}"#));
//!
//! // Cursor-based partition scan.
//! let mut names = Vec::new();
//! let page = store
//!     .scan(&ScanRequest::partition("users"), |item| {
//!         names.push(item.sort_key);
//!     })
//!     .unwrap();
//! assert_eq!(names, ["alice"]);
//! assert_eq!(page.after, None);
//! ```
//!
//! The backend is consumed as an opaque service through the
//! [`PartitionBackend`] trait; [`MemoryBackend`] is the single-process
//! reference implementation of the same contract. Overflow storage is
//! strictly opt-in: the default [`DisabledOverflow`] port rejects any item
//! that would spill.

pub mod backend;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod overflow;
pub mod store;
pub mod types;

pub use backend::memory::MemoryBackend;
pub use backend::{Condition, PartitionBackend, RecordKey, WriteAction};
pub use config::StoreConfig;
pub use engine::scan::{ScanPage, ScanRequest};
pub use error::{Error, Result};
pub use overflow::{DisabledOverflow, MemoryOverflow, OverflowStore};
pub use store::PartitionedStore;
pub use types::{AbsoluteHash, AttrValue, Item};
