//! Storage backends.
//!
//! Each backend is owned by exactly one provider: the object store keeps a
//! file tree with metadata sidecars, the key-value store keeps one SQLite
//! database per logical table, and the queue store persists point-in-time
//! message snapshots so queues survive restarts.

pub mod kv;
pub mod object;
pub mod queue;

pub use kv::{KeySchema, KvTableStore, SecondaryIndex};
pub use object::{ObjectListing, ObjectMetadata, ObjectStore, ObjectSummary, StoredObject};
pub use queue::{QueueMessage, QueueSnapshotStore};
