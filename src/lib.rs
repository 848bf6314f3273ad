//! # filecache
//!
//! Disk-backed, capacity-bounded local cache for remotely stored large
//! binary files, such as multi-gigabyte microscopy image volumes.
//!
//! Remote files are identified by opaque reference names, downloaded into
//! a scratch area, and atomically published into an active directory from
//! which they are served. An in-memory index bounds the total cached size
//! in kilobytes with a global least recently used eviction policy, and a
//! startup scan reconciles the index with whatever already survives on
//! disk from previous sessions.

pub mod cached_file;
pub mod common;
pub mod index;
pub mod local_cache;
pub mod local_loader;
pub mod remote_loader;
pub mod transport;
