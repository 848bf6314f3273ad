//! # Local File Cache
//!
//! This module provides the single point of truth for "is file X cached
//! locally, and if not, how do we get it." The cache manages a bounded
//! physical storage area with a defined kilobyte capacity and is designed
//! to support fast concurrent access.
//!
//! ## Storage Layout
//!
//! The cache owns two subdirectories under `<parent>/.filecache/`:
//! - `active` holds fully published files that are ready to be served
//! - `temp` is the scratch area for in-flight downloads only
//!
//! Both directories are exclusively owned by one cache instance; no other
//! component may write into them.
//!
//! ## Worker Groups
//!
//! Three distinct groups of background threads are maintained:
//! - one dedicated thread per filesystem reconciliation scan
//! - a fixed pool of workers serving asynchronous pre-fetch requests
//! - a fixed pool of workers deleting evicted files from disk, kept
//!   separate so a burst of evictions and a burst of pre-fetches can
//!   never starve each other

use std::fs::{create_dir_all, read_dir, remove_file, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use url::Url;

use crate::cached_file::CachedFile;
use crate::common::{
    FileCacheError, FileCacheResult, ACTIVE_DIRECTORY_NAME, CACHE_DIRECTORY_NAME,
    TEMP_DIRECTORY_NAME,
};
use crate::index::FileCacheIndex;
use crate::local_loader::LocalFileLoader;
use crate::remote_loader::RemoteFileCacheLoader;
use crate::transport::{FetchError, RemoteFileStore};

/// Workers deleting evicted files from disk.
const REMOVAL_WORKERS: usize = 4;
/// Workers serving best-effort asynchronous pre-fetches.
const PREFETCH_WORKERS: usize = 4;

/// Listener notified once, after a filesystem reconciliation scan
/// finishes, with the files that could not be mapped to any remote
/// reference name.
pub trait CacheLoadListener: Send + Sync {
    fn load_completed(&self, unregistered_files: &[PathBuf]);
}

/// A local file cache with a defined physical storage capacity
///
/// Files are culled with a least recently used policy, weighted by file
/// size in kilobytes, once the configured capacity is reached.
pub struct LocalFileCache {
    core: Arc<CacheCore>,
    prefetch_tx: Sender<String>,
}

struct CacheCore {
    temp_directory: PathBuf,
    active_directory: PathBuf,
    index: FileCacheIndex,
    loader: RemoteFileCacheLoader,
    store: Arc<dyn RemoteFileStore>,
    load_listener: Option<Arc<dyn CacheLoadListener>>,
    scan_complete: AtomicBool,
}

impl LocalFileCache {
    /// Creates a new local cache whose physical storage is within the
    /// specified parent directory.
    ///
    /// The capacity is clamped to a minimum of 1 kilobyte. A background
    /// scan of files already present in the active directory is launched
    /// immediately; construction does not block on it.
    ///
    /// # Errors
    ///
    /// Returns `FileCacheError::Construction` if the cache directories
    /// cannot be created or are not writable, or if worker threads cannot
    /// be spawned.
    pub fn new(
        cache_parent_directory: &Path,
        kilobyte_capacity: u64,
        load_listener: Option<Arc<dyn CacheLoadListener>>,
        store: Arc<dyn RemoteFileStore>,
    ) -> FileCacheResult<Self> {
        let root = create_and_validate_directory(cache_parent_directory, CACHE_DIRECTORY_NAME)?;
        let active_directory = create_and_validate_directory(&root, ACTIVE_DIRECTORY_NAME)?;
        let temp_directory = create_and_validate_directory(&root, TEMP_DIRECTORY_NAME)?;

        warn_if_not_empty(&temp_directory);

        let (removal_tx, removal_rx) = channel();
        spawn_removal_workers(removal_rx, active_directory.clone())?;

        let index = FileCacheIndex::new(kilobyte_capacity.max(1), removal_tx);
        let loader = RemoteFileCacheLoader::new(
            Arc::clone(&store),
            temp_directory.clone(),
            active_directory.clone(),
        );

        let core = Arc::new(CacheCore {
            temp_directory,
            active_directory,
            index,
            loader,
            store,
            load_listener,
            scan_complete: AtomicBool::new(false),
        });

        let (prefetch_tx, prefetch_rx) = channel();
        spawn_prefetch_workers(prefetch_rx, Arc::downgrade(&core))?;

        let cache = Self { core, prefetch_tx };
        cache.schedule_filesystem_scan()?;
        Ok(cache)
    }

    /// Looks for the specified resource in the cache and returns the
    /// corresponding local file path, retrieving and publishing the
    /// remote file first if needed.
    ///
    /// Blocks the calling thread for the duration of a network fetch on a
    /// cache miss. With `force_refresh`, any existing entry is invalidated
    /// before a fresh retrieval.
    ///
    /// # Errors
    ///
    /// `FileCacheError::NotFound` if the remote reports the resource does
    /// not exist, `FileCacheError::NotCacheable` for every other retrieval
    /// failure.
    pub fn get_file(&self, remote_ref_name: &str, force_refresh: bool) -> FileCacheResult<PathBuf> {
        self.core.get_or_fetch(remote_ref_name, force_refresh)
    }

    /// Returns a servable URL for the specified resource without ever
    /// blocking on the network.
    ///
    /// If the resource is cached, its `file://` URL is returned. Otherwise
    /// the remote URL is returned immediately as a usable fallback; with
    /// `cache_async`, a retrieval request is also submitted to the
    /// pre-fetch workers so that subsequent calls hit the cache. Failures
    /// of that background retrieval are logged, never surfaced here.
    pub fn get_effective_url(
        &self,
        remote_ref_name: &str,
        cache_async: bool,
    ) -> FileCacheResult<Url> {
        if let Some(cached_file) = self.core.index.get(remote_ref_name) {
            if let Some(local_path) = self.core.verified_local_file(cached_file) {
                return Url::from_file_path(&local_path).map_err(|_| {
                    FileCacheError::IO(format!(
                        "failed to derive URL for {}",
                        local_path.display()
                    ))
                });
            }
        }

        if cache_async {
            if remote_ref_name.ends_with('/') {
                log::trace!("get_effective_url: cannot cache directory {remote_ref_name}");
            } else if self.prefetch_tx.send(remote_ref_name.to_owned()).is_err() {
                log::warn!(
                    "get_effective_url: pre-fetch workers are gone, skipping async load of \
                     {remote_ref_name}"
                );
            }
        }

        self.core
            .store
            .remote_url(remote_ref_name)
            .map_err(|e| match e {
                FetchError::NotFound(name) => FileCacheError::NotFound(name),
                FetchError::Transient(reason) => FileCacheError::IO(reason),
            })
    }

    /// The number of files currently in the cache.
    pub fn number_of_files(&self) -> usize {
        self.core.index.len()
    }

    /// Dynamically calculates the total cache size by examining each
    /// cached entry. Do not call this method inside performance sensitive
    /// blocks.
    pub fn number_of_kilobytes(&self) -> u64 {
        self.core.index.weighted_kilobytes()
    }

    /// The maximum number of kilobytes to be maintained in this cache.
    pub fn kilobyte_capacity(&self) -> u64 {
        self.core.index.kilobyte_capacity()
    }

    /// Sets the maximum number of kilobytes to be maintained in this
    /// cache and then rebuilds the index.
    ///
    /// The index structure does not support resizing in place, so the
    /// current entries are dropped and re-registered by a fresh filesystem
    /// scan. Files that no longer fit are scheduled for eviction during
    /// re-registration, in traversal order rather than true least recently
    /// used order. This is potentially an expensive operation, so use it
    /// wisely.
    pub fn set_kilobyte_capacity(&self, kilobyte_capacity: u64) -> FileCacheResult<()> {
        log::info!("set_kilobyte_capacity: entry, kilobyte_capacity={kilobyte_capacity}");
        self.core.index.rebuild(kilobyte_capacity.max(1));
        self.schedule_filesystem_scan()
    }

    /// Clears and removes all locally cached files.
    ///
    /// Entries are removed from the in-memory index immediately; the
    /// physical files are deleted asynchronously by the removal workers.
    pub fn clear(&self) {
        log::info!(
            "clear: entry, scheduling removal of {} files from cache",
            self.core.index.len()
        );
        self.core.index.invalidate_all();
    }

    /// True once the most recently launched filesystem scan has finished.
    pub fn is_scan_complete(&self) -> bool {
        self.core.scan_complete.load(Ordering::SeqCst)
    }

    /// The directory that contains all locally cached files that are
    /// ready to be served.
    pub fn active_directory(&self) -> &Path {
        &self.core.active_directory
    }

    /// The directory where files are loaded before they are ready to be
    /// served from the cache.
    pub fn temp_directory(&self) -> &Path {
        &self.core.temp_directory
    }

    /// Launches the filesystem reconciliation scan on its own thread so
    /// that application start up is never blocked by a large directory
    /// walk.
    fn schedule_filesystem_scan(&self) -> FileCacheResult<()> {
        self.core.scan_complete.store(false, Ordering::SeqCst);
        let core = Arc::clone(&self.core);
        thread::Builder::new()
            .name("file-cache-load-thread".into())
            .spawn(move || core.run_filesystem_scan())
            .map_err(|e| {
                FileCacheError::Construction(format!("failed to spawn scan thread: {:?}", e))
            })?;
        Ok(())
    }
}

impl CacheCore {
    fn get_or_fetch(&self, remote_ref_name: &str, force_refresh: bool) -> FileCacheResult<PathBuf> {
        if force_refresh {
            self.index.invalidate(remote_ref_name);
        }
        if let Some(cached_file) = self.index.get(remote_ref_name) {
            if let Some(local_path) = self.verified_local_file(cached_file) {
                return Ok(local_path);
            }
        }

        let cached_file = self
            .loader
            .load(remote_ref_name, self.index.kilobyte_capacity())
            .map_err(|e| match e {
                FetchError::NotFound(name) => FileCacheError::NotFound(name),
                FetchError::Transient(reason) => FileCacheError::NotCacheable(format!(
                    "failed to retrieve {remote_ref_name}: {reason}"
                )),
            })?;
        let local_path = cached_file.local_path().to_owned();
        self.index.put(cached_file);
        Ok(local_path)
    }

    /// Extra check to keep the index consistent with the filesystem: an
    /// entry whose file has vanished is purged and treated as a miss.
    fn verified_local_file(&self, cached_file: CachedFile) -> Option<PathBuf> {
        let local_path = cached_file.local_path();
        if local_path.is_file() {
            Some(local_path.to_owned())
        } else {
            log::warn!(
                "verified_local_file: {} vanished from disk, purging {}",
                local_path.display(),
                cached_file.remote_ref_name()
            );
            self.index.invalidate(cached_file.remote_ref_name());
            None
        }
    }

    /// Registers any existing local files in this cache.
    ///
    /// NOTE: after a scan, cache usage (ordering) simply reflects
    /// directory traversal order.
    fn run_filesystem_scan(&self) {
        log::info!("run_filesystem_scan: starting load");

        let mut loader = LocalFileLoader::new(self.active_directory.clone());
        let located = loader.locate_cached_files();
        let located_count = located.len();
        for cached_file in located {
            // a newer record may have been loaded while the scan ran
            if !self.index.contains(cached_file.remote_ref_name()) {
                self.index.put(cached_file);
            }
        }

        for path in loader.unregistered_files() {
            // an unregistered file provides no lookup value and only
            // consumes capacity silently
            CachedFile::new(String::new(), path.clone()).remove(&self.active_directory);
        }

        let used_kb = self.index.weighted_kilobytes();
        let total_kb = self.index.kilobyte_capacity();
        let used_percentage = used_kb * 100 / total_kb.max(1);
        log::info!(
            "run_filesystem_scan: loaded {located_count} files, {used_percentage}% full \
             ({used_kb}/{total_kb} kilobytes)"
        );

        self.scan_complete.store(true, Ordering::SeqCst);

        if let Some(listener) = &self.load_listener {
            listener.load_completed(loader.unregistered_files());
        }
    }
}

/// Ensures that a writable directory with the specified name exists
/// within the specified parent directory.
fn create_and_validate_directory(parent: &Path, name: &str) -> FileCacheResult<PathBuf> {
    if !parent.exists() {
        create_dir_all(parent).map_err(|e| {
            FileCacheError::Construction(format!("cannot create {}: {:?}", parent.display(), e))
        })?;
    }
    let canonical_parent = parent.canonicalize().map_err(|e| {
        FileCacheError::Construction(format!(
            "failed to canonicalize {}: {:?}",
            parent.display(),
            e
        ))
    })?;
    let directory = canonical_parent.join(name);
    if !directory.is_dir() {
        create_dir_all(&directory).map_err(|e| {
            FileCacheError::Construction(format!(
                "cannot create {}: {:?}",
                directory.display(),
                e
            ))
        })?;
    }

    // probe writability directly; the cache is useless without it
    let probe = directory.join(".write-probe");
    File::create(&probe)
        .and_then(|_| remove_file(&probe))
        .map_err(|e| {
            FileCacheError::Construction(format!(
                "cannot write to {}: {:?}",
                directory.display(),
                e
            ))
        })?;

    Ok(directory)
}

/// The temp directory should be empty unless a load from a prior session
/// was interrupted. Leftovers are logged and left in place; they are never
/// served, so they cost disk space only.
fn warn_if_not_empty(temp_directory: &Path) {
    if let Ok(entries) = read_dir(temp_directory) {
        let count = entries.count();
        if count > 0 {
            log::warn!(
                "temp directory {} should be empty but contains {} files",
                temp_directory.display(),
                count
            );
        }
    }
}

fn spawn_removal_workers(
    removal_rx: Receiver<CachedFile>,
    active_directory: PathBuf,
) -> FileCacheResult<()> {
    let shared_rx = Arc::new(Mutex::new(removal_rx));
    for worker in 0..REMOVAL_WORKERS {
        let shared_rx = Arc::clone(&shared_rx);
        let active_directory = active_directory.clone();
        thread::Builder::new()
            .name(format!("file-cache-removal-{worker}"))
            .spawn(move || loop {
                let next = {
                    let receiver = shared_rx.lock().unwrap_or_else(|e| e.into_inner());
                    receiver.recv()
                };
                match next {
                    Ok(cached_file) => cached_file.remove(&active_directory),
                    Err(_) => break,
                }
            })
            .map_err(|e| {
                FileCacheError::Construction(format!(
                    "failed to spawn removal worker: {:?}",
                    e
                ))
            })?;
    }
    Ok(())
}

fn spawn_prefetch_workers(
    prefetch_rx: Receiver<String>,
    core: Weak<CacheCore>,
) -> FileCacheResult<()> {
    let shared_rx = Arc::new(Mutex::new(prefetch_rx));
    for worker in 0..PREFETCH_WORKERS {
        let shared_rx = Arc::clone(&shared_rx);
        let core = core.clone();
        thread::Builder::new()
            .name(format!("file-cache-prefetch-{worker}"))
            .spawn(move || loop {
                let next = {
                    let receiver = shared_rx.lock().unwrap_or_else(|e| e.into_inner());
                    receiver.recv()
                };
                match next {
                    Ok(remote_ref_name) => {
                        let Some(core) = core.upgrade() else {
                            break;
                        };
                        if let Err(e) = core.get_or_fetch(&remote_ref_name, false) {
                            log::warn!(
                                "prefetch: problem caching {remote_ref_name} asynchronously: {e}"
                            );
                        }
                    }
                    Err(_) => break,
                }
            })
            .map_err(|e| {
                FileCacheError::Construction(format!(
                    "failed to spawn pre-fetch worker: {:?}",
                    e
                ))
            })?;
    }
    Ok(())
}
