//! # Cached File Records
//!
//! This module encapsulates the information the cache keeps about one
//! physical file on local disk: the remote reference name it was fetched
//! under, its absolute local path, and its size in kilobytes.
//!
//! ## Metadata Sidecars
//!
//! When a remote file is published into the active directory, a hidden
//! companion file is written next to it that records the remote reference
//! name as JSON. Retrieval of `active/separate/signal-mip.png` results in
//! creation of the companion `active/separate/.signal-mip.png.cached-file`.
//! These sidecars let the startup scan map files already on disk back to
//! their remote reference names without re-downloading anything.

use std::fs::{read_dir, remove_dir, remove_file, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::{kilobytes_for_length, FileCacheError, FileCacheResult, META_FILE_SUFFIX};

/// Serialized form of a cached file's sidecar metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedFileMeta {
    pub remote_ref_name: String,
}

/// A record for one physical file held in the local cache
///
/// Instances are created either by the remote loader after a successful
/// download, or by the startup scan for files already present on disk.
#[derive(Debug, Clone)]
pub struct CachedFile {
    remote_ref_name: String,
    local_path: PathBuf,
    kilobytes: u64,
}

impl CachedFile {
    /// Creates a record for the specified local file, measuring its
    /// current size. A missing file measures as zero kilobytes.
    pub fn new(remote_ref_name: String, local_path: PathBuf) -> Self {
        let kilobytes = match local_path.metadata() {
            Ok(metadata) => kilobytes_for_length(metadata.len()),
            Err(_) => 0,
        };
        Self {
            remote_ref_name,
            local_path,
            kilobytes,
        }
    }

    /// The remote reference name this file was retrieved under.
    pub fn remote_ref_name(&self) -> &str {
        &self.remote_ref_name
    }

    /// The absolute local location of this file.
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// The number of kilobytes in this file, measured at construction.
    pub fn kilobytes(&self) -> u64 {
        self.kilobytes
    }

    /// The weight of this entry in the cache index.
    ///
    /// The index does not support zero weights, so empty files weigh 1.
    /// Sizes beyond `u32::MAX` kilobytes are clamped to the maximum
    /// representable weight; such a file simply won't be fairly weighted.
    pub fn weight(&self) -> u32 {
        if self.kilobytes > u32::MAX as u64 {
            log::warn!(
                "weight: truncating weight for {} Kb file {}",
                self.kilobytes,
                self.local_path.display()
            );
            u32::MAX
        } else if self.kilobytes == 0 {
            1
        } else {
            self.kilobytes as u32
        }
    }

    /// Conventional sidecar path for the specified cached file.
    ///
    /// The name is prefixed with '.' so sidecars stay out of casual
    /// directory listings.
    pub fn meta_path_for(local_file: &Path) -> PathBuf {
        let name = local_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        local_file.with_file_name(format!(".{name}{META_FILE_SUFFIX}"))
    }

    /// True if the specified path follows the sidecar naming convention.
    pub fn is_meta_file(path: &Path) -> bool {
        match path.file_name() {
            Some(name) => name.to_string_lossy().ends_with(META_FILE_SUFFIX),
            None => false,
        }
    }

    /// Derives the cached file path a sidecar refers to, or `None` if the
    /// sidecar name is malformed.
    pub fn local_path_for_meta(meta_path: &Path) -> Option<PathBuf> {
        let name = meta_path.file_name()?.to_str()?;
        let cached_name = name.strip_prefix('.')?.strip_suffix(META_FILE_SUFFIX)?;
        if cached_name.is_empty() {
            return None;
        }
        Some(meta_path.with_file_name(cached_name))
    }

    /// Writes this record's sidecar next to the cached file.
    pub fn write_meta(&self) -> FileCacheResult<()> {
        let meta_path = Self::meta_path_for(&self.local_path);
        let file = File::create(&meta_path)?;
        let meta = CachedFileMeta {
            remote_ref_name: self.remote_ref_name.clone(),
        };
        serde_json::to_writer(file, &meta).map_err(|e| FileCacheError::IO(format!("{:?}", e)))
    }

    /// Parses the sidecar at the specified path.
    pub fn read_meta(meta_path: &Path) -> FileCacheResult<CachedFileMeta> {
        let file = File::open(meta_path)?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| FileCacheError::IO(format!("{:?}", e)))
    }

    /// Removes this file and its sidecar from the local file system, then
    /// prunes any now-empty parent directories within the cache.
    ///
    /// Removal is idempotent: a file that is already gone is a no-op, so
    /// callers may race with manual cleanup. Failures are logged and
    /// ignored.
    pub fn remove(&self, active_root: &Path) {
        Self::remove_file_if_present(&self.local_path);
        Self::remove_file_if_present(&Self::meta_path_for(&self.local_path));
        Self::remove_empty_parents(active_root, &self.local_path);
    }

    fn remove_file_if_present(path: &Path) {
        if path.is_file() {
            match remove_file(path) {
                Ok(()) => log::debug!("remove: removed {}", path.display()),
                Err(e) => log::warn!("remove: failed to remove {}: {:?}", path.display(), e),
            }
        }
    }

    /// Walks up from the removed file deleting empty directories, stopping
    /// at the active root. Only directories below the root are touched.
    fn remove_empty_parents(active_root: &Path, removed: &Path) {
        let root = match active_root.canonicalize() {
            Ok(root) => root,
            Err(_) => return,
        };
        let mut current = removed.parent().map(Path::to_path_buf);
        while let Some(directory) = current {
            let canonical = match directory.canonicalize() {
                Ok(canonical) => canonical,
                Err(_) => return,
            };
            if canonical == root || !canonical.starts_with(&root) {
                return;
            }
            let is_empty = match read_dir(&directory) {
                Ok(mut entries) => entries.next().is_none(),
                Err(_) => return,
            };
            if !is_empty {
                return;
            }
            if let Err(e) = remove_dir(&directory) {
                log::warn!(
                    "remove_empty_parents: failed to remove {}: {:?}",
                    directory.display(),
                    e
                );
                return;
            }
            log::debug!("remove_empty_parents: removed {}", directory.display());
            current = directory.parent().map(Path::to_path_buf);
        }
    }
}
