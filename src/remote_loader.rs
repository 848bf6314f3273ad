//! # Remote File Loading
//!
//! Fetches one remote file and publishes it into the cache's active
//! directory. Downloads always land in the temp directory first and are
//! moved into place with an atomic rename once complete, so a partially
//! written file is never visible as a cache hit. Partial temp files are
//! cleaned up on any failure.

use std::fs::{create_dir_all, remove_file, rename};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;

use crate::cached_file::CachedFile;
use crate::common::kilobytes_for_length;
use crate::transport::{FetchError, FetchResult, RemoteFileStore};

pub struct RemoteFileCacheLoader {
    store: Arc<dyn RemoteFileStore>,
    temp_directory: PathBuf,
    active_directory: PathBuf,
}

impl RemoteFileCacheLoader {
    pub fn new(
        store: Arc<dyn RemoteFileStore>,
        temp_directory: PathBuf,
        active_directory: PathBuf,
    ) -> Self {
        Self {
            store,
            temp_directory,
            active_directory,
        }
    }

    /// Retrieves the specified remote file and publishes it into the
    /// active directory, returning its cache record.
    ///
    /// Files whose measured size exceeds `kilobyte_capacity` are rejected
    /// outright; caching one would immediately evict everything else.
    pub fn load(&self, remote_ref_name: &str, kilobyte_capacity: u64) -> FetchResult<CachedFile> {
        let temp_path = self.build_temp_path(remote_ref_name);

        if let Err(e) = self.store.fetch_to(remote_ref_name, &temp_path) {
            Self::discard(&temp_path);
            return Err(e);
        }

        let length = match temp_path.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                Self::discard(&temp_path);
                return Err(e.into());
            }
        };

        let kilobytes = kilobytes_for_length(length);
        if kilobytes > kilobyte_capacity {
            Self::discard(&temp_path);
            return Err(FetchError::Transient(format!(
                "{kilobytes} kilobyte file {remote_ref_name} exceeds cache capacity of \
                 {kilobyte_capacity} kilobytes"
            )));
        }

        let local_path = self.build_active_path(remote_ref_name);
        if let Some(parent) = local_path.parent() {
            if let Err(e) = create_dir_all(parent) {
                Self::discard(&temp_path);
                return Err(e.into());
            }
        }
        if let Err(e) = rename(&temp_path, &local_path) {
            Self::discard(&temp_path);
            return Err(FetchError::Transient(format!(
                "failed to move {} to {}: {:?}",
                temp_path.display(),
                local_path.display(),
                e
            )));
        }

        let cached_file = CachedFile::new(remote_ref_name.to_owned(), local_path);
        if let Err(e) = cached_file.write_meta() {
            // without a sidecar the file would only resurface as
            // unregistered garbage after a restart
            cached_file.remove(&self.active_directory);
            return Err(FetchError::Transient(format!(
                "failed to write sidecar for {remote_ref_name}: {e}"
            )));
        }

        log::debug!(
            "load: published {} as {}",
            remote_ref_name,
            cached_file.local_path().display()
        );
        Ok(cached_file)
    }

    /// Unique scratch location for one in-flight download.
    fn build_temp_path(&self, remote_ref_name: &str) -> PathBuf {
        let file_name = remote_ref_name
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or("download");
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S%3f");
        let mut rng = rand::thread_rng();
        let suffix: u32 = rng.gen();
        self.temp_directory
            .join(format!("{timestamp}-{suffix:08x}-{file_name}"))
    }

    /// Final location under the active directory, mirroring the reference
    /// name's path. Relative components that would escape the active
    /// directory are dropped.
    fn build_active_path(&self, remote_ref_name: &str) -> PathBuf {
        let mut path = self.active_directory.clone();
        for component in remote_ref_name
            .split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        {
            path.push(component);
        }
        path
    }

    fn discard(temp_path: &Path) {
        if temp_path.is_file() {
            if let Err(e) = remove_file(temp_path) {
                log::warn!(
                    "discard: failed to remove temp file {}: {:?}",
                    temp_path.display(),
                    e
                );
            }
        }
    }
}
