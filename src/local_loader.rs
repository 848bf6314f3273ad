//! # Startup Reconciliation
//!
//! Rebuilds cache records for files already present in the active
//! directory, so a restarted process serves previously fetched files
//! without re-downloading them. Files that cannot be mapped back to a
//! remote reference name are collected separately as unregistered.

use std::collections::HashSet;
use std::fs::{read_dir, remove_dir, remove_file};
use std::path::{Path, PathBuf};

use crate::cached_file::CachedFile;

pub struct LocalFileLoader {
    active_directory: PathBuf,
    unregistered_files: Vec<PathBuf>,
}

impl LocalFileLoader {
    pub fn new(active_directory: PathBuf) -> Self {
        Self {
            active_directory,
            unregistered_files: Vec::new(),
        }
    }

    /// Walks the active directory and reconstructs a record for every file
    /// with a readable sidecar.
    ///
    /// Along the way: orphaned sidecars (no data file) and corrupt
    /// sidecars are deleted, data files without a usable sidecar are
    /// recorded as unregistered, and empty directories are removed.
    pub fn locate_cached_files(&mut self) -> Vec<CachedFile> {
        let mut located = Vec::new();
        let root = self.active_directory.clone();
        self.scan_directory(&root, &mut located);
        log::info!(
            "locate_cached_files: found {} cached and {} unregistered files under {}",
            located.len(),
            self.unregistered_files.len(),
            self.active_directory.display()
        );
        located
    }

    /// Files discovered by the scan that provide no lookup value.
    pub fn unregistered_files(&self) -> &[PathBuf] {
        &self.unregistered_files
    }

    fn scan_directory(&mut self, directory: &Path, located: &mut Vec<CachedFile>) {
        let entries = match read_dir(directory) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!(
                    "scan_directory: failed to list {}: {:?}",
                    directory.display(),
                    e
                );
                return;
            }
        };

        let mut files = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.scan_directory(&path, located);
            } else {
                files.push(path);
            }
        }

        let mut registered: HashSet<PathBuf> = HashSet::new();
        for meta_path in files.iter().filter(|path| CachedFile::is_meta_file(path)) {
            match CachedFile::local_path_for_meta(meta_path) {
                Some(local_path) if local_path.is_file() => {
                    match CachedFile::read_meta(meta_path) {
                        Ok(meta) if !meta.remote_ref_name.is_empty() => {
                            registered.insert(local_path.clone());
                            located.push(CachedFile::new(meta.remote_ref_name, local_path));
                        }
                        _ => {
                            log::warn!(
                                "scan_directory: removing corrupt sidecar {}",
                                meta_path.display()
                            );
                            Self::remove_quietly(meta_path);
                        }
                    }
                }
                _ => {
                    log::warn!(
                        "scan_directory: removing orphaned sidecar {}",
                        meta_path.display()
                    );
                    Self::remove_quietly(meta_path);
                }
            }
        }

        for path in files.iter().filter(|path| !CachedFile::is_meta_file(path)) {
            if !registered.contains(path.as_path()) {
                self.unregistered_files.push(path.clone());
            }
        }

        if directory != self.active_directory {
            let is_empty = match read_dir(directory) {
                Ok(mut remaining) => remaining.next().is_none(),
                Err(_) => false,
            };
            if is_empty {
                if remove_dir(directory).is_ok() {
                    log::debug!(
                        "scan_directory: removed empty directory {}",
                        directory.display()
                    );
                } else {
                    log::warn!(
                        "scan_directory: failed to remove empty directory {}",
                        directory.display()
                    );
                }
            }
        }
    }

    fn remove_quietly(path: &Path) {
        if let Err(e) = remove_file(path) {
            log::warn!(
                "remove_quietly: failed to remove {}: {:?}",
                path.display(),
                e
            );
        }
    }
}
