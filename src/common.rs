//! # Common Types and Utilities
//!
//! This module provides common types, error handling, and constants used
//! throughout the local file cache implementation. It includes:
//! - Error handling infrastructure
//! - On-disk layout constants shared by the cache components
//! - Size conversion helpers used for cache weighting

/// Name of the cache root directory created under the configured parent.
pub const CACHE_DIRECTORY_NAME: &str = ".filecache";
/// Name of the subdirectory holding fully published, servable files.
pub const ACTIVE_DIRECTORY_NAME: &str = "active";
/// Name of the scratch subdirectory for in-flight downloads.
pub const TEMP_DIRECTORY_NAME: &str = "temp";
/// Suffix of the hidden metadata sidecar written next to every cached file.
pub const META_FILE_SUFFIX: &str = ".cached-file";

/// Number of bytes in one kilobyte, the unit of cache capacity.
pub const ONE_KILOBYTE: u64 = 1024;

pub type FileCacheResult<R> = Result<R, FileCacheError>;

/// Represents errors that can occur during cache operations
///
/// This enum covers the error conditions that may arise while constructing
/// the cache, retrieving remote files, and interacting with the local
/// file system.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum FileCacheError {
    #[error("remote file not found: {0}")]
    NotFound(String),
    #[error("file not cacheable: {0}")]
    NotCacheable(String),
    #[error("cache construction failed: {0}")]
    Construction(String),
    #[error("IO error: {0}")]
    IO(String),
}

impl From<std::io::Error> for FileCacheError {
    fn from(e: std::io::Error) -> Self {
        FileCacheError::IO(format!("{:?}", e))
    }
}

/// Converts a byte length to kilobytes, rounding fractions up
///
/// Zero-length files map to zero kilobytes; the minimum-weight rule for
/// empty files is applied by the cache index, not here.
///
/// # Arguments
/// * `length` - The file length in bytes
///
/// # Returns
/// The number of kilobytes occupied by the file, rounded up.
pub fn kilobytes_for_length(length: u64) -> u64 {
    let mut kilobytes = length / ONE_KILOBYTE;
    if length % ONE_KILOBYTE > 0 {
        kilobytes += 1;
    }
    kilobytes
}
