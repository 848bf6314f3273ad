//! # Remote Storage Transport
//!
//! The cache consumes a narrow capability from remote storage: stream the
//! bytes behind a remote reference name to a local path, and construct a
//! servable remote URL as a fallback. The transport is injected so the
//! cache never depends on a particular storage service.
//!
//! Fetch failures are tagged at this boundary: a remote resource that does
//! not exist is distinguishable from every other failure without any
//! inspection of error cause chains by callers.

use std::fs::File;
use std::io;
use std::path::Path;

use url::Url;

pub type FetchResult<R> = Result<R, FetchError>;

/// Outcome classification for a failed remote fetch.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("remote file not found: {0}")]
    NotFound(String),
    #[error("fetch failed: {0}")]
    Transient(String),
}

impl From<io::Error> for FetchError {
    fn from(e: io::Error) -> Self {
        FetchError::Transient(format!("{:?}", e))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Transient(format!("{:?}", e))
    }
}

/// Capability to retrieve remote files and derive remote URLs.
///
/// Implementations must be shareable across the cache's worker threads.
pub trait RemoteFileStore: Send + Sync {
    /// Streams the remote file behind `remote_ref_name` to `destination`,
    /// returning the number of bytes written.
    fn fetch_to(&self, remote_ref_name: &str, destination: &Path) -> FetchResult<u64>;

    /// Constructs a remote URL that can serve the file directly.
    fn remote_url(&self, remote_ref_name: &str) -> FetchResult<Url>;
}

/// HTTP implementation over a base URL.
#[derive(Debug)]
pub struct HttpFileStore {
    base_url: Url,
    client: reqwest::blocking::Client,
}

impl HttpFileStore {
    pub fn new(base_url: &str) -> FetchResult<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| FetchError::Transient(format!("invalid base URL {base_url}: {e:?}")))?;
        // joined reference names must extend the base path, not replace
        // its last segment
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        Ok(Self {
            base_url,
            client: reqwest::blocking::Client::new(),
        })
    }
}

impl RemoteFileStore for HttpFileStore {
    fn fetch_to(&self, remote_ref_name: &str, destination: &Path) -> FetchResult<u64> {
        let url = self.remote_url(remote_ref_name)?;
        let response = self.client.get(url).send()?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(remote_ref_name.into()));
        }
        let mut response = response.error_for_status()?;
        let mut file = File::create(destination)?;
        let bytes = io::copy(&mut response, &mut file)?;
        log::debug!("fetch_to: copied {bytes} bytes of {remote_ref_name}");
        Ok(bytes)
    }

    fn remote_url(&self, remote_ref_name: &str) -> FetchResult<Url> {
        self.base_url
            .join(remote_ref_name.trim_start_matches('/'))
            .map_err(|e| FetchError::Transient(format!("invalid reference {remote_ref_name}: {e:?}")))
    }
}
