//! Dataset download
//!
//! Streams an HTTP response body to disk in fixed-size chunks. A failed
//! download may leave a partial file behind.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default read chunk size in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Request timeout for the download
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for downloads
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Server answered with a non-success status
    #[error("HTTP error {status} when fetching {url}")]
    Http { status: u16, url: String },

    /// Request could not be sent or the body could not be read
    #[error("Failed to fetch {url}: {message}")]
    Network { url: String, message: String },

    /// Destination could not be written
    #[error("Failed to write {path}: {message}")]
    Io { path: PathBuf, message: String },
}

/// Result type for downloads
pub type FetchResult<T> = Result<T, FetchError>;

/// Outcome of a completed download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Download `url` to `dest`, creating parent directories
pub fn download_csv(url: &str, dest: &Path, chunk_size: usize) -> FetchResult<DownloadReport> {
    let network = |e: reqwest::Error| FetchError::Network {
        url: url.to_string(),
        message: e.to_string(),
    };
    let io = |e: std::io::Error| FetchError::Io {
        path: dest.to_path_buf(),
        message: e.to_string(),
    };

    let client = reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(network)?;

    tracing::info!("Downloading {}", url);
    let mut response = client.get(url).send().map_err(network)?;
    if !response.status().is_success() {
        return Err(FetchError::Http {
            status: response.status().as_u16(),
            url: url.to_string(),
        });
    }

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io)?;
    }
    let mut file = std::fs::File::create(dest).map_err(io)?;

    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut bytes = 0u64;
    loop {
        let n = response.read(&mut buf).map_err(|e| FetchError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).map_err(io)?;
        bytes += n as u64;
    }
    file.flush().map_err(io)?;

    tracing::info!("Saved {} bytes to {}", bytes, dest.display());
    Ok(DownloadReport {
        path: dest.to_path_buf(),
        bytes,
    })
}
