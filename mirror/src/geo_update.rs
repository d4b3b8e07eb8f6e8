//! Startup refresh of the MaxMind City database.
//!
//! The database is published gzip-compressed. A refresh downloads it,
//! decompresses it in memory and swaps the file in through a temporary
//! sibling, so a failed refresh never leaves a truncated database behind.

use crate::error::GeoError;
use flate2::read::GzDecoder;
use log::{info, warn};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str =
    "http://geolite.maxmind.com/download/geoip/database/GeoLite2-City.mmdb.gz";

pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Downloads and installs a fresh database at `path`.
///
/// Returns whether the file was replaced. On failure the existing file, if
/// any, stays in use.
pub async fn refresh_database(path: &Path, url: &str) -> bool {
    let result = match download(url).await {
        Ok(compressed) => install(path, &compressed).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(size) => {
            info!("Updated {} ({} bytes)", path.display(), size);
            true
        }
        Err(e) if path.exists() => {
            warn!("{}; keeping existing {}", e, path.display());
            false
        }
        Err(e) => {
            warn!("{}; no database at {}", e, path.display());
            false
        }
    }
}

pub async fn download(url: &str) -> Result<Vec<u8>, GeoError> {
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| GeoError::Download(format!("GET {}: {}", url, e)))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| GeoError::Download(format!("GET {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(GeoError::Download(format!(
            "GET {}: HTTP {}",
            url,
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| GeoError::Download(format!("reading response from {}: {}", url, e)))?;

    Ok(bytes.to_vec())
}

pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>, GeoError> {
    let mut data = Vec::new();
    GzDecoder::new(compressed)
        .read_to_end(&mut data)
        .map_err(GeoError::Decompress)?;
    Ok(data)
}

/// Decompresses `compressed` into `path`. Returns the installed size.
pub async fn install(path: &Path, compressed: &[u8]) -> Result<usize, GeoError> {
    let data = decompress(compressed)?;

    let staging = staging_path(path);
    tokio::fs::write(&staging, &data)
        .await
        .map_err(|source| GeoError::Write {
            path: staging.clone(),
            source,
        })?;

    if let Err(source) = tokio::fs::rename(&staging, path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(GeoError::Write {
            path: path.to_path_buf(),
            source,
        });
    }

    Ok(data.len())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
