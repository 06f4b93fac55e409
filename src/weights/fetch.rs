use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use super::types::WeightsError;

/// Makes sure the checkpoint at `url` is available at `destination`.
///
/// An existing file is reused without touching the network. Downloads are
/// streamed into `<destination>.part` and renamed once complete, so an
/// interrupted transfer never leaves a truncated checkpoint behind.
///
/// # Arguments
/// * `url` - HTTP(S) location of the checkpoint
/// * `destination` - Cache path of the checkpoint
pub fn fetch(url: &str, destination: &Path) -> Result<(), WeightsError> {
    if destination.is_file() {
        info!("Using cached weights at {}", destination.display());
        return Ok(());
    }

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }

    info!("Downloading weights from {}", url);
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(600))
        .build()
        .map_err(|e| WeightsError::Fetch(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .and_then(|response| response.error_for_status())
        .map_err(|e| WeightsError::Fetch(format!("{}: {}", url, e)))?;

    let pb = match response.content_length() {
        Some(len) => {
            let pb = ProgressBar::new(len);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({eta})")
                    .map_err(|e| WeightsError::Fetch(e.to_string()))?
                    .progress_chars("=> "),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    };

    let mut partial = destination.as_os_str().to_owned();
    partial.push(".part");
    let partial = Path::new(&partial);

    let mut file = File::create(partial)?;
    let mut reader = pb.wrap_read(response);
    let written = io::copy(&mut reader, &mut file).map_err(|e| {
        // A reset connection surfaces as an I/O error from the body reader
        WeightsError::Fetch(format!("{}: {}", url, e))
    })?;
    file.sync_all()?;
    drop(file);
    pb.finish_and_clear();

    fs::rename(partial, destination)?;
    debug!("Wrote {} bytes to {}", written, destination.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_file_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        fs::write(&path, b"cached").unwrap();
        // The URL is unreachable; a cache hit must not try it
        fetch("http://127.0.0.1:9/unreachable", &path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"cached");
    }

    #[test]
    fn test_unreachable_host_is_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let err = fetch("http://127.0.0.1:9/unreachable", &path).unwrap_err();
        assert!(matches!(err, WeightsError::Fetch(_)));
        assert!(!path.exists());
    }
}
