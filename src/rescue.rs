//! Rescue image cache.
//!
//! `vm rescue` boots a throwaway helper VM from a known-good cloud image
//! with the broken VM's disk attached as a secondary device. The image is
//! downloaded once into `~/.vm/.cache/`, verified against the published
//! SHA256SUMS, converted to a raw boot disk, and reused afterwards.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::RescueCacheError;
use crate::paths;

struct RescueImage {
    url: &'static str,
    checksum_url: &'static str,
    filename: &'static str,
}

/// Published rescue image for the host architecture.
fn image_for_arch(arch: &str) -> Result<RescueImage, RescueCacheError> {
    match arch {
        "x86_64" => Ok(RescueImage {
            url: "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img",
            checksum_url: "https://cloud-images.ubuntu.com/noble/current/SHA256SUMS",
            filename: "noble-server-cloudimg-amd64.img",
        }),
        "aarch64" => Ok(RescueImage {
            url: "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-arm64.img",
            checksum_url: "https://cloud-images.ubuntu.com/noble/current/SHA256SUMS",
            filename: "noble-server-cloudimg-arm64.img",
        }),
        other => Err(RescueCacheError::UnsupportedArchitecture(other.to_string())),
    }
}

/// Cached raw rescue disk for this architecture.
pub fn cached_image_path() -> PathBuf {
    paths::cache_dir().join(format!("rescue-{}.img", std::env::consts::ARCH))
}

/// Ensure the rescue image is present, verified, and converted.
///
/// `force_download` refetches even when cached; `offline` fails instead of
/// touching the network.
pub async fn ensure_rescue_image(
    force_download: bool,
    offline: bool,
) -> Result<PathBuf, RescueCacheError> {
    let raw_path = cached_image_path();
    if raw_path.exists() && !force_download {
        tracing::debug!(path = %raw_path.display(), "using cached rescue image");
        return Ok(raw_path);
    }
    if offline {
        return Err(RescueCacheError::NetworkError(format!(
            "no cached rescue image at {} and --offline given",
            raw_path.display()
        )));
    }

    let image = image_for_arch(std::env::consts::ARCH)?;

    let cache = paths::cache_dir();
    std::fs::create_dir_all(&cache).map_err(|e| RescueCacheError::FileSystemError {
        context: format!("creating cache directory {}", cache.display()),
        source: e,
    })?;

    let download_path = cache.join(image.filename).with_extension("part");
    let _ = std::fs::remove_file(&download_path);

    tracing::info!(url = image.url, "downloading rescue image");
    download_to(&download_path, image.url).await?;

    let manifest = fetch_text(image.checksum_url).await?;
    let expected = checksum_from_manifest(&manifest, image.filename)?;
    let actual = file_sha256(&download_path)?;
    if actual != expected {
        let _ = std::fs::remove_file(&download_path);
        return Err(RescueCacheError::ChecksumMismatch {
            file: image.filename.to_string(),
            expected,
            actual,
        });
    }

    convert_to_raw(&download_path, &raw_path).await?;
    let _ = std::fs::remove_file(&download_path);

    tracing::info!(path = %raw_path.display(), "rescue image ready");
    Ok(raw_path)
}

async fn fetch_text(url: &str) -> Result<String, RescueCacheError> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| RescueCacheError::NetworkError(format!("request to {url} failed: {e}")))?;
    if !response.status().is_success() {
        return Err(RescueCacheError::NetworkError(format!(
            "HTTP {} from {url}",
            response.status()
        )));
    }
    response
        .text()
        .await
        .map_err(|e| RescueCacheError::NetworkError(format!("reading body of {url}: {e}")))
}

async fn download_to(path: &Path, url: &str) -> Result<(), RescueCacheError> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| RescueCacheError::NetworkError(format!("request to {url} failed: {e}")))?;
    if !response.status().is_success() {
        return Err(RescueCacheError::NetworkError(format!(
            "HTTP {} from {url}",
            response.status()
        )));
    }

    let bar = ProgressBar::new(response.content_length().unwrap_or(0));
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .expect("static template")
            .progress_chars("#>-"),
    );

    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| RescueCacheError::FileSystemError {
            context: format!("creating {}", path.display()),
            source: e,
        })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| RescueCacheError::NetworkError(format!("reading response body: {e}")))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| RescueCacheError::FileSystemError {
                context: "writing rescue image data".into(),
                source: e,
            })?;
        bar.inc(chunk.len() as u64);
    }
    file.flush()
        .await
        .map_err(|e| RescueCacheError::FileSystemError {
            context: "flushing rescue image".into(),
            source: e,
        })?;
    bar.finish_and_clear();
    Ok(())
}

/// Pull the hash for `filename` out of a `SHA256SUMS` manifest
/// (`<hex> *<name>` per line).
fn checksum_from_manifest(manifest: &str, filename: &str) -> Result<String, RescueCacheError> {
    manifest
        .lines()
        .find_map(|line| {
            let (hash, name) = line.split_once(char::is_whitespace)?;
            let name = name.trim().trim_start_matches('*');
            (name == filename && hash.len() == 64).then(|| hash.to_ascii_lowercase())
        })
        .ok_or_else(|| {
            RescueCacheError::ParseError(format!("no checksum entry for '{filename}'"))
        })
}

fn file_sha256(path: &Path) -> Result<String, RescueCacheError> {
    use std::io::Read;

    let mut file = std::fs::File::open(path).map_err(|e| RescueCacheError::FileSystemError {
        context: format!("opening {}", path.display()),
        source: e,
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| RescueCacheError::FileSystemError {
            context: format!("hashing {}", path.display()),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Convert the downloaded qcow2 to the raw disk the engine boots.
async fn convert_to_raw(source: &Path, dest: &Path) -> Result<(), RescueCacheError> {
    let tmp = dest.with_extension("converting");
    let _ = std::fs::remove_file(&tmp);

    let status = tokio::process::Command::new("qemu-img")
        .arg("convert")
        .arg("-O")
        .arg("raw")
        .arg(source)
        .arg(&tmp)
        .status()
        .await
        .map_err(|e| RescueCacheError::ConversionError(format!("running qemu-img: {e}")))?;

    if !status.success() {
        let _ = std::fs::remove_file(&tmp);
        return Err(RescueCacheError::ConversionError(format!(
            "qemu-img convert exited with {status}"
        )));
    }

    std::fs::rename(&tmp, dest).map_err(|e| RescueCacheError::FileSystemError {
        context: format!("renaming {} to {}", tmp.display(), dest.display()),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_lookup_finds_entry() {
        let manifest = "\
0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef *noble-server-cloudimg-amd64.img
fedcba9876543210fedcba9876543210fedcba9876543210fedcba9876543210 *noble-server-cloudimg-arm64.img
";
        let hash = checksum_from_manifest(manifest, "noble-server-cloudimg-amd64.img").unwrap();
        assert_eq!(
            hash,
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn manifest_lookup_reports_missing_entry() {
        assert!(matches!(
            checksum_from_manifest("deadbeef *other.img\n", "missing.img"),
            Err(RescueCacheError::ParseError(_))
        ));
    }

    #[test]
    fn sha256_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn unsupported_architecture_is_rejected() {
        assert!(matches!(
            image_for_arch("riscv64"),
            Err(RescueCacheError::UnsupportedArchitecture(_))
        ));
        assert!(image_for_arch("x86_64").is_ok());
        assert!(image_for_arch("aarch64").is_ok());
    }
}
