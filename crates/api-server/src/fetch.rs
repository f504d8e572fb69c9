//! URL fetcher
//!
//! Downloads a submission over HTTP(S) into the staging directory and hands
//! the local path to the job service; from the pipeline's viewpoint a URL
//! submission is indistinguishable from an upload.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Video extensions we recognize when inferring a filename from the URL
const KNOWN_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "webm", "m4v", "ts", "flv"];

/// Download a video from a URL into `staging_dir`, returning the local path
/// and the filename to record on the job.
pub async fn fetch_to_staging(url: &str, staging_dir: &Path) -> Result<(PathBuf, String)> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        bail!("only http:// and https:// URLs are supported");
    }
    info!("Fetching submission from {url}");

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()
        .context("failed to build HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("request failed")?;
    if !response.status().is_success() {
        bail!("download failed with status {}", response.status());
    }

    let extension = infer_extension(url, response.headers().get("content-type"))
        .unwrap_or_else(|| "mp4".to_string());
    let filename = infer_filename(url, &extension);

    tokio::fs::create_dir_all(staging_dir)
        .await
        .context("failed to create staging dir")?;
    let staged = staging_dir.join(format!("{}.{extension}", uuid::Uuid::new_v4().simple()));
    let mut file = tokio::fs::File::create(&staged)
        .await
        .context("failed to create staging file")?;

    let bytes = response.bytes().await.context("failed to read body")?;
    if bytes.is_empty() {
        bail!("downloaded zero bytes");
    }
    file.write_all(&bytes).await.context("failed to write staging file")?;
    file.flush().await.context("failed to flush staging file")?;

    debug!("Fetched {} bytes to {}", bytes.len(), staged.display());
    Ok((staged, filename))
}

fn infer_extension(
    url: &str,
    content_type: Option<&reqwest::header::HeaderValue>,
) -> Option<String> {
    // Path extension wins when it looks like video
    let path_ext = url
        .split('?')
        .next()
        .and_then(|clean| clean.rsplit('.').next())
        .map(str::to_lowercase);
    if let Some(ext) = path_ext {
        if KNOWN_EXTENSIONS.contains(&ext.as_str()) {
            return Some(ext);
        }
    }

    content_type
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| match ct.split(';').next().unwrap_or("") {
            "video/mp4" => Some("mp4".to_string()),
            "video/quicktime" => Some("mov".to_string()),
            "video/x-matroska" => Some("mkv".to_string()),
            "video/webm" => Some("webm".to_string()),
            _ => None,
        })
}

fn infer_filename(url: &str, extension: &str) -> String {
    url.split('?')
        .next()
        .and_then(|clean| clean.rsplit('/').next())
        .filter(|name| !name.is_empty() && name.contains('.'))
        .map(str::to_string)
        .unwrap_or_else(|| format!("download.{extension}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_from_url() {
        assert_eq!(
            infer_extension("https://host/a/video.MP4?sig=x", None),
            Some("mp4".to_string())
        );
        assert_eq!(infer_extension("https://host/stream", None), None);
    }

    #[test]
    fn test_extension_from_content_type() {
        let value = reqwest::header::HeaderValue::from_static("video/webm; charset=binary");
        assert_eq!(
            infer_extension("https://host/stream", Some(&value)),
            Some("webm".to_string())
        );
    }

    #[test]
    fn test_filename_inference() {
        assert_eq!(
            infer_filename("https://host/path/clip.mp4?x=1", "mp4"),
            "clip.mp4"
        );
        assert_eq!(infer_filename("https://host/stream", "mp4"), "download.mp4");
    }

    #[tokio::test]
    async fn test_rejects_non_http_schemes() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = fetch_to_staging("ftp://host/clip.mp4", dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("http"));
    }
}
