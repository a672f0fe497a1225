//! Fetching attachment files into a blog's uploads directory.
use super::archive;
use super::prepared::{MediaInfo, PreparedPost};
use crate::store::sqlite::WP_DATE_FORMAT;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{Datelike, NaiveDateTime};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where attachment bytes come from during an import.
#[derive(Debug, Clone)]
pub enum MediaSource {
    /// Same network: copy from the absolute path recorded at export.
    Local,
    /// A transport archive directory; removed after import when `cleanup` is set.
    Archive { dir: PathBuf, cleanup: bool },
    /// Download from the URL recorded at export.
    Remote(reqwest::Client),
}

impl MediaSource {
    /// Write the file of `media` to `dest`, replacing whatever is there.
    pub async fn fetch(&self, media: &MediaInfo, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create uploads dir: {}", parent.display()))?;
        }
        remove_if_exists(dest).await?;

        match self {
            MediaSource::Local => {
                tokio::fs::copy(&media.path, dest)
                    .await
                    .with_context(|| format!("failed to copy {} to {}", media.path, dest.display()))?;
            }
            MediaSource::Archive { dir, .. } => {
                let src = archive::media_path(dir, &media.name);
                tokio::fs::copy(&src, dest)
                    .await
                    .with_context(|| format!("archive has no media file {}", src.display()))?;
            }
            MediaSource::Remote(http) => {
                if media.url.is_empty() {
                    bail!("attachment {} has no download url", media.name);
                }
                let resp = http
                    .get(&media.url)
                    .send()
                    .await
                    .with_context(|| format!("failed to download {}", media.url))?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(anyhow!("download of {} failed with {}", media.url, status));
                }
                let bytes = resp.bytes().await?;
                tokio::fs::write(dest, &bytes)
                    .await
                    .with_context(|| format!("failed to write {}", dest.display()))?;
            }
        }
        debug!(file = %dest.display(), "media stored");
        Ok(())
    }

    /// Remove the transport archive if this source owns it.
    pub async fn cleanup(&self) -> Result<()> {
        if let MediaSource::Archive { dir, cleanup: true } = self {
            if tokio::fs::try_exists(dir).await.unwrap_or(false) {
                tokio::fs::remove_dir_all(dir)
                    .await
                    .with_context(|| format!("failed to remove archive {}", dir.display()))?;
                info!(archive = %dir.display(), "transport archive removed");
            }
        }
        Ok(())
    }
}

pub async fn remove_if_exists(path: &Path) -> Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// Uploads-relative path for an incoming attachment: `YYYY/MM/<file>` from the
/// post date, or the exported directory when the date is unusable.
pub fn upload_relative_path(post: &PreparedPost, media: &MediaInfo) -> String {
    let dir = NaiveDateTime::parse_from_str(&post.post_date, WP_DATE_FORMAT)
        .map(|date| format!("{:04}/{:02}", date.year(), date.month()))
        .unwrap_or_else(|_| {
            media
                .relative_path
                .rsplit_once('/')
                .map(|(dir, _)| dir.to_string())
                .unwrap_or_default()
        });
    if dir.is_empty() {
        media.name.clone()
    } else {
        format!("{}/{}", dir, media.name)
    }
}
