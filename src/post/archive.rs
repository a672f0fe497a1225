//! Transport archive: a directory holding `posts.json` and `media/<file>`.
use super::prepared::PreparedPosts;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const POSTS_FILE: &str = "posts.json";
pub const MEDIA_DIR: &str = "media";

pub fn media_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(MEDIA_DIR).join(file_name)
}

/// Write `posts` to `dir`, copying each attachment's file into `media/`.
pub async fn write_archive(dir: &Path, posts: &PreparedPosts) -> Result<()> {
    tokio::fs::create_dir_all(dir.join(MEDIA_DIR))
        .await
        .with_context(|| format!("failed to create archive dir: {}", dir.display()))?;

    for post in posts.values() {
        let Some(media) = &post.media else { continue };
        let dest = media_path(dir, &media.name);
        if let Err(err) = tokio::fs::copy(&media.path, &dest).await {
            warn!(post_id = post.id, file = %media.path, %err, "media file not added to archive");
        }
    }

    let json = serde_json::to_vec_pretty(posts)?;
    tokio::fs::write(dir.join(POSTS_FILE), json)
        .await
        .with_context(|| format!("failed to write {}", dir.join(POSTS_FILE).display()))?;
    info!(archive = %dir.display(), posts = posts.len(), "transport archive written");
    Ok(())
}

pub async fn read_archive(dir: &Path) -> Result<PreparedPosts> {
    let path = dir.join(POSTS_FILE);
    let raw = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("invalid {}", path.display()))
}
