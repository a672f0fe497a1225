//! Matching incoming posts against posts that already exist on the current blog.
use super::prepared::{ExistingPost, PreparedPost, PreparedPosts};
use crate::hooks::{ConflictCandidate, ConflictPolicy};
use crate::model::{SyncStatus, META_SYNCED_POST_ID, META_SYNCED_POST_STATUS, POST_TYPE_ATTACHMENT};
use crate::store::{Post, PostQuery, PostStore};
use anyhow::Result;
use serde_json::Value;
use tracing::debug;

/// The post on the current blog that `incoming` would collide with.
///
/// Lookup order: same global ID and type, then same slug and type, then (for
/// attachments) same file name.
pub async fn find_existing_post(store: &dyn PostStore, incoming: &PreparedPost) -> Result<Option<Post>> {
    if let Some(gid) = incoming.gid() {
        let found = store
            .find_posts(
                &PostQuery::by_meta(META_SYNCED_POST_ID, Value::String(gid.to_string()))
                    .of_type(&incoming.post_type)
                    .first(),
            )
            .await?;
        if let Some(post) = found.into_iter().next() {
            return Ok(Some(post));
        }
    }

    if !incoming.post_name.is_empty() {
        let found = store
            .find_posts(&PostQuery::by_name(&incoming.post_name, &incoming.post_type).first())
            .await?;
        if let Some(post) = found.into_iter().next() {
            return Ok(Some(post));
        }
    }

    if incoming.is_attachment() {
        if let Some(media) = incoming.media.as_ref().filter(|m| !m.name.is_empty()) {
            let query = PostQuery {
                attached_file_name: Some(media.name.clone()),
                ..PostQuery::default().of_type(POST_TYPE_ATTACHMENT).first()
            };
            return Ok(store.find_posts(&query).await?.into_iter().next());
        }
    }
    Ok(None)
}

/// Global ID and sync status recorded on an existing post.
pub async fn sync_state(store: &dyn PostStore, post: &Post) -> Result<(Option<String>, Option<SyncStatus>)> {
    let gid = store
        .get_post_meta(post.id, META_SYNCED_POST_ID)
        .await?
        .into_iter()
        .find_map(|v| v.as_str().map(str::to_string))
        .filter(|g| !g.is_empty());
    let status = store
        .get_post_meta(post.id, META_SYNCED_POST_STATUS)
        .await?
        .into_iter()
        .find_map(|v| v.as_str().and_then(SyncStatus::parse_status));
    Ok((gid, status))
}

/// Annotate each post that collides with an existing one on the current blog.
/// Never writes.
pub async fn get_posts_with_conflicts(
    store: &dyn PostStore,
    policy: &dyn ConflictPolicy,
    mut posts: PreparedPosts,
) -> Result<PreparedPosts> {
    for (origin_id, incoming) in posts.iter_mut() {
        let Some(existing) = find_existing_post(store, incoming).await? else {
            continue;
        };
        let (gid, sync_status) = sync_state(store, &existing).await?;
        let candidate = ConflictCandidate {
            post: &existing,
            gid: gid.as_deref(),
            sync_status,
        };
        if policy.suppress_conflict(incoming, &candidate) {
            debug!(origin_id, existing = existing.id, "conflict suppressed");
            continue;
        }
        let post_link = match store.get_edit_url(existing.id).await? {
            Some(url) => url,
            None => store.get_permalink(existing.id).await?.unwrap_or_default(),
        };
        incoming.existing_post = Some(ExistingPost {
            id: existing.id,
            original_post_id: *origin_id,
            post_link,
            post_type: existing.post_type.clone(),
        });
    }
    Ok(posts)
}
