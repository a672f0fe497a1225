//! Extension points around conflict detection, import and distribution.
//!
//! Each trait has default behavior; callers replace individual strategies
//! through [`Hooks`].
use crate::model::{PostId, SyncStatus, META_CONNECTION_MAP, META_SYNCED_POST_STATUS};
use crate::post::prepared::{PreparedPost, PreparedPosts, TermDescriptor};
use crate::store::{Post, SiteInfo};
use std::sync::Arc;

/// Information about the destination-side post an incoming post collides with.
#[derive(Debug, Clone)]
pub struct ConflictCandidate<'a> {
    pub post: &'a Post,
    /// Global ID recorded on the existing post, if any.
    pub gid: Option<&'a str>,
    pub sync_status: Option<SyncStatus>,
}

pub trait ConflictPolicy: Send + Sync {
    /// Return true to drop a conflict from the report.
    fn suppress_conflict(&self, incoming: &PreparedPost, existing: &ConflictCandidate<'_>) -> bool {
        let incoming_gid = incoming.gid().map(|g| g.to_string());
        incoming_gid.is_some()
            && incoming_gid.as_deref() == existing.gid
            && existing.sync_status == Some(SyncStatus::Linked)
    }
}

/// Meta keys that are never copied to the destination.
pub const META_BLACKLIST: &[&str] = &[
    "_edit_lock",
    "_edit_last",
    "_wp_old_slug",
    "_wp_old_date",
    "_wp_trash_meta_status",
    "_wp_trash_meta_time",
    "_wp_attached_file",
    "_wp_attachment_metadata",
    "_thumbnail_id",
    META_CONNECTION_MAP,
];

pub trait ImportFilters: Send + Sync {
    fn skip_meta_key(&self, _post: &PreparedPost, _key: &str) -> bool {
        false
    }

    fn skip_taxonomy(&self, _post: &PreparedPost, _taxonomy: &str) -> bool {
        false
    }

    fn filter_terms(
        &self,
        _post: &PreparedPost,
        _taxonomy: &str,
        terms: Vec<TermDescriptor>,
    ) -> Vec<TermDescriptor> {
        terms
    }

    /// `{{name}}` placeholders and their values on the destination site.
    fn string_replacements(&self, site: &SiteInfo) -> Vec<(String, String)> {
        vec![
            ("home_url".to_string(), site.home_url.clone()),
            ("uploads_url".to_string(), site.upload_url.clone()),
        ]
    }
}

pub trait DistributionFilter: Send + Sync {
    /// Last change to the prepared posts before they are scheduled.
    fn filter_prepared_posts(&self, posts: PreparedPosts, _root_post_id: Option<PostId>) -> PreparedPosts {
        posts
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl ConflictPolicy for DefaultHooks {}
impl ImportFilters for DefaultHooks {}
impl DistributionFilter for DefaultHooks {}

#[derive(Clone)]
pub struct Hooks {
    pub conflicts: Arc<dyn ConflictPolicy>,
    pub import: Arc<dyn ImportFilters>,
    pub distribution: Arc<dyn DistributionFilter>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            conflicts: Arc::new(DefaultHooks),
            import: Arc::new(DefaultHooks),
            distribution: Arc::new(DefaultHooks),
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}

/// Meta keys the importer writes itself or that belong to the origin only.
pub fn is_blacklisted_meta(key: &str) -> bool {
    META_BLACKLIST.contains(&key)
}

/// `synced_post_status` is rewritten on import; everything else passes through.
pub fn is_sync_status_key(key: &str) -> bool {
    key == META_SYNCED_POST_STATUS
}
