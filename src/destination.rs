//! Where a distribution goes: a local blog, or blogs on a remote network.
use crate::connection::{get_connection_map, ConnectionTarget};
use crate::error::SyncError;
use crate::gid::normalize_network_url;
use crate::model::{BlogId, ConflictAction, ExportOptions, ImportAction, ItemStatus, PostId};
use crate::store::PostStore;
use anyhow::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// Per-destination directives supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DestinationOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_action: Option<ImportAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_action: Option<ConflictAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_arguments: Option<ExportOptions>,
}

/// Outcome for one post at one destination blog.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostResult {
    /// Destination-local post ID.
    pub post_id: PostId,
    pub status: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PostResult {
    pub fn success(post_id: PostId, url: impl Into<String>) -> Self {
        Self {
            post_id,
            status: ItemStatus::Success.as_str().to_string(),
            url: url.into(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BlogDestination {
    #[serde(rename = "ID")]
    pub blog_id: BlogId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_action: Option<ImportAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_action: Option<ConflictAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_arguments: Option<ExportOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ItemStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Results keyed by origin post ID.
    #[serde(default)]
    pub posts: IndexMap<PostId, PostResult>,
    /// Linked copies already on file for this blog, origin post ID to local ID.
    #[serde(default)]
    pub existing_posts: IndexMap<PostId, PostId>,
}

impl BlogDestination {
    pub fn new(blog_id: BlogId, overrides: &DestinationOverrides) -> Self {
        let mut dest = Self {
            blog_id,
            ..Default::default()
        };
        dest.apply(overrides);
        dest
    }

    pub fn apply(&mut self, overrides: &DestinationOverrides) {
        if overrides.import_action.is_some() {
            self.import_action = overrides.import_action;
        }
        if overrides.conflict_action.is_some() {
            self.conflict_action = overrides.conflict_action;
        }
        if overrides.export_arguments.is_some() {
            self.export_arguments = overrides.export_arguments.clone();
        }
    }

    pub fn overrides(&self) -> DestinationOverrides {
        DestinationOverrides {
            import_action: self.import_action,
            conflict_action: self.conflict_action,
            export_arguments: self.export_arguments.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteDestination {
    #[serde(rename = "ID")]
    pub network_url: String,
    #[serde(default)]
    pub blogs: IndexMap<BlogId, BlogDestination>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ItemStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Blog(BlogDestination),
    Remote(RemoteDestination),
}

impl Destination {
    /// Map key: the blog ID for local blogs, the network URL for remote ones.
    pub fn key(&self) -> String {
        match self {
            Destination::Blog(blog) => blog.blog_id.to_string(),
            Destination::Remote(remote) => remote.network_url.clone(),
        }
    }

    pub fn status(&self) -> Option<ItemStatus> {
        match self {
            Destination::Blog(blog) => blog.status,
            Destination::Remote(remote) => remote.status,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Destination::Blog(blog) => blog.error.as_deref(),
            Destination::Remote(remote) => remote.error.as_deref(),
        }
    }

    pub fn set_outcome(&mut self, status: ItemStatus, error: Option<String>) {
        match self {
            Destination::Blog(blog) => {
                blog.status = Some(status);
                blog.error = error;
            }
            Destination::Remote(remote) => {
                remote.status = Some(status);
                remote.error = error;
            }
        }
    }

    /// Record the result for one post. `blog_id` selects the blog inside a
    /// remote destination and is ignored for local ones.
    pub fn record_post(&mut self, blog_id: BlogId, origin_id: PostId, result: PostResult) {
        match self {
            Destination::Blog(blog) => {
                blog.posts.insert(origin_id, result);
            }
            Destination::Remote(remote) => {
                remote
                    .blogs
                    .entry(blog_id)
                    .or_insert_with(|| BlogDestination {
                        blog_id,
                        ..Default::default()
                    })
                    .posts
                    .insert(origin_id, result);
            }
        }
    }
}

/// A parsed destination key: `"2"` or `"2|https://remote.example"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationKey {
    Blog(BlogId),
    Remote { blog_id: BlogId, network_url: String },
}

impl std::str::FromStr for DestinationKey {
    type Err = SyncError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::Validation(format!("invalid destination key '{}'", raw));
        let (blog, network) = match raw.trim().split_once('|') {
            Some((blog, network)) => (blog, Some(network)),
            None => (raw.trim(), None),
        };
        let blog_id: BlogId = blog.trim().parse().map_err(|_| invalid())?;
        if blog_id <= 0 {
            return Err(invalid());
        }
        match network.map(str::trim) {
            None => Ok(DestinationKey::Blog(blog_id)),
            Some("") => Err(invalid()),
            Some(url) => Ok(DestinationKey::Remote {
                blog_id,
                network_url: normalize_network_url(url),
            }),
        }
    }
}

/// Flat key list to requests without overrides.
pub fn requests_from_keys<I, S>(keys: I) -> IndexMap<String, DestinationOverrides>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    keys.into_iter()
        .map(|k| (k.into(), DestinationOverrides::default()))
        .collect()
}

/// Build the destinations for one distribution call.
///
/// The current blog is never a destination. With a `root_post_id`, every
/// connection recorded on the root post is added too, carrying the local post
/// ID already on file.
#[instrument(skip_all, fields(blog_id = store.current_blog_id()))]
pub async fn get_destinations(
    store: &dyn PostStore,
    requests: &IndexMap<String, DestinationOverrides>,
    root_post_id: Option<PostId>,
) -> Result<IndexMap<String, Destination>> {
    let current = store.current_blog_id();
    let mut blogs: IndexMap<BlogId, BlogDestination> = IndexMap::new();
    let mut remotes: IndexMap<String, RemoteDestination> = IndexMap::new();

    for (raw, overrides) in requests {
        match raw.parse::<DestinationKey>()? {
            DestinationKey::Blog(blog_id) => {
                if blog_id == current {
                    debug!(blog_id, "current blog skipped as destination");
                    continue;
                }
                if !store.blog_exists(blog_id).await? {
                    warn!(blog_id, "destination blog does not exist");
                    continue;
                }
                blogs
                    .entry(blog_id)
                    .and_modify(|blog| blog.apply(overrides))
                    .or_insert_with(|| BlogDestination::new(blog_id, overrides));
            }
            DestinationKey::Remote {
                blog_id,
                network_url,
            } => {
                remote_entry(&mut remotes, &network_url)
                    .blogs
                    .entry(blog_id)
                    .and_modify(|blog| blog.apply(overrides))
                    .or_insert_with(|| BlogDestination::new(blog_id, overrides));
            }
        }
    }

    if let Some(root_post_id) = root_post_id {
        let map = get_connection_map(store, root_post_id).await?;
        for (target, connection) in map.entries() {
            let blog = match target {
                ConnectionTarget::Local(blog_id) if blog_id == current => continue,
                ConnectionTarget::Local(blog_id) => blogs
                    .entry(blog_id)
                    .or_insert_with(|| BlogDestination::new(blog_id, &DestinationOverrides::default())),
                ConnectionTarget::Remote {
                    network_url,
                    blog_id,
                } => remote_entry(&mut remotes, &network_url)
                    .blogs
                    .entry(blog_id)
                    .or_insert_with(|| BlogDestination::new(blog_id, &DestinationOverrides::default())),
            };
            blog.existing_posts.insert(root_post_id, connection.post_id);
        }
    }

    let mut destinations: IndexMap<String, Destination> = blogs
        .into_iter()
        .map(|(blog_id, blog)| (blog_id.to_string(), Destination::Blog(blog)))
        .collect();
    destinations.extend(
        remotes
            .into_iter()
            .map(|(url, remote)| (url, Destination::Remote(remote))),
    );
    Ok(destinations)
}

fn remote_entry<'m>(
    remotes: &'m mut IndexMap<String, RemoteDestination>,
    network_url: &str,
) -> &'m mut RemoteDestination {
    let key = normalize_network_url(network_url);
    remotes
        .entry(key.clone())
        .or_insert_with(|| RemoteDestination {
            network_url: key,
            ..Default::default()
        })
}
