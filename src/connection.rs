//! Connection map: where the linked copies of a root post live.
//!
//! Stored on the root post under `contentsync_connection_map` as a JSON
//! object. Numeric keys are local blogs; URL keys are remote networks holding
//! their own `blog_id -> connection` objects.
use crate::gid::{normalize_network_url, GlobalId};
use crate::model::{BlogId, PostId, META_CONNECTION_MAP, META_SYNCED_POST_ID};
use crate::store::{BlogSwitch, PostStore};
use anyhow::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    pub post_id: PostId,
    #[serde(default)]
    pub edit_url: String,
    #[serde(default)]
    pub blog_url: String,
    #[serde(default)]
    pub nice_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ConnectionEntry {
    Local(Connection),
    /// Keyed by blog ID as a string, the way JSON object keys arrive.
    Remote(IndexMap<String, Connection>),
}

/// Where a connection points.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionTarget {
    Local(BlogId),
    Remote { network_url: String, blog_id: BlogId },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ConnectionMap(IndexMap<String, ConnectionEntry>);

impl ConnectionMap {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, target: &ConnectionTarget, connection: Connection) {
        match target {
            ConnectionTarget::Local(blog_id) => {
                self.0
                    .insert(blog_id.to_string(), ConnectionEntry::Local(connection));
            }
            ConnectionTarget::Remote {
                network_url,
                blog_id,
            } => {
                let key = normalize_network_url(network_url);
                let entry = self
                    .0
                    .entry(key)
                    .or_insert_with(|| ConnectionEntry::Remote(IndexMap::new()));
                match entry {
                    ConnectionEntry::Remote(blogs) => {
                        blogs.insert(blog_id.to_string(), connection);
                    }
                    ConnectionEntry::Local(_) => {
                        let mut blogs = IndexMap::new();
                        blogs.insert(blog_id.to_string(), connection);
                        *entry = ConnectionEntry::Remote(blogs);
                    }
                }
            }
        }
    }

    pub fn remove(&mut self, target: &ConnectionTarget) -> Option<Connection> {
        match target {
            ConnectionTarget::Local(blog_id) => match self.0.shift_remove(&blog_id.to_string()) {
                Some(ConnectionEntry::Local(conn)) => Some(conn),
                _ => None,
            },
            ConnectionTarget::Remote {
                network_url,
                blog_id,
            } => {
                let key = normalize_network_url(network_url);
                let (removed, now_empty) = match self.0.get_mut(&key) {
                    Some(ConnectionEntry::Remote(blogs)) => {
                        let removed = blogs.shift_remove(&blog_id.to_string());
                        (removed, blogs.is_empty())
                    }
                    _ => (None, false),
                };
                if now_empty {
                    self.0.shift_remove(&key);
                }
                removed
            }
        }
    }

    pub fn get(&self, target: &ConnectionTarget) -> Option<&Connection> {
        match target {
            ConnectionTarget::Local(blog_id) => match self.0.get(&blog_id.to_string()) {
                Some(ConnectionEntry::Local(conn)) => Some(conn),
                _ => None,
            },
            ConnectionTarget::Remote {
                network_url,
                blog_id,
            } => match self.0.get(&normalize_network_url(network_url)) {
                Some(ConnectionEntry::Remote(blogs)) => blogs.get(&blog_id.to_string()),
                _ => None,
            },
        }
    }

    /// Every connection with its target, local entries first in stored order.
    pub fn entries(&self) -> Vec<(ConnectionTarget, &Connection)> {
        let mut out = Vec::new();
        for (key, entry) in &self.0 {
            match entry {
                ConnectionEntry::Local(conn) => {
                    if let Ok(blog_id) = key.parse::<BlogId>() {
                        out.push((ConnectionTarget::Local(blog_id), conn));
                    }
                }
                ConnectionEntry::Remote(blogs) => {
                    for (blog_id, conn) in blogs {
                        let Ok(blog_id) = blog_id.parse::<BlogId>() else {
                            continue;
                        };
                        out.push((
                            ConnectionTarget::Remote {
                                network_url: key.clone(),
                                blog_id,
                            },
                            conn,
                        ));
                    }
                }
            }
        }
        out.sort_by_key(|(target, _)| matches!(target, ConnectionTarget::Remote { .. }));
        out
    }
}

/// Read the connection map of `root_post_id` on the current blog. Always
/// re-read right before diffing; concurrent distributions write to it too.
pub async fn get_connection_map(store: &dyn PostStore, root_post_id: PostId) -> Result<ConnectionMap> {
    let raw = store
        .get_post_meta(root_post_id, META_CONNECTION_MAP)
        .await?
        .into_iter()
        .next();
    match raw {
        None | Some(Value::Null) => Ok(ConnectionMap::default()),
        Some(Value::Array(items)) if items.is_empty() => Ok(ConnectionMap::default()),
        Some(value) => match serde_json::from_value(value) {
            Ok(map) => Ok(map),
            Err(err) => {
                warn!(?err, root_post_id, "unreadable connection map; treating as empty");
                Ok(ConnectionMap::default())
            }
        },
    }
}

pub async fn save_connection_map(
    store: &dyn PostStore,
    root_post_id: PostId,
    map: &ConnectionMap,
) -> Result<()> {
    if map.is_empty() {
        return store.delete_post_meta(root_post_id, META_CONNECTION_MAP).await;
    }
    store
        .update_post_meta(root_post_id, META_CONNECTION_MAP, &serde_json::to_value(map)?, None)
        .await
}

/// Build the connection record for `post_id` on the current blog.
pub async fn describe_connection(store: &dyn PostStore, post_id: PostId) -> Result<Connection> {
    let site = store.site_info().await?;
    Ok(Connection {
        post_id,
        edit_url: store.get_edit_url(post_id).await?.unwrap_or_default(),
        blog_url: site.home_url.clone(),
        nice_url: store.get_permalink(post_id).await?.unwrap_or_default(),
    })
}

/// Record `connection` in the root post of `gid`, which lives on this network.
#[instrument(skip_all, fields(gid = %gid))]
pub async fn add_connection(
    store: &dyn PostStore,
    gid: &GlobalId,
    target: ConnectionTarget,
    connection: Connection,
) -> Result<()> {
    let _switch = BlogSwitch::enter(store, gid.blog_id);
    if store.get_post(gid.post_id).await?.is_none() {
        warn!("root post not found; connection not recorded");
        return Ok(());
    }
    let mut map = get_connection_map(store, gid.post_id).await?;
    map.insert(&target, connection);
    save_connection_map(store, gid.post_id, &map).await
}

#[instrument(skip_all, fields(gid = %gid))]
pub async fn remove_connection(
    store: &dyn PostStore,
    gid: &GlobalId,
    target: &ConnectionTarget,
) -> Result<()> {
    let _switch = BlogSwitch::enter(store, gid.blog_id);
    if store.get_post(gid.post_id).await?.is_none() {
        return Ok(());
    }
    let mut map = get_connection_map(store, gid.post_id).await?;
    if map.remove(target).is_some() {
        save_connection_map(store, gid.post_id, &map).await?;
    }
    Ok(())
}

/// Drop local entries whose post is gone or no longer carries the root's gid.
/// Remote entries cannot be verified from here and are kept.
#[instrument(skip_all, fields(root_post_id))]
pub async fn check_connection_map(
    store: &dyn PostStore,
    root_post_id: PostId,
) -> Result<Vec<ConnectionTarget>> {
    let gid = GlobalId::local(store.current_blog_id(), root_post_id);
    let expected = Value::String(gid.to_string());
    let mut map = get_connection_map(store, root_post_id).await?;
    let mut stale = Vec::new();

    for (target, connection) in map.entries() {
        let ConnectionTarget::Local(blog_id) = target else {
            continue;
        };
        let healthy = if store.blog_exists(blog_id).await? {
            let _switch = BlogSwitch::enter(store, blog_id);
            match store.get_post(connection.post_id).await? {
                Some(post) if post.post_status != "trash" => store
                    .get_post_meta(connection.post_id, META_SYNCED_POST_ID)
                    .await?
                    .contains(&expected),
                _ => false,
            }
        } else {
            false
        };
        if !healthy {
            stale.push(ConnectionTarget::Local(blog_id));
        }
    }

    if !stale.is_empty() {
        for target in &stale {
            map.remove(target);
        }
        save_connection_map(store, root_post_id, &map).await?;
        info!(pruned = stale.len(), "pruned stale connections");
    }
    Ok(stale)
}
