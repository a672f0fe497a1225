//! Global IDs: the cross-site identity of a synced post.
//!
//! Format: `{origin_blog_id}-{origin_post_id}[-{origin_network_url}]`. Posts
//! that live on the same network omit the URL segment.
use crate::model::{BlogId, PostId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid global id '{0}'")]
pub struct GidParseError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalId {
    pub blog_id: BlogId,
    pub post_id: PostId,
    pub network_url: Option<String>,
}

impl GlobalId {
    pub fn local(blog_id: BlogId, post_id: PostId) -> Self {
        Self {
            blog_id,
            post_id,
            network_url: None,
        }
    }

    pub fn remote(blog_id: BlogId, post_id: PostId, network_url: impl Into<String>) -> Self {
        Self {
            blog_id,
            post_id,
            network_url: Some(normalize_network_url(&network_url.into())),
        }
    }

    /// True when the root post lives on the network identified by `own_network_url`.
    pub fn is_on_network(&self, own_network_url: &str) -> bool {
        match &self.network_url {
            None => true,
            Some(url) => *url == normalize_network_url(own_network_url),
        }
    }
}

/// Strip scheme-independent noise so URLs compare equal.
pub fn normalize_network_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.network_url {
            Some(url) => write!(f, "{}-{}-{}", self.blog_id, self.post_id, url),
            None => write!(f, "{}-{}", self.blog_id, self.post_id),
        }
    }
}

impl FromStr for GlobalId {
    type Err = GidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || GidParseError(s.to_string());
        // The network URL may itself contain dashes, so only split twice.
        let mut parts = s.trim().splitn(3, '-');
        let blog_id = parts
            .next()
            .and_then(|p| p.parse::<BlogId>().ok())
            .filter(|id| *id > 0)
            .ok_or_else(err)?;
        let post_id = parts
            .next()
            .and_then(|p| p.parse::<PostId>().ok())
            .filter(|id| *id > 0)
            .ok_or_else(err)?;
        let network_url = match parts.next() {
            Some(url) if !url.trim().is_empty() => Some(normalize_network_url(url)),
            Some(_) => return Err(err()),
            None => None,
        };
        Ok(Self {
            blog_id,
            post_id,
            network_url,
        })
    }
}

impl Serialize for GlobalId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GlobalId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
