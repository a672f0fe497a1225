//! Narrow interface to the multisite post store.
//!
//! Every [`PostStore`] operation acts on the *current blog* of its
//! [`Multisite`] context. Code that needs another blog enters it with a
//! [`BlogSwitch`], which restores the previous blog when dropped.

use crate::model::{BlogId, PostId, TermId};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};

pub mod sqlite;

pub use sqlite::SqlitePostStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: PostId,
    pub post_type: String,
    pub post_title: String,
    pub post_name: String,
    pub post_content: String,
    pub post_excerpt: String,
    pub post_status: String,
    pub post_date: String,
    pub post_date_gmt: String,
    pub post_author: i64,
    pub post_parent: PostId,
    pub post_mime_type: String,
}

/// Fields for an insert (`id: None`) or an in-place update (`id: Some`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostFields {
    pub id: Option<PostId>,
    pub post_type: String,
    pub post_title: String,
    pub post_name: String,
    pub post_content: String,
    pub post_excerpt: String,
    pub post_status: String,
    pub post_date: String,
    pub post_date_gmt: String,
    pub post_author: i64,
    pub post_parent: PostId,
    pub post_mime_type: String,
}

impl From<&Post> for PostFields {
    fn from(post: &Post) -> Self {
        Self {
            id: Some(post.id),
            post_type: post.post_type.clone(),
            post_title: post.post_title.clone(),
            post_name: post.post_name.clone(),
            post_content: post.post_content.clone(),
            post_excerpt: post.post_excerpt.clone(),
            post_status: post.post_status.clone(),
            post_date: post.post_date.clone(),
            post_date_gmt: post.post_date_gmt.clone(),
            post_author: post.post_author,
            post_parent: post.post_parent,
            post_mime_type: post.post_mime_type.clone(),
        }
    }
}

pub const ALL_POST_STATUSES: &[&str] = &[
    "publish", "future", "draft", "pending", "private", "inherit", "trash",
];

/// Post lookup filter. Unset fields do not constrain the result; trashed
/// posts are excluded unless `statuses` names `trash` explicitly.
#[derive(Debug, Clone, Default)]
pub struct PostQuery {
    pub post_type: Option<String>,
    pub post_name: Option<String>,
    pub statuses: Option<Vec<String>>,
    pub parent: Option<PostId>,
    pub meta: Option<(String, Value)>,
    /// Matches attachments whose stored file name equals this value.
    pub attached_file_name: Option<String>,
    pub limit: Option<i64>,
}

impl PostQuery {
    pub fn by_name(post_name: &str, post_type: &str) -> Self {
        Self {
            post_name: Some(post_name.to_string()),
            post_type: Some(post_type.to_string()),
            ..Default::default()
        }
    }

    pub fn by_meta(key: &str, value: Value) -> Self {
        Self {
            meta: Some((key.to_string(), value)),
            ..Default::default()
        }
    }

    pub fn of_type(mut self, post_type: &str) -> Self {
        self.post_type = Some(post_type.to_string());
        self
    }

    pub fn published(mut self) -> Self {
        self.statuses = Some(vec!["publish".to_string()]);
        self
    }

    pub fn with_parent(mut self, parent: PostId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Match trashed posts as well.
    pub fn any_status(mut self) -> Self {
        self.statuses = Some(ALL_POST_STATUSES.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn first(mut self) -> Self {
        self.limit = Some(1);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    pub term_id: TermId,
    pub taxonomy: String,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub parent: TermId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TermArgs {
    pub slug: String,
    pub name: String,
    pub description: String,
    pub parent: TermId,
}

/// Addresses of the current blog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteInfo {
    pub blog_id: BlogId,
    pub home_url: String,
    pub network_url: String,
    pub upload_dir: PathBuf,
    pub upload_url: String,
}

/// Process-wide "current blog" context of a multisite network.
pub trait Multisite: Send + Sync {
    fn current_blog_id(&self) -> BlogId;
    /// Push `blog_id` as the current blog.
    fn switch_to_blog(&self, blog_id: BlogId);
    /// Pop back to the blog that was current before the last switch.
    fn restore_current_blog(&self);
}

/// Scoped blog switch. Dropping it restores the previous blog, including on
/// early returns and `?` propagation.
#[must_use = "the previous blog is restored as soon as the guard is dropped"]
pub struct BlogSwitch<'a, S: Multisite + ?Sized> {
    sites: &'a S,
}

impl<'a, S: Multisite + ?Sized> BlogSwitch<'a, S> {
    pub fn enter(sites: &'a S, blog_id: BlogId) -> Self {
        sites.switch_to_blog(blog_id);
        Self { sites }
    }
}

impl<S: Multisite + ?Sized> Drop for BlogSwitch<'_, S> {
    fn drop(&mut self) {
        self.sites.restore_current_blog();
    }
}

#[async_trait]
pub trait PostStore: Multisite {
    async fn site_info(&self) -> Result<SiteInfo>;
    async fn blog_exists(&self, blog_id: BlogId) -> Result<bool>;

    async fn get_post(&self, id: PostId) -> Result<Option<Post>>;
    async fn find_posts(&self, query: &PostQuery) -> Result<Vec<Post>>;
    /// Insert (`fields.id == None`) or update in place; returns the post ID.
    async fn insert_or_update_post(&self, fields: &PostFields) -> Result<PostId>;
    /// Insert or update an attachment record pointing at `file` inside the uploads dir.
    async fn insert_attachment(&self, fields: &PostFields, file: &Path) -> Result<PostId>;
    /// Trash (`force == false`) or permanently delete. Returns false when the post does not exist.
    async fn delete_post(&self, id: PostId, force: bool) -> Result<bool>;

    async fn get_post_meta(&self, id: PostId, key: &str) -> Result<Vec<Value>>;
    async fn get_all_post_meta(&self, id: PostId) -> Result<Vec<(String, Value)>>;
    async fn add_post_meta(&self, id: PostId, key: &str, value: &Value) -> Result<()>;
    /// Replace the slot holding `prev`, or every value of `key` when `prev` is None.
    /// Adds the value when no slot matches.
    async fn update_post_meta(
        &self,
        id: PostId,
        key: &str,
        value: &Value,
        prev: Option<&Value>,
    ) -> Result<()>;
    async fn delete_post_meta(&self, id: PostId, key: &str) -> Result<()>;

    async fn get_post_taxonomies(&self, id: PostId) -> Result<Vec<String>>;
    async fn get_object_terms(&self, id: PostId, taxonomy: &str) -> Result<Vec<Term>>;
    async fn set_object_terms(&self, id: PostId, taxonomy: &str, term_ids: &[TermId])
        -> Result<()>;
    async fn get_term(&self, term_id: TermId) -> Result<Option<Term>>;
    async fn get_term_by_slug(&self, slug: &str, taxonomy: &str) -> Result<Option<Term>>;
    async fn get_terms(&self, taxonomy: &str) -> Result<Vec<Term>>;
    async fn insert_term(&self, taxonomy: &str, args: &TermArgs) -> Result<TermId>;
    async fn update_term(&self, term_id: TermId, args: &TermArgs) -> Result<()>;
    async fn register_taxonomy(&self, taxonomy: &str, object_types: &[String]) -> Result<()>;

    async fn get_permalink(&self, id: PostId) -> Result<Option<String>>;
    async fn get_edit_url(&self, id: PostId) -> Result<Option<String>>;
    /// Absolute path of an attachment's file, if it has one.
    async fn attached_file_path(&self, id: PostId) -> Result<Option<PathBuf>>;
    async fn attachment_url(&self, id: PostId) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Stack(Mutex<Vec<BlogId>>);

    impl Multisite for Stack {
        fn current_blog_id(&self) -> BlogId {
            self.0.lock().unwrap().last().copied().unwrap_or(1)
        }
        fn switch_to_blog(&self, blog_id: BlogId) {
            self.0.lock().unwrap().push(blog_id);
        }
        fn restore_current_blog(&self) {
            self.0.lock().unwrap().pop();
        }
    }

    fn fails_inside(sites: &Stack) -> Result<()> {
        let _switch = BlogSwitch::enter(sites, 5);
        assert_eq!(sites.current_blog_id(), 5);
        anyhow::bail!("import blew up")
    }

    #[test]
    fn blog_switch_restores_on_error_paths() {
        let sites = Stack::default();
        assert!(fails_inside(&sites).is_err());
        assert_eq!(sites.current_blog_id(), 1);
    }

    #[test]
    fn blog_switches_nest() {
        let sites = Stack::default();
        let outer = BlogSwitch::enter(&sites, 2);
        {
            let _inner = BlogSwitch::enter(&sites, 3);
            assert_eq!(sites.current_blog_id(), 3);
        }
        assert_eq!(sites.current_blog_id(), 2);
        drop(outer);
        assert_eq!(sites.current_blog_id(), 1);
    }
}
