//! The transport representation of a post and its dependencies.
use crate::gid::GlobalId;
use crate::model::{
    BlogId, ConflictAction, ExportOptions, ImportAction, PostId, SyncStatus, TermId,
    META_SYNCED_POST_ID, META_SYNCED_POST_STATUS, META_THUMBNAIL_ID, POST_TYPE_ATTACHMENT,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Multi-valued meta, keyed by meta key.
pub type MetaMap = IndexMap<String, Vec<Value>>;

/// Prepared posts keyed by their origin post ID, in export order.
pub type PreparedPosts = IndexMap<PostId, PreparedPost>;

/// A post reference captured by (id, name, type) so it can be found again by
/// name on a site where the numeric ID means something else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostRef {
    pub id: PostId,
    pub name: String,
    #[serde(rename = "type")]
    pub post_type: String,
    /// Front-end URL of the file, for attachments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermRef {
    pub id: TermId,
    /// Term slug.
    pub name: String,
    pub taxonomy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermDescriptor {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<TermDescriptor>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaInfo {
    /// File name.
    pub name: String,
    /// Absolute path on the exporting site.
    pub path: String,
    pub url: String,
    /// Path below the uploads root, e.g. `2024/05/photo.jpg`.
    pub relative_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostHierarchy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<PostRef>,
    #[serde(default)]
    pub children: Vec<PostRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageData {
    pub code: String,
    #[serde(default)]
    pub tool: String,
    /// Sibling translations, language code to origin post ID.
    #[serde(default)]
    pub post_ids: IndexMap<String, PostId>,
    #[serde(default)]
    pub args: Value,
}

/// A destination-side post that collides with an incoming one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExistingPost {
    #[serde(rename = "ID")]
    pub id: PostId,
    pub original_post_id: PostId,
    pub post_link: String,
    pub post_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PreparedPost {
    #[serde(rename = "ID")]
    pub id: PostId,
    /// Blog the post was exported from.
    #[serde(default)]
    pub blog_id: BlogId,
    pub post_type: String,
    #[serde(default)]
    pub post_title: String,
    #[serde(default)]
    pub post_name: String,
    #[serde(default)]
    pub post_content: String,
    #[serde(default)]
    pub post_excerpt: String,
    #[serde(default)]
    pub post_status: String,
    #[serde(default)]
    pub post_date: String,
    #[serde(default)]
    pub post_date_gmt: String,
    #[serde(default)]
    pub post_author: i64,
    #[serde(default)]
    pub post_parent: PostId,
    #[serde(default)]
    pub post_mime_type: String,
    #[serde(default)]
    pub meta: MetaMap,
    #[serde(default)]
    pub terms: IndexMap<String, Vec<TermDescriptor>>,
    #[serde(default)]
    pub nested: IndexMap<PostId, PostRef>,
    #[serde(default)]
    pub nested_terms: IndexMap<TermId, TermRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_hierarchy: Option<PostHierarchy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<LanguageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_action: Option<ConflictAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_action: Option<ImportAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_arguments: Option<ExportOptions>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_contentsync_root_post: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_post: Option<ExistingPost>,
}

impl PreparedPost {
    pub fn is_attachment(&self) -> bool {
        self.post_type == POST_TYPE_ATTACHMENT
    }

    pub fn first_meta(&self, key: &str) -> Option<&Value> {
        self.meta.get(key).and_then(|values| values.first())
    }

    pub fn first_meta_str(&self, key: &str) -> Option<&str> {
        self.first_meta(key).and_then(Value::as_str)
    }

    pub fn set_meta(&mut self, key: &str, value: Value) {
        self.meta.insert(key.to_string(), vec![value]);
    }

    /// The post's global ID, if it is (or was made) a synced post.
    pub fn gid(&self) -> Option<GlobalId> {
        self.first_meta_str(META_SYNCED_POST_ID)
            .and_then(|raw| raw.parse().ok())
    }

    pub fn sync_status(&self) -> Option<SyncStatus> {
        self.first_meta_str(META_SYNCED_POST_STATUS)
            .and_then(SyncStatus::parse_status)
    }

    pub fn set_gid(&mut self, gid: &GlobalId, status: SyncStatus) {
        self.set_meta(META_SYNCED_POST_ID, Value::String(gid.to_string()));
        self.set_meta(META_SYNCED_POST_STATUS, Value::String(status.as_str().into()));
    }

    pub fn thumbnail_id(&self) -> Option<PostId> {
        self.first_meta(META_THUMBNAIL_ID).and_then(meta_as_id)
    }

    pub fn language_code(&self) -> Option<&str> {
        self.language
            .as_ref()
            .map(|l| l.code.as_str())
            .filter(|c| !c.is_empty())
    }
}

/// Meta IDs are stored as numbers or numeric strings depending on who wrote them.
pub fn meta_as_id(value: &Value) -> Option<PostId> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|id| *id > 0)
}
