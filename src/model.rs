use serde::{Deserialize, Serialize};

pub type BlogId = i64;
pub type PostId = i64;
pub type TermId = i64;

/// Meta key holding the global ID of a synced post.
pub const META_SYNCED_POST_ID: &str = "synced_post_id";
/// Meta key holding `root` or `linked`.
pub const META_SYNCED_POST_STATUS: &str = "synced_post_status";
pub const META_CONNECTION_MAP: &str = "contentsync_connection_map";
pub const META_EXPORT_OPTIONS: &str = "contentsync_export_options";
pub const META_CANONICAL_URL: &str = "contentsync_canonical_url";
pub const META_DYNAMIC_POST_TYPE: &str = "contentsync_dynamic_post_type";
pub const META_DYNAMIC_TAXONOMY: &str = "contentsync_dynamic_taxonomy";
pub const META_THUMBNAIL_ID: &str = "_thumbnail_id";
pub const META_ATTACHED_FILE: &str = "_wp_attached_file";
pub const META_ATTACHMENT_METADATA: &str = "_wp_attachment_metadata";
pub const META_TRASH_STATUS: &str = "_wp_trash_meta_status";

pub const POST_TYPE_ATTACHMENT: &str = "attachment";

/// Lifecycle of a persisted distribution item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Init,
    Started,
    Success,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Init => "init",
            ItemStatus::Started => "started",
            ItemStatus::Success => "success",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "init" => Some(ItemStatus::Init),
            "started" => Some(ItemStatus::Started),
            "success" => Some(ItemStatus::Success),
            "failed" => Some(ItemStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Success | ItemStatus::Failed)
    }
}

/// What to do with an incoming post on the destination.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ImportAction {
    #[default]
    Insert,
    Draft,
    Trash,
    Delete,
}

impl ImportAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportAction::Insert => "insert",
            ImportAction::Draft => "draft",
            ImportAction::Trash => "trash",
            ImportAction::Delete => "delete",
        }
    }
}

/// How to treat an existing post that collides with an incoming one.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    #[default]
    Keep,
    Replace,
    Skip,
}

impl ConflictAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictAction::Keep => "keep",
            ConflictAction::Replace => "replace",
            ConflictAction::Skip => "skip",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Root,
    Linked,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Root => "root",
            SyncStatus::Linked => "linked",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "root" => Some(SyncStatus::Root),
            "linked" => Some(SyncStatus::Linked),
            _ => None,
        }
    }
}

/// Options controlling how much of a post graph is exported.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct ExportOptions {
    pub append_nested: bool,
    pub whole_posttype: bool,
    pub all_terms: bool,
    pub resolve_menus: bool,
    pub translations: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_status_round_trips_through_strings() {
        for status in [
            ItemStatus::Init,
            ItemStatus::Started,
            ItemStatus::Success,
            ItemStatus::Failed,
        ] {
            assert_eq!(ItemStatus::parse_status(status.as_str()), Some(status));
        }
        assert_eq!(ItemStatus::parse_status("queued"), None);
        assert!(ItemStatus::Failed.is_terminal());
        assert!(!ItemStatus::Started.is_terminal());
    }

    #[test]
    fn export_options_fill_missing_fields() {
        let opts: ExportOptions = serde_json::from_str(r#"{"append_nested":true}"#).unwrap();
        assert!(opts.append_nested);
        assert!(!opts.translations);
    }

    #[test]
    fn actions_default_to_insert_and_keep() {
        assert_eq!(ImportAction::default(), ImportAction::Insert);
        assert_eq!(ConflictAction::default(), ConflictAction::Keep);
        assert_eq!(
            serde_json::to_string(&ConflictAction::Replace).unwrap(),
            "\"replace\""
        );
    }
}
