//! Contract every translation-tool adapter satisfies.
//!
//! The importer only talks to [`TranslationTool`]; the decision of whether a
//! language variant should be imported at all is shared by every adapter
//! through [`analyze_translation_import`].
use crate::model::PostId;
use crate::post::prepared::{LanguageData, PreparedPost};
use crate::post::resolution::ResolutionTable;
use crate::store::PostStore;
use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;

pub mod meta;

pub use meta::MetaTranslations;

/// Outcome of [`analyze_translation_import`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationDecision {
    /// No language data recorded, import normally.
    NoLanguage,
    SupportedLanguage,
    /// Another sibling has a language this site supports; it is imported instead.
    SkipBetterTranslation { preferred: PostId },
    /// A sibling already got a destination ID this run; reuse it.
    ReuseImported { sibling: PostId, destination: PostId },
    /// Nothing better available; import as the only representative.
    ImportFallback,
}

impl TranslationDecision {
    pub fn should_import(&self) -> bool {
        matches!(
            self,
            TranslationDecision::NoLanguage
                | TranslationDecision::SupportedLanguage
                | TranslationDecision::ImportFallback
        )
    }
}

/// Language state of a post on the current site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostLanguage {
    pub code: String,
    /// Translation group identity (`trid` and friends).
    pub group: Option<String>,
}

pub fn analyze_translation_import(
    post: &PreparedPost,
    site_languages: &[String],
    offered: &HashSet<PostId>,
    imported: &ResolutionTable,
) -> TranslationDecision {
    let Some(language) = post.language.as_ref().filter(|l| !l.code.is_empty()) else {
        return TranslationDecision::NoLanguage;
    };
    if site_languages.iter().any(|code| *code == language.code) {
        return TranslationDecision::SupportedLanguage;
    }

    let siblings = move || {
        language
            .post_ids
            .iter()
            .filter(move |(code, id)| **id != post.id && **code != language.code)
    };

    if let Some((_, preferred)) = siblings().find(|(code, id)| {
        site_languages.iter().any(|c| c == *code) && (offered.contains(*id) || imported.contains(**id))
    }) {
        return TranslationDecision::SkipBetterTranslation {
            preferred: *preferred,
        };
    }

    if let Some((sibling, destination)) = siblings()
        .find_map(|(_, id)| imported.get(*id).map(|dest| (*id, dest)))
    {
        return TranslationDecision::ReuseImported {
            sibling,
            destination,
        };
    }

    TranslationDecision::ImportFallback
}

#[async_trait]
pub trait TranslationTool: Send + Sync {
    /// Name recorded in exported language data, e.g. `wpml`.
    fn tool_name(&self) -> &'static str;

    /// Languages active on the current blog.
    async fn get_language_codes(&self, store: &dyn PostStore) -> Result<Vec<String>>;

    async fn get_post_language_info(
        &self,
        store: &dyn PostStore,
        post_id: PostId,
    ) -> Result<Option<PostLanguage>>;

    /// Language code to post ID for every translation of `post_id`, itself included.
    async fn get_post_translations(
        &self,
        store: &dyn PostStore,
        post_id: PostId,
    ) -> Result<IndexMap<String, PostId>>;

    async fn set_post_language(
        &self,
        store: &dyn PostStore,
        post_id: PostId,
        language_code: &str,
    ) -> Result<()>;

    /// Wire an imported post into the translation group of its siblings.
    /// Joins an existing group when the post or an imported sibling has one.
    async fn set_translations_from_import(
        &self,
        store: &dyn PostStore,
        post_id: PostId,
        language_code: &str,
        original_siblings: &IndexMap<String, PostId>,
        tool_args: &Value,
        imported: &ResolutionTable,
    ) -> Result<()>;

    /// Export-time language snapshot of `post_id`.
    async fn prepare_post_language_data(
        &self,
        store: &dyn PostStore,
        post_id: PostId,
    ) -> Result<Option<LanguageData>> {
        let Some(info) = self.get_post_language_info(store, post_id).await? else {
            return Ok(None);
        };
        let post_ids = self.get_post_translations(store, post_id).await?;
        Ok(Some(LanguageData {
            code: info.code,
            tool: self.tool_name().to_string(),
            post_ids,
            args: info
                .group
                .map(|group| serde_json::json!({ "group": group }))
                .unwrap_or(Value::Null),
        }))
    }

    fn analyze_translation_import(
        &self,
        post: &PreparedPost,
        site_languages: &[String],
        offered: &HashSet<PostId>,
        imported: &ResolutionTable,
    ) -> TranslationDecision {
        analyze_translation_import(post, site_languages, offered, imported)
    }

    /// Make `language_code` (or the default language for `None`) current for
    /// language-sensitive content filters.
    async fn switch_to_language_context(
        &self,
        _store: &dyn PostStore,
        _language_code: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Adapter for sites without a translation tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTranslations;

#[async_trait]
impl TranslationTool for NoTranslations {
    fn tool_name(&self) -> &'static str {
        "none"
    }

    async fn get_language_codes(&self, _store: &dyn PostStore) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_post_language_info(
        &self,
        _store: &dyn PostStore,
        _post_id: PostId,
    ) -> Result<Option<PostLanguage>> {
        Ok(None)
    }

    async fn get_post_translations(
        &self,
        _store: &dyn PostStore,
        _post_id: PostId,
    ) -> Result<IndexMap<String, PostId>> {
        Ok(IndexMap::new())
    }

    async fn set_post_language(
        &self,
        _store: &dyn PostStore,
        _post_id: PostId,
        _language_code: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn set_translations_from_import(
        &self,
        _store: &dyn PostStore,
        _post_id: PostId,
        _language_code: &str,
        _original_siblings: &IndexMap<String, PostId>,
        _tool_args: &Value,
        _imported: &ResolutionTable,
    ) -> Result<()> {
        Ok(())
    }

    fn analyze_translation_import(
        &self,
        _post: &PreparedPost,
        _site_languages: &[String],
        _offered: &HashSet<PostId>,
        _imported: &ResolutionTable,
    ) -> TranslationDecision {
        TranslationDecision::NoLanguage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translated(id: PostId, code: &str) -> PreparedPost {
        let mut post_ids = IndexMap::new();
        post_ids.insert("en".to_string(), 1);
        post_ids.insert("de".to_string(), 2);
        post_ids.insert("fr".to_string(), 3);
        PreparedPost {
            id,
            post_type: "post".into(),
            language: Some(LanguageData {
                code: code.into(),
                tool: "meta".into(),
                post_ids,
                args: Value::Null,
            }),
            ..Default::default()
        }
    }

    fn langs(codes: &[&str]) -> Vec<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn no_language_data_imports_normally() {
        let post = PreparedPost::default();
        let decision =
            analyze_translation_import(&post, &langs(&["en"]), &HashSet::new(), &ResolutionTable::default());
        assert_eq!(decision, TranslationDecision::NoLanguage);
    }

    #[test]
    fn supported_language_imports() {
        let offered: HashSet<PostId> = [1, 2, 3].into_iter().collect();
        let decision = analyze_translation_import(
            &translated(1, "en"),
            &langs(&["en"]),
            &offered,
            &ResolutionTable::default(),
        );
        assert_eq!(decision, TranslationDecision::SupportedLanguage);
    }

    #[test]
    fn unsupported_language_defers_to_supported_sibling() {
        let offered: HashSet<PostId> = [1, 2, 3].into_iter().collect();
        let decision = analyze_translation_import(
            &translated(2, "de"),
            &langs(&["en"]),
            &offered,
            &ResolutionTable::default(),
        );
        assert_eq!(
            decision,
            TranslationDecision::SkipBetterTranslation { preferred: 1 }
        );
        assert!(!decision.should_import());
    }

    #[test]
    fn unsupported_language_reuses_imported_sibling_or_falls_back() {
        let offered: HashSet<PostId> = [2, 3].into_iter().collect();
        let site = langs(&["it"]);
        let mut table = ResolutionTable::default();
        assert_eq!(
            analyze_translation_import(&translated(2, "de"), &site, &offered, &table),
            TranslationDecision::ImportFallback
        );
        table.insert(2, 50);
        assert_eq!(
            analyze_translation_import(&translated(3, "fr"), &site, &offered, &table),
            TranslationDecision::ReuseImported {
                sibling: 2,
                destination: 50
            }
        );
    }

    #[test]
    fn supported_sibling_outside_the_batch_does_not_block_import() {
        let offered: HashSet<PostId> = [2].into_iter().collect();
        let decision = analyze_translation_import(
            &translated(2, "de"),
            &langs(&["en"]),
            &offered,
            &ResolutionTable::default(),
        );
        assert_eq!(decision, TranslationDecision::ImportFallback);
    }
}
