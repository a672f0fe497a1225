//! Translation adapter that keeps language state in post meta.
use super::{PostLanguage, TranslationTool};
use crate::model::{BlogId, PostId};
use crate::post::resolution::ResolutionTable;
use crate::store::{PostQuery, PostStore};
use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

pub const META_LANGUAGE: &str = "_contentsync_language";
pub const META_TRANSLATION_GROUP: &str = "_contentsync_translation_group";

#[derive(Debug, Default)]
pub struct MetaTranslations {
    languages: HashMap<BlogId, Vec<String>>,
    current: Mutex<Option<String>>,
}

impl MetaTranslations {
    pub fn new(languages: HashMap<BlogId, Vec<String>>) -> Self {
        Self {
            languages,
            current: Mutex::new(None),
        }
    }

    /// Language most recently made current through `switch_to_language_context`.
    pub fn current_language(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn group_of(&self, store: &dyn PostStore, post_id: PostId) -> Result<Option<String>> {
        Ok(store
            .get_post_meta(post_id, META_TRANSLATION_GROUP)
            .await?
            .into_iter()
            .find_map(|v| v.as_str().map(str::to_string))
            .filter(|g| !g.is_empty()))
    }
}

#[async_trait]
impl TranslationTool for MetaTranslations {
    fn tool_name(&self) -> &'static str {
        "meta"
    }

    async fn get_language_codes(&self, store: &dyn PostStore) -> Result<Vec<String>> {
        Ok(self
            .languages
            .get(&store.current_blog_id())
            .cloned()
            .unwrap_or_default())
    }

    async fn get_post_language_info(
        &self,
        store: &dyn PostStore,
        post_id: PostId,
    ) -> Result<Option<PostLanguage>> {
        let code = store
            .get_post_meta(post_id, META_LANGUAGE)
            .await?
            .into_iter()
            .find_map(|v| v.as_str().map(str::to_string))
            .filter(|c| !c.is_empty());
        let Some(code) = code else {
            return Ok(None);
        };
        Ok(Some(PostLanguage {
            code,
            group: self.group_of(store, post_id).await?,
        }))
    }

    async fn get_post_translations(
        &self,
        store: &dyn PostStore,
        post_id: PostId,
    ) -> Result<IndexMap<String, PostId>> {
        let mut translations = IndexMap::new();
        let Some(info) = self.get_post_language_info(store, post_id).await? else {
            return Ok(translations);
        };
        translations.insert(info.code.clone(), post_id);
        let Some(group) = info.group else {
            return Ok(translations);
        };
        let members = store
            .find_posts(&PostQuery::by_meta(
                META_TRANSLATION_GROUP,
                Value::String(group),
            ))
            .await?;
        for member in members.into_iter().filter(|p| p.id != post_id) {
            if let Some(lang) = self.get_post_language_info(store, member.id).await? {
                translations.entry(lang.code).or_insert(member.id);
            }
        }
        Ok(translations)
    }

    async fn set_post_language(
        &self,
        store: &dyn PostStore,
        post_id: PostId,
        language_code: &str,
    ) -> Result<()> {
        store
            .update_post_meta(
                post_id,
                META_LANGUAGE,
                &Value::String(language_code.to_string()),
                None,
            )
            .await
    }

    async fn set_translations_from_import(
        &self,
        store: &dyn PostStore,
        post_id: PostId,
        language_code: &str,
        original_siblings: &IndexMap<String, PostId>,
        _tool_args: &Value,
        imported: &ResolutionTable,
    ) -> Result<()> {
        self.set_post_language(store, post_id, language_code).await?;

        let mut group = self.group_of(store, post_id).await?;
        if group.is_none() {
            for (_, origin_sibling) in original_siblings {
                let Some(sibling) = imported.get(*origin_sibling) else {
                    continue;
                };
                if sibling == post_id {
                    continue;
                }
                if let Some(existing) = self.group_of(store, sibling).await? {
                    group = Some(existing);
                    break;
                }
            }
        }
        let group = match group {
            Some(group) => group,
            None => {
                let minted = uuid::Uuid::new_v4().to_string();
                debug!(post_id, group = %minted, "new translation group");
                minted
            }
        };
        store
            .update_post_meta(post_id, META_TRANSLATION_GROUP, &Value::String(group), None)
            .await
    }

    async fn switch_to_language_context(
        &self,
        _store: &dyn PostStore,
        language_code: Option<&str>,
    ) -> Result<()> {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = language_code.map(str::to_string);
        Ok(())
    }
}
