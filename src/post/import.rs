//! Two-pass post import.
//!
//! Pass one gives every incoming post a destination ID and fills the
//! [`ResolutionTable`]. Pass two reads the finished table to rewrite content
//! and restore hierarchy, meta, terms, translations and thumbnails.
use super::conflict::{find_existing_post, sync_state};
use super::markers::{self, Marker};
use super::media::{self, MediaSource};
use super::prepared::{PreparedPost, PreparedPosts, TermDescriptor};
use super::resolution::ResolutionTable;
use crate::connection::{add_connection, describe_connection, ConnectionTarget};
use crate::error::SyncError;
use crate::hooks::{is_blacklisted_meta, is_sync_status_key, Hooks};
use crate::model::{
    ConflictAction, ImportAction, PostId, SyncStatus, TermId, META_DYNAMIC_TAXONOMY,
    META_THUMBNAIL_ID, POST_TYPE_ATTACHMENT,
};
use crate::store::{Post, PostFields, PostQuery, PostStore, SiteInfo, TermArgs};
use crate::translation::{TranslationDecision, TranslationTool};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument, warn};

/// Caller's choice for one incoming post, keyed by its origin ID.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictDecision {
    #[serde(default)]
    pub existing_post_id: Option<PostId>,
    #[serde(default)]
    pub conflict_action: Option<ConflictAction>,
}

pub type ConflictDecisions = HashMap<PostId, ConflictDecision>;

/// State built during pass one.
#[derive(Default)]
struct FirstPass {
    table: ResolutionTable,
    /// Preferred sibling origin ID to the skipped translations waiting on it.
    waiting: HashMap<PostId, Vec<PostId>>,
    /// Origin IDs that got a post written and go through pass two.
    written: Vec<PostId>,
    /// Old uploads-relative path to new one.
    relocations: Vec<(String, String)>,
}

impl FirstPass {
    fn resolve(&mut self, origin: PostId, destination: PostId) {
        self.table.insert(origin, destination);
        if let Some(siblings) = self.waiting.remove(&origin) {
            for sibling in siblings {
                self.table.insert(sibling, destination);
            }
        }
    }
}

pub struct Importer<'a> {
    store: &'a dyn PostStore,
    translations: &'a dyn TranslationTool,
    hooks: &'a Hooks,
    media: MediaSource,
}

impl<'a> Importer<'a> {
    pub fn new(store: &'a dyn PostStore, translations: &'a dyn TranslationTool, hooks: &'a Hooks) -> Self {
        Self {
            store,
            translations,
            hooks,
            media: MediaSource::Local,
        }
    }

    pub fn with_media(mut self, media: MediaSource) -> Self {
        self.media = media;
        self
    }

    /// Import `posts` into the current blog and return origin ID to
    /// destination ID for every post that resolved.
    ///
    /// A failure writing any single post aborts the call; posts written
    /// before it stay.
    #[instrument(skip_all, fields(blog_id = self.store.current_blog_id(), posts = posts.len()))]
    pub async fn import_posts(
        &self,
        posts: &PreparedPosts,
        decisions: &ConflictDecisions,
    ) -> Result<ResolutionTable> {
        let site = self.store.site_info().await?;
        let pass = self.first_pass(posts, decisions, &site).await?;

        for &origin_id in &pass.written {
            let Some(post) = posts.get(&origin_id) else { continue };
            let Some(destination) = pass.table.get(origin_id) else { continue };
            self.second_pass(post, destination, &pass.table, &pass.relocations, &site)
                .await
                .map_err(|err| SyncError::Import {
                    post_id: origin_id,
                    message: format!("{err:#}"),
                })?;
        }
        self.translations
            .switch_to_language_context(self.store, None)
            .await?;
        self.media.cleanup().await?;

        info!(resolved = pass.table.len(), "import finished");
        Ok(pass.table)
    }

    async fn first_pass(
        &self,
        posts: &PreparedPosts,
        decisions: &ConflictDecisions,
        site: &SiteInfo,
    ) -> Result<FirstPass> {
        let store = self.store;
        let languages = self.translations.get_language_codes(store).await?;
        let offered: HashSet<PostId> = posts.keys().copied().collect();
        let mut pass = FirstPass::default();

        for (&origin_id, post) in posts {
            // Translation gating.
            let decision =
                self.translations
                    .analyze_translation_import(post, &languages, &offered, &pass.table);
            match decision {
                TranslationDecision::SkipBetterTranslation { preferred } => {
                    debug!(origin_id, preferred, "better translation offered; skipped");
                    self.trash_wrong_language_copy(post).await?;
                    match pass.table.get(preferred) {
                        Some(destination) => pass.table.insert(origin_id, destination),
                        None => pass.waiting.entry(preferred).or_default().push(origin_id),
                    }
                    continue;
                }
                TranslationDecision::ReuseImported { destination, .. } => {
                    debug!(origin_id, destination, "reusing imported translation");
                    pass.resolve(origin_id, destination);
                    continue;
                }
                _ => {}
            }

            // Conflict target.
            let explicit = decisions.get(&origin_id);
            let existing = match explicit {
                Some(decision) => match decision.existing_post_id {
                    Some(id) => match store.get_post(id).await? {
                        Some(post) => Some(post),
                        None => find_existing_post(store, post).await?,
                    },
                    None => None,
                },
                None => find_existing_post(store, post).await?,
            };

            let mut conflict_action = explicit
                .and_then(|d| d.conflict_action)
                .or(post.conflict_action)
                .unwrap_or_default();
            if post.is_contentsync_root_post {
                conflict_action = ConflictAction::Replace;
            }
            if let (Some(existing), Some(gid)) = (&existing, post.gid()) {
                let (existing_gid, status) = sync_state(store, existing).await?;
                if status == Some(SyncStatus::Root) && existing_gid == Some(gid.to_string()) {
                    warn!(origin_id, existing = existing.id, %gid, "already a post referencing the same global ID");
                    conflict_action = ConflictAction::Skip;
                }
            }

            // Import action.
            let import_action = post.import_action.unwrap_or_default();
            match import_action {
                ImportAction::Trash | ImportAction::Delete => {
                    if let Some(existing) = &existing {
                        let force = import_action == ImportAction::Delete;
                        store.delete_post(existing.id, force).await?;
                        info!(origin_id, existing = existing.id, action = import_action.as_str(), "existing post removed");
                    }
                    continue;
                }
                ImportAction::Draft | ImportAction::Insert => {}
            }

            // Conflict action.
            let target = match (&existing, conflict_action) {
                (Some(existing), ConflictAction::Skip) => {
                    if post.is_attachment() {
                        self.restore_missing_file(post, existing, site).await?;
                    }
                    pass.resolve(origin_id, existing.id);
                    continue;
                }
                (Some(existing), ConflictAction::Replace) => Some(existing.id),
                _ => None,
            };

            let mut fields = PostFields {
                id: target,
                post_type: post.post_type.clone(),
                post_title: post.post_title.clone(),
                post_name: post.post_name.clone(),
                post_content: post.post_content.clone(),
                post_excerpt: post.post_excerpt.clone(),
                post_status: post.post_status.clone(),
                post_date: post.post_date.clone(),
                post_date_gmt: post.post_date_gmt.clone(),
                post_author: post.post_author,
                // Restored in pass two once every post has an ID.
                post_parent: match (&existing, target) {
                    (Some(existing), Some(_)) => existing.post_parent,
                    _ => 0,
                },
                post_mime_type: post.post_mime_type.clone(),
            };
            if import_action == ImportAction::Draft {
                fields.post_status = "draft".to_string();
            }

            let written = if post.is_attachment() {
                self.write_attachment(post, &fields, site, &mut pass.relocations)
                    .await
            } else {
                store.insert_or_update_post(&fields).await
            };
            let destination = written.map_err(|err| SyncError::Import {
                post_id: origin_id,
                message: format!("{err:#}"),
            })?;
            debug!(origin_id, destination, replaced = target.is_some(), "post written");
            pass.resolve(origin_id, destination);

            if let Some(code) = post.language_code() {
                self.translations
                    .set_post_language(store, destination, code)
                    .await?;
            }
            pass.written.push(origin_id);
        }
        for (preferred, siblings) in &pass.waiting {
            warn!(
                preferred,
                ?siblings,
                "preferred translation was removed instead of imported; skipped translations stay unresolved"
            );
        }
        Ok(pass)
    }

    /// Trash a copy of this very post that was imported earlier in a language
    /// the site does not support.
    async fn trash_wrong_language_copy(&self, post: &PreparedPost) -> Result<()> {
        let Some(gid) = post.gid() else { return Ok(()) };
        let Some(code) = post.language_code() else { return Ok(()) };
        let copies = self
            .store
            .find_posts(
                &PostQuery::by_meta(crate::model::META_SYNCED_POST_ID, Value::String(gid.to_string()))
                    .of_type(&post.post_type),
            )
            .await?;
        for copy in copies {
            let language = self
                .translations
                .get_post_language_info(self.store, copy.id)
                .await?;
            if language.map(|l| l.code) == Some(code.to_string()) {
                self.store.delete_post(copy.id, false).await?;
                info!(post_id = copy.id, language = code, "trashed copy in unsupported language");
            }
        }
        Ok(())
    }

    async fn write_attachment(
        &self,
        post: &PreparedPost,
        fields: &PostFields,
        site: &SiteInfo,
        relocations: &mut Vec<(String, String)>,
    ) -> Result<PostId> {
        let Some(info) = &post.media else {
            warn!(post_id = post.id, "attachment without media info; importing record only");
            return self.store.insert_or_update_post(fields).await;
        };
        if let Some(existing_id) = fields.id {
            if let Some(old_file) = self.store.attached_file_path(existing_id).await? {
                media::remove_if_exists(&old_file).await?;
            }
        }
        let relative = media::upload_relative_path(post, info);
        let dest = site.upload_dir.join(&relative);
        self.media.fetch(info, &dest).await?;
        let id = self.store.insert_attachment(fields, &dest).await?;
        if !info.relative_path.is_empty() && info.relative_path != relative {
            relocations.push((info.relative_path.clone(), relative));
        }
        Ok(id)
    }

    /// Skip keeps the existing attachment, but puts its file back when it is
    /// missing on disk.
    async fn restore_missing_file(&self, post: &PreparedPost, existing: &Post, site: &SiteInfo) -> Result<()> {
        let Some(info) = &post.media else { return Ok(()) };
        let current = self.store.attached_file_path(existing.id).await?;
        if let Some(path) = &current {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Ok(());
            }
        }
        let dest = current.unwrap_or_else(|| site.upload_dir.join(media::upload_relative_path(post, info)));
        self.media.fetch(info, &dest).await?;
        self.store
            .insert_attachment(&PostFields::from(existing), &dest)
            .await?;
        info!(post_id = existing.id, "missing attachment file restored");
        Ok(())
    }

    async fn second_pass(
        &self,
        post: &PreparedPost,
        destination: PostId,
        table: &ResolutionTable,
        relocations: &[(String, String)],
        site: &SiteInfo,
    ) -> Result<()> {
        let store = self.store;
        self.translations
            .switch_to_language_context(store, post.language_code())
            .await?;

        let Some(stored) = store.get_post(destination).await? else {
            anyhow::bail!("post {} vanished after insert", destination);
        };
        let mut fields = PostFields::from(&stored);
        fields.post_content = self.rewrite_content(post, table, relocations, site).await?;
        if let Some(parent) = self.resolve_parent(post, table).await? {
            fields.post_parent = parent;
        }
        if fields != PostFields::from(&stored) {
            store.insert_or_update_post(&fields).await?;
        }

        self.adopt_children(post, destination, table).await?;
        self.apply_meta(post, destination).await?;
        self.apply_terms(post, destination).await?;

        if let Some(language) = &post.language {
            self.translations
                .set_translations_from_import(
                    store,
                    destination,
                    &language.code,
                    &language.post_ids,
                    &language.args,
                    table,
                )
                .await?;
        }

        if let Some(thumbnail) = post.thumbnail_id() {
            match table.get(thumbnail) {
                Some(mapped) => {
                    store
                        .update_post_meta(destination, META_THUMBNAIL_ID, &json!(mapped), None)
                        .await?
                }
                None => debug!(post_id = post.id, thumbnail, "thumbnail not imported"),
            }
        }

        self.record_connection(post, destination, site).await
    }

    /// Resolve every marker in the content against the finished table.
    async fn rewrite_content(
        &self,
        post: &PreparedPost,
        table: &ResolutionTable,
        relocations: &[(String, String)],
        site: &SiteInfo,
    ) -> Result<String> {
        let sites = markers::parse(&post.post_content);
        let replacements: HashMap<String, String> = self
            .hooks
            .import
            .string_replacements(site)
            .into_iter()
            .collect();

        let mut resolved: HashMap<Marker, Option<String>> = HashMap::new();
        for site_ref in &sites {
            if resolved.contains_key(&site_ref.marker) {
                continue;
            }
            let value = match &site_ref.marker {
                Marker::PostId(id) => self.resolve_post_reference(post, *id, table).await?,
                Marker::PostUrl(id) => self.resolve_post_url(post, *id, table, site).await?,
                Marker::TermId(id) => self.resolve_term_reference(post, *id).await?,
                Marker::Placeholder(name) => replacements.get(name).cloned(),
            };
            if value.is_none() {
                debug!(post_id = post.id, marker = ?site_ref.marker, "marker left unresolved");
            }
            resolved.insert(site_ref.marker.clone(), value);
        }

        let mut content = markers::rewrite(&post.post_content, &sites, |marker| {
            resolved.get(marker).cloned().flatten()
        });
        for (old, new) in relocations {
            content = content.replace(old.as_str(), new.as_str());
        }
        Ok(content)
    }

    /// Destination ID for a nested post: imported this run, then an existing
    /// post with the same slug and type, then the file URL of an attachment,
    /// then the bare origin slug.
    async fn resolve_post_reference(
        &self,
        post: &PreparedPost,
        origin: PostId,
        table: &ResolutionTable,
    ) -> Result<Option<String>> {
        if let Some(destination) = table.get(origin) {
            return Ok(Some(destination.to_string()));
        }
        let Some(nested) = post.nested.get(&origin) else {
            return Ok(None);
        };
        let found = self
            .store
            .find_posts(&PostQuery::by_name(&nested.name, &nested.post_type).first())
            .await?;
        if let Some(existing) = found.first() {
            return Ok(Some(existing.id.to_string()));
        }
        if nested.post_type == POST_TYPE_ATTACHMENT {
            if let Some(url) = nested.url.as_ref().filter(|url| !url.is_empty()) {
                return Ok(Some(url.clone()));
            }
        }
        if nested.name.is_empty() {
            return Ok(None);
        }
        Ok(Some(nested.name.clone()))
    }

    async fn resolve_post_url(
        &self,
        post: &PreparedPost,
        origin: PostId,
        table: &ResolutionTable,
        site: &SiteInfo,
    ) -> Result<Option<String>> {
        let destination = match table.get(origin) {
            Some(id) => Some(id),
            None => match post.nested.get(&origin) {
                Some(nested) => self
                    .store
                    .find_posts(&PostQuery::by_name(&nested.name, &nested.post_type).first())
                    .await?
                    .first()
                    .map(|p| p.id),
                None => None,
            },
        };
        if let Some(id) = destination {
            return self.store.get_permalink(id).await;
        }
        Ok(post
            .nested
            .get(&origin)
            .filter(|nested| !nested.name.is_empty())
            .map(|nested| format!("{}/{}/", site.home_url.trim_end_matches('/'), nested.name)))
    }

    async fn resolve_term_reference(&self, post: &PreparedPost, origin: TermId) -> Result<Option<String>> {
        let Some(term) = post.nested_terms.get(&origin) else {
            return Ok(None);
        };
        let id = match self.store.get_term_by_slug(&term.name, &term.taxonomy).await? {
            Some(existing) => existing.term_id,
            None => {
                self.store
                    .insert_term(
                        &term.taxonomy,
                        &TermArgs {
                            slug: term.name.clone(),
                            name: term.name.clone(),
                            ..Default::default()
                        },
                    )
                    .await?
            }
        };
        Ok(Some(id.to_string()))
    }

    /// Destination parent ID, or `None` when the incoming post carries no
    /// parent or the parent cannot be found here; the stored parent then stays.
    async fn resolve_parent(&self, post: &PreparedPost, table: &ResolutionTable) -> Result<Option<PostId>> {
        let Some(hierarchy) = &post.post_hierarchy else {
            if post.post_parent > 0 {
                return Ok(table.get(post.post_parent));
            }
            return Ok(None);
        };
        let Some(parent) = &hierarchy.parent else {
            return Ok(None);
        };
        if let Some(id) = table.get(parent.id) {
            return Ok(Some(id));
        }
        let found = self
            .store
            .find_posts(
                &PostQuery::by_name(&parent.name, &parent.post_type)
                    .published()
                    .first(),
            )
            .await?;
        if found.is_empty() {
            debug!(post_id = post.id, parent = %parent.name, "parent not found; keeping stored parent");
        }
        Ok(found.first().map(|p| p.id))
    }

    /// Re-parent recorded children. Lookups by slug only consider posts
    /// without a parent of their own.
    async fn adopt_children(&self, post: &PreparedPost, destination: PostId, table: &ResolutionTable) -> Result<()> {
        let Some(hierarchy) = &post.post_hierarchy else {
            return Ok(());
        };
        for child in &hierarchy.children {
            let child_id = match table.get(child.id) {
                Some(id) => Some(id),
                None => self
                    .store
                    .find_posts(
                        &PostQuery::by_name(&child.name, &child.post_type)
                            .published()
                            .with_parent(0)
                            .first(),
                    )
                    .await?
                    .first()
                    .map(|p| p.id),
            };
            let Some(child_id) = child_id.filter(|id| *id != destination) else {
                continue;
            };
            let Some(stored) = self.store.get_post(child_id).await? else {
                continue;
            };
            if stored.post_parent != destination {
                let mut fields = PostFields::from(&stored);
                fields.post_parent = destination;
                self.store.insert_or_update_post(&fields).await?;
            }
        }
        Ok(())
    }

    async fn apply_meta(&self, post: &PreparedPost, destination: PostId) -> Result<()> {
        for (key, values) in &post.meta {
            if is_blacklisted_meta(key) || self.hooks.import.skip_meta_key(post, key) {
                continue;
            }
            let existing = self.store.get_post_meta(destination, key).await?;
            for (slot, value) in values.iter().enumerate() {
                let value = if is_sync_status_key(key) && value.as_str() == Some(SyncStatus::Root.as_str()) {
                    Value::String(SyncStatus::Linked.as_str().to_string())
                } else {
                    value.clone()
                };
                match existing.get(slot) {
                    Some(prev) if *prev == value => {}
                    Some(prev) => {
                        self.store
                            .update_post_meta(destination, key, &value, Some(prev))
                            .await?
                    }
                    None => self.store.add_post_meta(destination, key, &value).await?,
                }
            }
        }
        Ok(())
    }

    async fn apply_terms(&self, post: &PreparedPost, destination: PostId) -> Result<()> {
        if let Some(taxonomy) = post.first_meta_str(META_DYNAMIC_TAXONOMY) {
            self.store.register_taxonomy(taxonomy, &[]).await?;
            for descriptor in post.terms.get(taxonomy).into_iter().flatten() {
                self.ensure_term(taxonomy, descriptor).await?;
            }
            debug!(post_id = post.id, taxonomy, "dynamic taxonomy registered");
            return Ok(());
        }

        for (taxonomy, descriptors) in &post.terms {
            if self.hooks.import.skip_taxonomy(post, taxonomy) {
                continue;
            }
            let descriptors = self
                .hooks
                .import
                .filter_terms(post, taxonomy, descriptors.clone());
            let mut ids = Vec::with_capacity(descriptors.len());
            for descriptor in &descriptors {
                ids.push(self.ensure_term(taxonomy, descriptor).await?);
            }
            self.store
                .set_object_terms(destination, taxonomy, &ids)
                .await?;
        }
        Ok(())
    }

    /// Find or create a term by slug, creating missing ancestors first.
    async fn ensure_term(&self, taxonomy: &str, descriptor: &TermDescriptor) -> Result<TermId> {
        let mut chain = vec![descriptor];
        let mut cursor = descriptor;
        while let Some(parent) = cursor.parent.as_deref() {
            chain.push(parent);
            cursor = parent;
        }

        let mut parent_id = 0;
        for term in chain.into_iter().rev() {
            parent_id = match self.store.get_term_by_slug(&term.slug, taxonomy).await? {
                Some(existing) => existing.term_id,
                None => {
                    self.store
                        .insert_term(
                            taxonomy,
                            &TermArgs {
                                slug: term.slug.clone(),
                                name: term.name.clone(),
                                description: term.description.clone(),
                                parent: parent_id,
                            },
                        )
                        .await?
                }
            };
        }
        Ok(parent_id)
    }

    /// Linked copies of a root on this network get an entry in the root's
    /// connection map.
    async fn record_connection(&self, post: &PreparedPost, destination: PostId, site: &SiteInfo) -> Result<()> {
        let Some(gid) = post.gid() else { return Ok(()) };
        if !gid.is_on_network(&site.network_url) || gid.blog_id == site.blog_id {
            return Ok(());
        }
        let connection = describe_connection(self.store, destination).await?;
        add_connection(self.store, &gid, ConnectionTarget::Local(site.blog_id), connection).await
    }
}
