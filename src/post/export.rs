//! Post export: turn stored posts into [`PreparedPost`]s together with the
//! posts they depend on.
use super::prepared::{
    MediaInfo, MetaMap, PostHierarchy, PostRef, PreparedPost, PreparedPosts, TermDescriptor, TermRef,
};
use super::references;
use crate::model::{
    ExportOptions, PostId, META_ATTACHED_FILE, META_DYNAMIC_POST_TYPE, META_DYNAMIC_TAXONOMY,
    POST_TYPE_ATTACHMENT,
};
use crate::store::{Post, PostQuery, PostStore, SiteInfo, Term};
use crate::translation::TranslationTool;
use anyhow::Result;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, instrument, warn};

/// Parent chains deeper than this are cut off.
const MAX_TERM_DEPTH: usize = 16;

/// Exports posts from the current blog. The processed set lives as long as
/// the exporter, so one exporter never exports the same post twice.
pub struct Exporter<'a> {
    store: &'a dyn PostStore,
    translations: &'a dyn TranslationTool,
    options: ExportOptions,
    processed: HashSet<PostId>,
}

impl<'a> Exporter<'a> {
    pub fn new(
        store: &'a dyn PostStore,
        translations: &'a dyn TranslationTool,
        options: ExportOptions,
    ) -> Self {
        Self {
            store,
            translations,
            options,
            processed: HashSet::new(),
        }
    }

    /// Export `post_ids` and everything they pull in. Missing posts are
    /// logged and left out.
    #[instrument(skip_all, fields(blog_id = self.store.current_blog_id()))]
    pub async fn export_posts(&mut self, post_ids: &[PostId]) -> Result<PreparedPosts> {
        let site = self.store.site_info().await?;
        let mut queue: VecDeque<PostId> = post_ids.iter().copied().collect();
        let mut prepared = PreparedPosts::new();

        while let Some(post_id) = queue.pop_front() {
            if !self.processed.insert(post_id) {
                continue;
            }
            let Some(post) = self.store.get_post(post_id).await? else {
                warn!(post_id, "post not found; skipped from export");
                continue;
            };
            let item = self.prepare(post, &site).await?;

            if let Some(thumbnail) = item.thumbnail_id() {
                queue.push_back(thumbnail);
            }
            if self.options.append_nested {
                queue.extend(item.nested.keys().copied());
            }
            if self.options.translations {
                if let Some(language) = &item.language {
                    queue.extend(language.post_ids.values().copied());
                }
            }
            if self.options.whole_posttype {
                if let Some(post_type) = item.first_meta_str(META_DYNAMIC_POST_TYPE) {
                    let instances = self
                        .store
                        .find_posts(&PostQuery::default().of_type(post_type))
                        .await?;
                    debug!(post_id, post_type, count = instances.len(), "exporting whole post type");
                    queue.extend(instances.into_iter().map(|p| p.id));
                }
            }
            prepared.insert(post_id, item);
        }
        Ok(prepared)
    }

    /// Export a single post with its dependencies; `None` when it does not exist.
    pub async fn export_post(&mut self, post_id: PostId) -> Result<Option<PreparedPost>> {
        let mut posts = self.export_posts(&[post_id]).await?;
        Ok(posts.shift_remove(&post_id))
    }

    async fn prepare(&self, post: Post, site: &SiteInfo) -> Result<PreparedPost> {
        let store = self.store;
        let post_id = post.id;

        let mut meta = MetaMap::new();
        for (key, value) in store.get_all_post_meta(post_id).await? {
            meta.entry(key).or_default().push(value);
        }

        let source = if self.options.resolve_menus {
            references::resolve_menu_links(&post.post_content)
        } else {
            post.post_content.clone()
        };
        let candidates = references::scan(&source, &site.home_url);

        let mut nested = indexmap::IndexMap::new();
        for id in candidates.posts {
            if id == post_id {
                continue;
            }
            match store.get_post(id).await? {
                Some(target) => {
                    let url = if target.post_type == POST_TYPE_ATTACHMENT {
                        store.attachment_url(id).await?
                    } else {
                        None
                    };
                    nested.insert(
                        id,
                        PostRef {
                            id,
                            name: target.post_name,
                            post_type: target.post_type,
                            url,
                        },
                    );
                }
                None => debug!(post_id, nested = id, "reference to missing post left as is"),
            }
        }
        let mut nested_terms = indexmap::IndexMap::new();
        for id in candidates.terms {
            if let Some(term) = store.get_term(id).await? {
                nested_terms.insert(
                    id,
                    TermRef {
                        id,
                        name: term.slug,
                        taxonomy: term.taxonomy,
                    },
                );
            }
        }
        let known_posts: HashSet<PostId> = nested.keys().copied().collect();
        let known_terms = nested_terms.keys().copied().collect();
        let post_content = references::apply_markers(
            &source,
            &site.home_url,
            &site.upload_url,
            &known_posts,
            &known_terms,
        );

        let mut terms = indexmap::IndexMap::new();
        for taxonomy in store.get_post_taxonomies(post_id).await? {
            let mut descriptors = Vec::new();
            for term in store.get_object_terms(post_id, &taxonomy).await? {
                descriptors.push(self.describe_term(term).await?);
            }
            terms.insert(taxonomy, descriptors);
        }
        if self.options.all_terms {
            let defined = meta
                .get(META_DYNAMIC_TAXONOMY)
                .and_then(|values| values.first())
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if let Some(taxonomy) = defined {
                let mut descriptors = Vec::new();
                for term in store.get_terms(&taxonomy).await? {
                    descriptors.push(self.describe_term(term).await?);
                }
                terms.insert(taxonomy, descriptors);
            }
        }

        let media = if post.post_type == POST_TYPE_ATTACHMENT {
            self.media_info(post_id, &meta).await?
        } else {
            None
        };

        let post_hierarchy = self.hierarchy(&post).await?;
        let language = self
            .translations
            .prepare_post_language_data(store, post_id)
            .await?;

        Ok(PreparedPost {
            id: post_id,
            blog_id: site.blog_id,
            post_type: post.post_type,
            post_title: post.post_title,
            post_name: post.post_name,
            post_content,
            post_excerpt: post.post_excerpt,
            post_status: post.post_status,
            post_date: post.post_date,
            post_date_gmt: post.post_date_gmt,
            post_author: post.post_author,
            post_parent: post.post_parent,
            post_mime_type: post.post_mime_type,
            meta,
            terms,
            nested,
            nested_terms,
            media,
            post_hierarchy,
            language,
            ..Default::default()
        })
    }

    async fn describe_term(&self, term: Term) -> Result<TermDescriptor> {
        let mut chain = vec![term];
        while chain.len() < MAX_TERM_DEPTH {
            let parent_id = chain.last().map(|t| t.parent).unwrap_or_default();
            if parent_id == 0 {
                break;
            }
            match self.store.get_term(parent_id).await? {
                Some(parent) => chain.push(parent),
                None => break,
            }
        }
        let mut descriptor: Option<TermDescriptor> = None;
        for term in chain.into_iter().rev() {
            descriptor = Some(TermDescriptor {
                slug: term.slug,
                name: term.name,
                description: term.description,
                parent: descriptor.map(Box::new),
            });
        }
        descriptor.ok_or_else(|| anyhow::anyhow!("empty term chain"))
    }

    async fn media_info(&self, post_id: PostId, meta: &MetaMap) -> Result<Option<MediaInfo>> {
        let relative = meta
            .get(META_ATTACHED_FILE)
            .and_then(|values| values.first())
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let (Some(relative), Some(path)) =
            (relative, self.store.attached_file_path(post_id).await?)
        else {
            warn!(post_id, "attachment has no file");
            return Ok(None);
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Some(MediaInfo {
            name,
            path: path.to_string_lossy().into_owned(),
            url: self
                .store
                .attachment_url(post_id)
                .await?
                .unwrap_or_default(),
            relative_path: relative,
        }))
    }

    async fn hierarchy(&self, post: &Post) -> Result<Option<PostHierarchy>> {
        let parent = if post.post_parent > 0 {
            self.store
                .get_post(post.post_parent)
                .await?
                .map(|p| PostRef {
                    id: p.id,
                    name: p.post_name,
                    post_type: p.post_type,
                    url: None,
                })
        } else {
            None
        };
        let children: Vec<PostRef> = self
            .store
            .find_posts(&PostQuery::default().with_parent(post.id).of_type(&post.post_type))
            .await?
            .into_iter()
            .map(|p| PostRef {
                id: p.id,
                name: p.post_name,
                post_type: p.post_type,
                url: None,
            })
            .collect();
        if parent.is_none() && children.is_empty() {
            return Ok(None);
        }
        Ok(Some(PostHierarchy { parent, children }))
    }
}

/// Export a single post with its dependencies. See [`Exporter`].
pub async fn export_post(
    store: &dyn PostStore,
    translations: &dyn TranslationTool,
    post_id: PostId,
    options: ExportOptions,
) -> Result<Option<PreparedPost>> {
    Exporter::new(store, translations, options)
        .export_post(post_id)
        .await
}

pub async fn export_posts(
    store: &dyn PostStore,
    translations: &dyn TranslationTool,
    post_ids: &[PostId],
    options: ExportOptions,
) -> Result<PreparedPosts> {
    Exporter::new(store, translations, options)
        .export_posts(post_ids)
        .await
}
