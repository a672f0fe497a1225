//! Distribution: preparing posts, queueing one item per destination, and
//! running queued items.
use crate::connection::{
    add_connection, get_connection_map, remove_connection, Connection, ConnectionTarget,
};
use crate::db::{self, DistributionItem, NewDistributionItem};
use crate::destination::{
    get_destinations, BlogDestination, Destination, DestinationOverrides, PostResult, RemoteDestination,
};
use crate::error::{BatchErrors, SyncError};
use crate::gid::{normalize_network_url, GlobalId};
use crate::hooks::Hooks;
use crate::model::{
    BlogId, ConflictAction, ExportOptions, ImportAction, ItemStatus, PostId, SyncStatus,
    META_CANONICAL_URL, META_CONNECTION_MAP, META_EXPORT_OPTIONS, META_SYNCED_POST_ID,
    META_SYNCED_POST_STATUS,
};
use crate::post::{
    ConflictDecision, ConflictDecisions, Exporter, Importer, MediaSource, PreparedPosts,
};
use crate::queue::{
    distribute_item_args, status_report_args, Scheduler, TASK_APPLY_STATUS_REPORT, TASK_DISTRIBUTE_ITEM,
};
use crate::remote::{remote_response_error, RemoteDistribution, RemoteTransport, StatusReport};
use crate::store::{BlogSwitch, PostQuery, PostStore};
use crate::translation::{NoTranslations, TranslationTool};
use anyhow::Result;
use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// A post to distribute: a bare ID, or an ID with per-post directives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DistributionInput {
    Id(PostId),
    Post(PostDirective),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PostDirective {
    #[serde(rename = "ID")]
    pub id: PostId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_action: Option<ImportAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_action: Option<ConflictAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_arguments: Option<ExportOptions>,
}

impl DistributionInput {
    pub fn id(&self) -> PostId {
        match self {
            DistributionInput::Id(id) => *id,
            DistributionInput::Post(post) => post.id,
        }
    }
}

impl From<PostId> for DistributionInput {
    fn from(id: PostId) -> Self {
        DistributionInput::Id(id)
    }
}

#[derive(Debug, Clone)]
pub struct DistributorSettings {
    /// Posts per chunk for large batches.
    pub chunk_size: usize,
    pub retention_days: i64,
    /// Report terminal status back to the network an item came from.
    pub report_remote_completion: bool,
}

impl Default for DistributorSettings {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            retention_days: 3,
            report_remote_completion: true,
        }
    }
}

pub struct Distributor {
    pool: SqlitePool,
    store: Arc<dyn PostStore>,
    translations: Arc<dyn TranslationTool>,
    hooks: Hooks,
    scheduler: Arc<dyn Scheduler>,
    remote: Arc<dyn RemoteTransport>,
    settings: DistributorSettings,
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Distributor {
    pub fn new(
        pool: SqlitePool,
        store: Arc<dyn PostStore>,
        scheduler: Arc<dyn Scheduler>,
        remote: Arc<dyn RemoteTransport>,
    ) -> Self {
        Self {
            pool,
            store,
            translations: Arc::new(NoTranslations),
            hooks: Hooks::default(),
            scheduler,
            remote,
            settings: DistributorSettings::default(),
        }
    }

    pub fn with_translations(mut self, translations: Arc<dyn TranslationTool>) -> Self {
        self.translations = translations;
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_settings(mut self, settings: DistributorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &dyn PostStore {
        self.store.as_ref()
    }

    pub fn translations(&self) -> &dyn TranslationTool {
        self.translations.as_ref()
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn settings(&self) -> &DistributorSettings {
        &self.settings
    }

    /// Export `inputs` from the current blog and stamp distribution defaults
    /// on the result.
    #[instrument(skip_all, fields(blog_id = self.store.current_blog_id(), root_post_id = ?root_post_id))]
    pub async fn prepare_posts_for_distribution(
        &self,
        inputs: &[DistributionInput],
        export: &ExportOptions,
        root_post_id: Option<PostId>,
    ) -> Result<PreparedPosts> {
        if inputs.is_empty() {
            return Err(SyncError::Validation("no posts to distribute".into()).into());
        }
        if let Some(bad) = inputs.iter().find(|input| input.id() <= 0) {
            return Err(SyncError::Validation(format!("invalid post ID {}", bad.id())).into());
        }

        let store = self.store.as_ref();
        let blog_id = store.current_blog_id();
        let ids: Vec<PostId> = inputs.iter().map(DistributionInput::id).collect();
        let mut posts = Exporter::new(store, self.translations.as_ref(), export.clone())
            .export_posts(&ids)
            .await?;

        for (origin_id, post) in posts.iter_mut() {
            if post.gid().is_none() {
                post.set_gid(&GlobalId::local(blog_id, *origin_id), SyncStatus::Linked);
            }
            post.conflict_action = Some(ConflictAction::Replace);
            if Some(*origin_id) == root_post_id {
                post.is_contentsync_root_post = true;
                if post.first_meta_str(META_CANONICAL_URL).is_none() {
                    if let Some(url) = store.get_permalink(*origin_id).await? {
                        post.set_meta(META_CANONICAL_URL, Value::String(url));
                    }
                }
            }
        }
        for input in inputs {
            let DistributionInput::Post(directive) = input else {
                continue;
            };
            if let Some(post) = posts.get_mut(&directive.id) {
                if directive.import_action.is_some() {
                    post.import_action = directive.import_action;
                }
                if directive.conflict_action.is_some() {
                    post.conflict_action = directive.conflict_action;
                }
                if directive.export_arguments.is_some() {
                    post.export_arguments = directive.export_arguments.clone();
                }
            }
        }
        Ok(self
            .hooks
            .distribution
            .filter_prepared_posts(posts, root_post_id))
    }

    /// Persist and queue one item per destination. Returns the created item
    /// IDs; failed destinations are combined into one partial error.
    #[instrument(skip_all, fields(destinations = destinations.len()))]
    pub async fn schedule_post_distribution(
        &self,
        posts: &PreparedPosts,
        destinations: IndexMap<String, Destination>,
    ) -> Result<Vec<i64>> {
        let mut batch = BatchErrors::default();
        for (key, destination) in destinations {
            let item = NewDistributionItem {
                posts: posts.clone(),
                destination,
                origin: None,
                origin_id: None,
            };
            match self.enqueue_item(&item).await {
                Ok(id) => batch.complete(id),
                Err(err) => {
                    error!(?err, destination = %key, "distribution not scheduled");
                    batch.fail(format!("destination {}: {:#}", key, err));
                }
            }
        }
        batch.into_result()
    }

    /// Save the item and queue its task. A refused task leaves the item `failed`.
    async fn enqueue_item(&self, item: &NewDistributionItem) -> Result<i64> {
        let item_id = db::insert_item(&self.pool, item).await?;
        self.schedule_item(item_id).await?;
        info!(item_id, destination = %item.destination.key(), "distribution scheduled");
        Ok(item_id)
    }

    async fn schedule_item(&self, item_id: i64) -> Result<()> {
        let scheduled = self
            .scheduler
            .schedule_task(Utc::now(), TASK_DISTRIBUTE_ITEM, &distribute_item_args(item_id))
            .await;
        let message = match scheduled {
            Ok(task_id) if task_id > 0 => return Ok(()),
            Ok(_) => "the scheduler rejected the task".to_string(),
            Err(err) => format!("{:#}", err),
        };
        let failure = SyncError::Scheduling { item_id, message };
        db::set_item_status(&self.pool, item_id, ItemStatus::Failed, Some(&failure.to_string())).await?;
        Err(failure.into())
    }

    /// Distribute a root post to the requested destinations and to every
    /// linked copy already on file.
    #[instrument(skip_all, fields(root_post_id = root_post_id))]
    pub async fn distribute_root_post(
        &self,
        root_post_id: PostId,
        requests: &IndexMap<String, DestinationOverrides>,
        export: Option<ExportOptions>,
    ) -> Result<Vec<i64>> {
        let store = self.store.as_ref();
        if store.get_post(root_post_id).await?.is_none() {
            return Err(SyncError::PostNotFound(root_post_id).into());
        }
        self.make_root_post(root_post_id).await?;

        let export = match export {
            Some(export) => {
                store
                    .update_post_meta(root_post_id, META_EXPORT_OPTIONS, &serde_json::to_value(&export)?, None)
                    .await?;
                export
            }
            None => store
                .get_post_meta(root_post_id, META_EXPORT_OPTIONS)
                .await?
                .into_iter()
                .next()
                .and_then(|raw| serde_json::from_value(raw).ok())
                .unwrap_or_default(),
        };

        let destinations = get_destinations(store, requests, Some(root_post_id)).await?;
        if destinations.is_empty() {
            info!("no destinations");
            return Ok(Vec::new());
        }

        // Destinations with their own export arguments get their own export.
        let mut groups: IndexMap<ExportOptions, IndexMap<String, Destination>> = IndexMap::new();
        for (key, destination) in destinations {
            let options = match &destination {
                Destination::Blog(blog) => blog.export_arguments.clone(),
                Destination::Remote(_) => None,
            }
            .unwrap_or_else(|| export.clone());
            groups.entry(options).or_default().insert(key, destination);
        }

        let inputs = [DistributionInput::Id(root_post_id)];
        let mut batch = BatchErrors::default();
        for (options, destinations) in groups {
            let scheduled = match self
                .prepare_posts_for_distribution(&inputs, &options, Some(root_post_id))
                .await
            {
                Ok(posts) => self.schedule_post_distribution(&posts, destinations).await,
                Err(err) => Err(err),
            };
            match scheduled {
                Ok(ids) => batch.extend_completed(ids),
                Err(err) => batch.absorb(err),
            }
        }
        batch.into_result()
    }

    /// Mark `post_id` on the current blog as the root of its own global ID.
    async fn make_root_post(&self, post_id: PostId) -> Result<GlobalId> {
        let store = self.store.as_ref();
        let existing = store
            .get_post_meta(post_id, META_SYNCED_POST_ID)
            .await?
            .into_iter()
            .find_map(|v| v.as_str().and_then(|raw| raw.parse::<GlobalId>().ok()));
        if let Some(gid) = existing {
            let status = store
                .get_post_meta(post_id, META_SYNCED_POST_STATUS)
                .await?
                .into_iter()
                .find_map(|v| v.as_str().and_then(SyncStatus::parse_status));
            if status == Some(SyncStatus::Linked) {
                return Err(SyncError::Validation(format!(
                    "post {} is a linked copy of {} and cannot be distributed as root",
                    post_id, gid
                ))
                .into());
            }
            if status.is_none() {
                store
                    .update_post_meta(post_id, META_SYNCED_POST_STATUS, &Value::String(SyncStatus::Root.as_str().into()), None)
                    .await?;
            }
            return Ok(gid);
        }
        let gid = GlobalId::local(store.current_blog_id(), post_id);
        store
            .update_post_meta(post_id, META_SYNCED_POST_ID, &Value::String(gid.to_string()), None)
            .await?;
        store
            .update_post_meta(post_id, META_SYNCED_POST_STATUS, &Value::String(SyncStatus::Root.as_str().into()), None)
            .await?;
        info!(post_id, %gid, "post made root");
        Ok(gid)
    }

    /// Distribute an arbitrary post set, `chunk_size` posts at a time. Chunks
    /// succeed or fail independently.
    #[instrument(skip_all, fields(posts = inputs.len()))]
    pub async fn distribute_posts(
        &self,
        inputs: &[DistributionInput],
        requests: &IndexMap<String, DestinationOverrides>,
        export: &ExportOptions,
    ) -> Result<Vec<i64>> {
        if inputs.is_empty() {
            return Err(SyncError::Validation("no posts to distribute".into()).into());
        }
        let destinations = get_destinations(self.store.as_ref(), requests, None).await?;
        if destinations.is_empty() {
            info!("no destinations");
            return Ok(Vec::new());
        }

        let mut batch = BatchErrors::default();
        for (index, chunk) in inputs.chunks(self.settings.chunk_size.max(1)).enumerate() {
            debug!(chunk = index, size = chunk.len(), "distributing chunk");
            let scheduled = match self.prepare_posts_for_distribution(chunk, export, None).await {
                Ok(posts) => self.schedule_post_distribution(&posts, destinations.clone()).await,
                Err(err) => Err(err),
            };
            match scheduled {
                Ok(ids) => batch.extend_completed(ids),
                Err(err) => {
                    warn!(?err, chunk = index, "chunk failed");
                    batch.absorb(err);
                }
            }
        }
        batch.into_result()
    }

    /// Distribute posts that live on different blogs, each from its own blog.
    pub async fn distribute_posts_by_blog(
        &self,
        posts_by_blog: &IndexMap<BlogId, Vec<DistributionInput>>,
        requests: &IndexMap<String, DestinationOverrides>,
        export: &ExportOptions,
    ) -> Result<Vec<i64>> {
        let store = self.store.as_ref();
        let mut batch = BatchErrors::default();
        for (blog_id, inputs) in posts_by_blog {
            if !store.blog_exists(*blog_id).await? {
                batch.fail(format!("blog {} does not exist", blog_id));
                continue;
            }
            let _switch = BlogSwitch::enter(store, *blog_id);
            match self.distribute_posts(inputs, requests, export).await {
                Ok(ids) => batch.extend_completed(ids),
                Err(err) => batch.absorb(err),
            }
        }
        batch.into_result()
    }

    /// Run one queued item. `Err` means the item could not be processed at
    /// all; failures of the distribution itself end up on the item.
    #[instrument(skip_all, fields(item_id = item_id))]
    pub async fn distribute_item(&self, item_id: i64) -> Result<ItemStatus> {
        let Some(mut item) = db::fetch_item(&self.pool, item_id).await? else {
            return Err(SyncError::ItemNotFound(item_id).into());
        };
        item.status = ItemStatus::Started;
        item.error = None;
        db::update_item(&self.pool, &item).await?;

        let status = match &mut item.destination {
            Destination::Blog(blog) => self.run_blog_destination(blog, &item.posts).await,
            Destination::Remote(remote) => self.run_remote_destination(item_id, remote, &item.posts).await,
        };
        item.status = status;
        item.error = item.destination.error().map(str::to_string);
        db::update_item(&self.pool, &item).await?;
        match &item.error {
            Some(err) => warn!(status = status.as_str(), error = %err, "distribution item finished"),
            None => info!(status = status.as_str(), "distribution item finished"),
        }

        if status.is_terminal() && self.settings.report_remote_completion {
            self.report_completion(&item).await;
        }
        Ok(status)
    }

    async fn run_blog_destination(&self, blog: &mut BlogDestination, posts: &PreparedPosts) -> ItemStatus {
        let store = self.store.as_ref();
        match store.blog_exists(blog.blog_id).await {
            Ok(true) => {}
            Ok(false) => {
                blog.status = Some(ItemStatus::Failed);
                blog.error = Some(format!("blog {} does not exist", blog.blog_id));
                return ItemStatus::Failed;
            }
            Err(err) => {
                blog.status = Some(ItemStatus::Failed);
                blog.error = Some(format!("{:#}", err));
                return ItemStatus::Failed;
            }
        }

        let _switch = BlogSwitch::enter(store, blog.blog_id);
        let outcome = match blog.import_action.unwrap_or_default() {
            ImportAction::Delete => self.delete_linked_posts(blog, posts).await,
            action => self.import_to_blog(blog, posts, action).await,
        };
        match outcome {
            Ok(()) => {
                blog.status = Some(ItemStatus::Success);
                blog.error = None;
                ItemStatus::Success
            }
            Err(err) => {
                blog.status = Some(ItemStatus::Failed);
                blog.error = Some(format!("{:#}", err));
                ItemStatus::Failed
            }
        }
    }

    async fn import_to_blog(
        &self,
        blog: &mut BlogDestination,
        posts: &PreparedPosts,
        action: ImportAction,
    ) -> Result<()> {
        let store = self.store.as_ref();
        let mut posts = posts.clone();
        for post in posts.values_mut() {
            if action != ImportAction::Insert {
                post.import_action = Some(action);
            }
            if blog.conflict_action.is_some() && !post.is_contentsync_root_post {
                post.conflict_action = blog.conflict_action;
            }
        }
        let decisions: ConflictDecisions = blog
            .existing_posts
            .iter()
            .filter(|(origin, _)| posts.contains_key(*origin))
            .map(|(origin, local)| {
                (
                    *origin,
                    ConflictDecision {
                        existing_post_id: Some(*local),
                        conflict_action: None,
                    },
                )
            })
            .collect();

        let media = self.media_source_for(&posts);
        let table = Importer::new(store, self.translations.as_ref(), &self.hooks)
            .with_media(media)
            .import_posts(&posts, &decisions)
            .await?;

        for (origin_id, destination_id) in table.iter() {
            if !posts.contains_key(&origin_id) {
                continue;
            }
            let url = store.get_edit_url(destination_id).await?.unwrap_or_default();
            blog.posts.insert(origin_id, PostResult::success(destination_id, url));
        }
        Ok(())
    }

    /// Files of posts exported on this network are copied from disk; posts
    /// from elsewhere are downloaded.
    fn media_source_for(&self, posts: &PreparedPosts) -> MediaSource {
        let remote_origin = posts.values().any(|post| {
            post.gid()
                .map(|gid| gid.network_url.is_some())
                .unwrap_or(false)
        });
        if remote_origin {
            MediaSource::Remote(reqwest::Client::new())
        } else {
            MediaSource::Local
        }
    }

    /// Permanently delete the local copies of `posts`, found by global ID.
    async fn delete_linked_posts(&self, blog: &mut BlogDestination, posts: &PreparedPosts) -> Result<()> {
        let store = self.store.as_ref();
        let site = store.site_info().await?;
        let mut batch = BatchErrors::default();
        for (origin_id, post) in posts {
            let Some(gid) = post.gid() else { continue };
            let found = store
                .find_posts(
                    &PostQuery::by_meta(META_SYNCED_POST_ID, Value::String(gid.to_string()))
                        .of_type(&post.post_type)
                        .any_status()
                        .first(),
                )
                .await?;
            let Some(local) = found.into_iter().next() else {
                batch.fail(SyncError::NotFoundByGid { gid: gid.to_string() }.to_string());
                continue;
            };
            match store.delete_post(local.id, true).await {
                Ok(true) => {
                    batch.complete(local.id);
                    blog.posts.insert(*origin_id, PostResult::success(local.id, ""));
                    if gid.is_on_network(&site.network_url) {
                        remove_connection(store, &gid, &ConnectionTarget::Local(site.blog_id)).await?;
                    }
                }
                Ok(false) => batch.fail(format!("post {} could not be deleted", local.id)),
                Err(err) => batch.fail(format!("post {} could not be deleted: {:#}", local.id, err)),
            }
        }
        batch.into_result().map(|_| ())
    }

    async fn run_remote_destination(
        &self,
        item_id: i64,
        remote: &mut RemoteDestination,
        posts: &PreparedPosts,
    ) -> ItemStatus {
        let network_url = remote.network_url.clone();
        let outcome = match self.send_to_remote(item_id, remote, posts).await {
            Ok(response) => match remote_response_error(response.as_ref()) {
                None => Ok(()),
                Some(message) => Err(message),
            },
            Err(err) => Err(format!("{:#}", err)),
        };
        match outcome {
            Ok(()) => {
                remote.status = Some(ItemStatus::Started);
                remote.error = None;
                info!(%network_url, "remote distribution initiated");
                ItemStatus::Started
            }
            Err(message) => {
                let failure = SyncError::Remote {
                    network_url,
                    message,
                };
                remote.status = Some(ItemStatus::Failed);
                remote.error = Some(failure.to_string());
                ItemStatus::Failed
            }
        }
    }

    async fn send_to_remote(
        &self,
        item_id: i64,
        remote: &RemoteDestination,
        posts: &PreparedPosts,
    ) -> Result<Option<Value>> {
        let site = self.store.site_info().await?;
        let mut posts = posts.clone();
        for post in posts.values_mut() {
            let (Some(gid), Some(status)) = (post.gid(), post.sync_status()) else {
                continue;
            };
            if gid.network_url.is_none() {
                post.set_gid(
                    &GlobalId::remote(gid.blog_id, gid.post_id, &site.network_url),
                    status,
                );
            }
        }
        let payload = RemoteDistribution {
            origin: site.network_url,
            origin_id: item_id,
            destination: RemoteDestination {
                network_url: remote.network_url.clone(),
                blogs: remote.blogs.clone(),
                status: None,
                error: None,
            },
            posts,
        };
        self.remote
            .distribute_item(&remote.network_url, &payload)
            .await
    }

    /// Tell the origin network how an item it sent us ended.
    async fn report_completion(&self, item: &DistributionItem) {
        let (Some(origin), Some(origin_id)) = (&item.origin, item.origin_id) else {
            return;
        };
        let Destination::Blog(blog) = &item.destination else {
            return;
        };
        let network_url = match self.store.site_info().await {
            Ok(site) => site.network_url,
            Err(err) => {
                warn!(?err, "cannot report completion without site info");
                return;
            }
        };
        let report = StatusReport {
            network_url,
            blog_id: blog.blog_id,
            status: item.status,
            error: item.error.clone(),
            posts: blog.posts.clone(),
        };
        match self.remote.report_item_status(origin, origin_id, &report).await {
            Ok(()) => info!(%origin, origin_id, "completion reported"),
            Err(err) => warn!(?err, %origin, origin_id, "completion report failed"),
        }
    }

    /// Accept a distribution from another network: one local item per blog.
    #[instrument(skip_all, fields(origin = %payload.origin, origin_id = payload.origin_id))]
    pub async fn receive_remote_distribution(&self, payload: RemoteDistribution) -> Result<Vec<i64>> {
        if payload.destination.blogs.is_empty() {
            return Err(SyncError::Validation("remote distribution names no blogs".into()).into());
        }
        if payload.posts.is_empty() {
            return Err(SyncError::Validation("remote distribution carries no posts".into()).into());
        }
        let site = self.store.site_info().await?;
        let mut posts = payload.posts;
        for post in posts.values_mut() {
            let (Some(gid), Some(status)) = (post.gid(), post.sync_status()) else {
                continue;
            };
            if gid.network_url.is_some() && gid.is_on_network(&site.network_url) {
                post.set_gid(&GlobalId::local(gid.blog_id, gid.post_id), status);
            }
        }

        let mut batch = BatchErrors::default();
        for (blog_id, blog) in payload.destination.blogs {
            let item = NewDistributionItem {
                posts: posts.clone(),
                destination: Destination::Blog(BlogDestination {
                    blog_id,
                    status: None,
                    error: None,
                    posts: IndexMap::new(),
                    ..blog
                }),
                origin: Some(normalize_network_url(&payload.origin)),
                origin_id: Some(payload.origin_id),
            };
            match self.enqueue_item(&item).await {
                Ok(id) => batch.complete(id),
                Err(err) => batch.fail(format!("blog {}: {:#}", blog_id, err)),
            }
        }
        batch.into_result()
    }

    /// Check a completion report against its item and queue it for the
    /// worker. Returns the task ID.
    ///
    /// Applying a report records connections inside a blog context, so it is
    /// left to the queue worker instead of the request handler.
    #[instrument(skip_all, fields(item_id = item_id, network_url = %report.network_url))]
    pub async fn queue_status_report(&self, item_id: i64, report: &StatusReport) -> Result<i64> {
        let Some(mut item) = db::fetch_item(&self.pool, item_id).await? else {
            return Err(SyncError::ItemNotFound(item_id).into());
        };
        reported_destination(item_id, &mut item.destination, report)?;
        let scheduled = self
            .scheduler
            .schedule_task(Utc::now(), TASK_APPLY_STATUS_REPORT, &status_report_args(item_id, report)?)
            .await;
        let message = match scheduled {
            Ok(task_id) if task_id > 0 => {
                info!(task_id, "status report queued");
                return Ok(task_id);
            }
            Ok(_) => "the scheduler rejected the status report".to_string(),
            Err(err) => format!("{:#}", err),
        };
        Err(SyncError::Scheduling { item_id, message }.into())
    }

    /// Apply a completion report from a remote network to the item that
    /// sent the distribution.
    #[instrument(skip_all, fields(item_id = item_id, network_url = %report.network_url))]
    pub async fn apply_status_report(&self, item_id: i64, report: StatusReport) -> Result<ItemStatus> {
        let Some(mut item) = db::fetch_item(&self.pool, item_id).await? else {
            return Err(SyncError::ItemNotFound(item_id).into());
        };
        let remote = reported_destination(item_id, &mut item.destination, &report)?;

        let blog = remote
            .blogs
            .entry(report.blog_id)
            .or_insert_with(|| BlogDestination::new(report.blog_id, &DestinationOverrides::default()));
        blog.status = Some(report.status);
        blog.error = report.error.clone();
        blog.posts = report.posts.clone();

        let failures: Vec<String> = remote
            .blogs
            .values()
            .filter(|b| b.status == Some(ItemStatus::Failed))
            .map(|b| format!("blog {}: {}", b.blog_id, b.error.as_deref().unwrap_or("failed")))
            .collect();
        let all_done = remote
            .blogs
            .values()
            .all(|b| b.status == Some(ItemStatus::Success));
        let status = if !failures.is_empty() {
            ItemStatus::Failed
        } else if all_done {
            ItemStatus::Success
        } else {
            ItemStatus::Started
        };
        remote.status = Some(status);
        remote.error = (!failures.is_empty()).then(|| failures.join("; "));
        item.status = status;
        item.error = remote.error.clone();
        let network_url = remote.network_url.clone();

        if report.status == ItemStatus::Success {
            self.connect_remote_copies(&item, &network_url, &report).await?;
        }
        db::update_item(&self.pool, &item).await?;
        info!(status = status.as_str(), "remote status applied");
        Ok(status)
    }

    async fn connect_remote_copies(
        &self,
        item: &DistributionItem,
        network_url: &str,
        report: &StatusReport,
    ) -> Result<()> {
        let store = self.store.as_ref();
        let site = store.site_info().await?;
        for (origin_id, result) in &report.posts {
            let Some(gid) = item.posts.get(origin_id).and_then(|p| p.gid()) else {
                continue;
            };
            if !gid.is_on_network(&site.network_url) {
                continue;
            }
            let gid = GlobalId::local(gid.blog_id, gid.post_id);
            add_connection(
                store,
                &gid,
                ConnectionTarget::Remote {
                    network_url: network_url.to_string(),
                    blog_id: report.blog_id,
                },
                Connection {
                    post_id: result.post_id,
                    edit_url: String::new(),
                    blog_url: String::new(),
                    nice_url: result.url.clone(),
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Reset a stored item to `init` and queue it again.
    #[instrument(skip_all, fields(item_id = item_id))]
    pub async fn reschedule_item(&self, item_id: i64) -> Result<()> {
        let Some(mut item) = db::fetch_item(&self.pool, item_id).await? else {
            return Err(SyncError::ItemNotFound(item_id).into());
        };
        item.status = ItemStatus::Init;
        item.error = None;
        item.destination.set_outcome(ItemStatus::Init, None);
        db::update_item(&self.pool, &item).await?;
        self.schedule_item(item_id).await?;
        info!("distribution item rescheduled");
        Ok(())
    }

    /// Delete items past the retention period.
    pub async fn sweep(&self) -> Result<u64> {
        let removed = db::delete_items_older_than(&self.pool, self.settings.retention_days).await?;
        if removed > 0 {
            info!(removed, "old distribution items deleted");
        }
        Ok(removed)
    }

    /// Trash or delete a root post on the current blog after sending the same
    /// action to every connected copy.
    #[instrument(skip_all, fields(root_post_id = root_post_id))]
    pub async fn delete_root_post(&self, root_post_id: PostId, action: ImportAction) -> Result<Vec<i64>> {
        if !matches!(action, ImportAction::Trash | ImportAction::Delete) {
            return Err(SyncError::Validation(format!(
                "'{}' is not a deletion action",
                action.as_str()
            ))
            .into());
        }
        let store = self.store.as_ref();
        if store.get_post(root_post_id).await?.is_none() {
            return Err(SyncError::PostNotFound(root_post_id).into());
        }

        let overrides = DestinationOverrides {
            import_action: Some(action),
            ..Default::default()
        };
        let mut destinations = get_destinations(store, &IndexMap::new(), Some(root_post_id)).await?;
        for destination in destinations.values_mut() {
            match destination {
                Destination::Blog(blog) => blog.apply(&overrides),
                Destination::Remote(remote) => {
                    for blog in remote.blogs.values_mut() {
                        blog.apply(&overrides);
                    }
                }
            }
        }

        let scheduled = if destinations.is_empty() {
            Ok(Vec::new())
        } else {
            let inputs = [DistributionInput::Id(root_post_id)];
            let posts = self
                .prepare_posts_for_distribution(&inputs, &ExportOptions::default(), Some(root_post_id))
                .await?;
            let only_root: PreparedPosts = posts
                .into_iter()
                .filter(|(id, _)| *id == root_post_id)
                .collect();
            self.schedule_post_distribution(&only_root, destinations).await
        };

        let force = action == ImportAction::Delete;
        store.delete_post(root_post_id, force).await?;
        info!(force, "root post removed");
        scheduled
    }

    /// Turn a linked copy on the current blog into a standalone post.
    #[instrument(skip_all, fields(post_id = post_id))]
    pub async fn unlink_linked_post(&self, post_id: PostId) -> Result<()> {
        let store = self.store.as_ref();
        let (gid, status) = self.sync_meta(post_id).await?;
        let Some(gid) = gid.filter(|_| status == Some(SyncStatus::Linked)) else {
            return Err(SyncError::Validation(format!("post {} is not a linked post", post_id)).into());
        };
        for key in [META_SYNCED_POST_ID, META_SYNCED_POST_STATUS, META_CANONICAL_URL] {
            store.delete_post_meta(post_id, key).await?;
        }
        let site = store.site_info().await?;
        if gid.is_on_network(&site.network_url) {
            remove_connection(store, &gid, &ConnectionTarget::Local(site.blog_id)).await?;
        } else {
            warn!(%gid, "root lives on another network; its connection map is not updated");
        }
        info!(%gid, "linked post unlinked");
        Ok(())
    }

    /// Drop sync state from a root post and its local copies. Returns how many
    /// copies were unlinked.
    #[instrument(skip_all, fields(root_post_id = root_post_id))]
    pub async fn unlink_root_post(&self, root_post_id: PostId) -> Result<usize> {
        let store = self.store.as_ref();
        let (gid, status) = self.sync_meta(root_post_id).await?;
        let Some(gid) = gid.filter(|_| status == Some(SyncStatus::Root)) else {
            return Err(SyncError::Validation(format!("post {} is not a root post", root_post_id)).into());
        };
        let expected = Value::String(gid.to_string());
        let map = get_connection_map(store, root_post_id).await?;
        let mut unlinked = 0;
        for (target, connection) in map.entries() {
            let ConnectionTarget::Local(blog_id) = target else {
                warn!(?target, "remote copy left linked");
                continue;
            };
            if !store.blog_exists(blog_id).await? {
                continue;
            }
            let _switch = BlogSwitch::enter(store, blog_id);
            let carries_gid = store
                .get_post_meta(connection.post_id, META_SYNCED_POST_ID)
                .await?
                .contains(&expected);
            if carries_gid {
                for key in [META_SYNCED_POST_ID, META_SYNCED_POST_STATUS, META_CANONICAL_URL] {
                    store.delete_post_meta(connection.post_id, key).await?;
                }
                unlinked += 1;
            }
        }
        for key in [META_SYNCED_POST_ID, META_SYNCED_POST_STATUS, META_CONNECTION_MAP, META_EXPORT_OPTIONS] {
            store.delete_post_meta(root_post_id, key).await?;
        }
        info!(%gid, unlinked, "root post unlinked");
        Ok(unlinked)
    }

    async fn sync_meta(&self, post_id: PostId) -> Result<(Option<GlobalId>, Option<SyncStatus>)> {
        let store = self.store.as_ref();
        if store.get_post(post_id).await?.is_none() {
            return Err(SyncError::PostNotFound(post_id).into());
        }
        let gid = store
            .get_post_meta(post_id, META_SYNCED_POST_ID)
            .await?
            .into_iter()
            .find_map(|v| v.as_str().and_then(|raw| raw.parse::<GlobalId>().ok()));
        let status = store
            .get_post_meta(post_id, META_SYNCED_POST_STATUS)
            .await?
            .into_iter()
            .find_map(|v| v.as_str().and_then(SyncStatus::parse_status));
        Ok((gid, status))
    }
}

/// Group a flat list of `(blog, post)` pairs by blog, keeping first-seen order.
/// The remote destination a status report is about, when the report came
/// from the network the item was sent to.
fn reported_destination<'a>(
    item_id: i64,
    destination: &'a mut Destination,
    report: &StatusReport,
) -> Result<&'a mut RemoteDestination> {
    let Destination::Remote(remote) = destination else {
        return Err(SyncError::Validation(format!("item {} is not a remote distribution", item_id)).into());
    };
    if normalize_network_url(&remote.network_url) != normalize_network_url(&report.network_url) {
        return Err(SyncError::Validation(format!(
            "item {} was not sent to {}",
            item_id, report.network_url
        ))
        .into());
    }
    Ok(remote)
}

pub fn group_by_blog(pairs: impl IntoIterator<Item = (BlogId, PostId)>) -> IndexMap<BlogId, Vec<DistributionInput>> {
    let mut grouped: IndexMap<BlogId, Vec<DistributionInput>> = IndexMap::new();
    for (blog_id, post_id) in pairs {
        grouped.entry(blog_id).or_default().push(DistributionInput::Id(post_id));
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inputs_accept_ids_and_directives() {
        let inputs: Vec<DistributionInput> = serde_json::from_value(json!([
            12,
            {"ID": 14, "conflict_action": "skip"}
        ]))
        .unwrap();
        assert_eq!(inputs[0], DistributionInput::Id(12));
        assert_eq!(inputs[1].id(), 14);
        let DistributionInput::Post(directive) = &inputs[1] else {
            panic!("expected a directive");
        };
        assert_eq!(directive.conflict_action, Some(ConflictAction::Skip));
        assert_eq!(directive.import_action, None);
    }

    #[test]
    fn grouping_keeps_first_seen_blog_order() {
        let grouped = group_by_blog([(3, 10), (1, 4), (3, 11)]);
        assert_eq!(grouped.keys().copied().collect::<Vec<_>>(), vec![3, 1]);
        assert_eq!(
            grouped[&3],
            vec![DistributionInput::Id(10), DistributionInput::Id(11)]
        );
    }

    #[test]
    fn default_settings() {
        let settings = DistributorSettings::default();
        assert_eq!(settings.chunk_size, 10);
        assert_eq!(settings.retention_days, 3);
        assert!(settings.report_remote_completion);
    }
}
