use super::{
    Multisite, Post, PostFields, PostQuery, PostStore, SiteInfo, Term, TermArgs,
};
use crate::model::{
    BlogId, PostId, TermId, META_ATTACHED_FILE, META_ATTACHMENT_METADATA, META_TRASH_STATUS,
    POST_TYPE_ATTACHMENT,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, instrument, warn};

pub const WP_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Post store backed by the multisite tables in `migrations/0001_post_store.sql`.
pub struct SqlitePostStore {
    pool: SqlitePool,
    main_blog_id: BlogId,
    network_url: String,
    upload_root: PathBuf,
    upload_url: String,
    blog_stack: Mutex<Vec<BlogId>>,
}

impl std::fmt::Debug for SqlitePostStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePostStore")
            .field("main_blog_id", &self.main_blog_id)
            .field("network_url", &self.network_url)
            .finish_non_exhaustive()
    }
}

impl SqlitePostStore {
    pub fn new(
        pool: SqlitePool,
        main_blog_id: BlogId,
        network_url: impl Into<String>,
        upload_root: impl Into<PathBuf>,
        upload_url: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            main_blog_id,
            network_url: crate::gid::normalize_network_url(&network_url.into()),
            upload_root: upload_root.into(),
            upload_url: upload_url.into().trim_end_matches('/').to_string(),
            blog_stack: Mutex::new(Vec::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register (or re-point) a blog of this network.
    pub async fn add_blog(&self, blog_id: BlogId, home_url: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO blogs (blog_id, home_url) VALUES (?, ?) \
             ON CONFLICT(blog_id) DO UPDATE SET home_url = excluded.home_url",
        )
        .bind(blog_id)
        .bind(home_url.trim_end_matches('/'))
        .execute(&self.pool)
        .await
        .context("failed to register blog")?;
        Ok(())
    }

    fn blog(&self) -> BlogId {
        self.current_blog_id()
    }

    fn upload_dir_for(&self, blog_id: BlogId) -> PathBuf {
        if blog_id == self.main_blog_id {
            self.upload_root.clone()
        } else {
            self.upload_root.join("sites").join(blog_id.to_string())
        }
    }

    fn upload_url_for(&self, blog_id: BlogId) -> String {
        if blog_id == self.main_blog_id {
            self.upload_url.clone()
        } else {
            format!("{}/sites/{}", self.upload_url, blog_id)
        }
    }

    async fn home_url(&self) -> Result<String> {
        let blog_id = self.blog();
        sqlx::query_scalar::<_, String>("SELECT home_url FROM blogs WHERE blog_id = ?")
            .bind(blog_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("blog {} does not exist", blog_id))
    }

    async fn unique_post_name(
        &self,
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        name: &str,
        post_type: &str,
        exclude: Option<PostId>,
    ) -> Result<String> {
        if name.is_empty() {
            return Ok(String::new());
        }
        let blog_id = self.blog();
        let mut candidate = name.to_string();
        let mut suffix = 2;
        loop {
            let taken: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM posts WHERE blog_id = ? AND post_name = ? AND post_type = ? \
                 AND post_status != 'trash' AND id != ? LIMIT 1",
            )
            .bind(blog_id)
            .bind(&candidate)
            .bind(post_type)
            .bind(exclude.unwrap_or(0))
            .fetch_optional(&mut **tx)
            .await?;
            if taken.is_none() {
                return Ok(candidate);
            }
            candidate = format!("{}-{}", name, suffix);
            suffix += 1;
        }
    }
}

fn row_to_post(row: &SqliteRow) -> Post {
    Post {
        id: row.get("id"),
        post_type: row.get("post_type"),
        post_title: row.get("post_title"),
        post_name: row.get("post_name"),
        post_content: row.get("post_content"),
        post_excerpt: row.get("post_excerpt"),
        post_status: row.get("post_status"),
        post_date: row.get("post_date"),
        post_date_gmt: row.get("post_date_gmt"),
        post_author: row.get("post_author"),
        post_parent: row.get("post_parent"),
        post_mime_type: row.get("post_mime_type"),
    }
}

fn row_to_term(row: &SqliteRow) -> Term {
    Term {
        term_id: row.get("term_id"),
        taxonomy: row.get("taxonomy"),
        slug: row.get("slug"),
        name: row.get("name"),
        description: row.get("description"),
        parent: row.get("parent"),
    }
}

fn encode_meta(value: &Value) -> Result<String> {
    serde_json::to_string(value).context("failed to encode meta value")
}

fn decode_meta(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Lowercase, ASCII-alphanumeric, dash separated.
pub fn sanitize_title(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
    {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "gif" => "image/gif",
        Some(ext) if ext == "webp" => "image/webp",
        Some(ext) if ext == "svg" => "image/svg+xml",
        Some(ext) if ext == "pdf" => "application/pdf",
        Some(ext) if ext == "mp4" => "video/mp4",
        Some(ext) if ext == "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

impl Multisite for SqlitePostStore {
    fn current_blog_id(&self) -> BlogId {
        match self.blog_stack.lock() {
            Ok(stack) => stack.last().copied().unwrap_or(self.main_blog_id),
            Err(poisoned) => poisoned
                .into_inner()
                .last()
                .copied()
                .unwrap_or(self.main_blog_id),
        }
    }

    fn switch_to_blog(&self, blog_id: BlogId) {
        let mut stack = self
            .blog_stack
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stack.push(blog_id);
    }

    fn restore_current_blog(&self) {
        let mut stack = self
            .blog_stack
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if stack.pop().is_none() {
            warn!("restore_current_blog called without a matching switch");
        }
    }
}

#[async_trait]
impl PostStore for SqlitePostStore {
    async fn site_info(&self) -> Result<SiteInfo> {
        let blog_id = self.blog();
        Ok(SiteInfo {
            blog_id,
            home_url: self.home_url().await?,
            network_url: self.network_url.clone(),
            upload_dir: self.upload_dir_for(blog_id),
            upload_url: self.upload_url_for(blog_id),
        })
    }

    async fn blog_exists(&self, blog_id: BlogId) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT blog_id FROM blogs WHERE blog_id = ?")
            .bind(blog_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn get_post(&self, id: PostId) -> Result<Option<Post>> {
        let row = sqlx::query("SELECT * FROM posts WHERE blog_id = ? AND id = ?")
            .bind(self.blog())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_post))
    }

    #[instrument(skip_all)]
    async fn find_posts(&self, query: &PostQuery) -> Result<Vec<Post>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT p.* FROM posts p WHERE p.blog_id = ");
        qb.push_bind(self.blog());
        if let Some(post_type) = &query.post_type {
            qb.push(" AND p.post_type = ").push_bind(post_type.clone());
        }
        if let Some(name) = &query.post_name {
            qb.push(" AND p.post_name = ").push_bind(name.clone());
        }
        match &query.statuses {
            Some(statuses) if !statuses.is_empty() => {
                qb.push(" AND p.post_status IN (");
                let mut list = qb.separated(", ");
                for status in statuses {
                    list.push_bind(status.clone());
                }
                qb.push(")");
            }
            _ => {
                qb.push(" AND p.post_status != 'trash'");
            }
        }
        if let Some(parent) = query.parent {
            qb.push(" AND p.post_parent = ").push_bind(parent);
        }
        if let Some((key, value)) = &query.meta {
            qb.push(
                " AND EXISTS (SELECT 1 FROM postmeta m WHERE m.blog_id = p.blog_id \
                 AND m.post_id = p.id AND m.meta_key = ",
            )
            .push_bind(key.clone())
            .push(" AND m.meta_value = ")
            .push_bind(encode_meta(value)?)
            .push(")");
        }
        if let Some(file_name) = &query.attached_file_name {
            qb.push(
                " AND EXISTS (SELECT 1 FROM postmeta f WHERE f.blog_id = p.blog_id \
                 AND f.post_id = p.id AND f.meta_key = ",
            )
            .push_bind(META_ATTACHED_FILE)
            .push(" AND (f.meta_value = ")
            .push_bind(encode_meta(&Value::String(file_name.clone()))?)
            .push(" OR f.meta_value LIKE ")
            .push_bind(format!("%/{}\"", escape_like(file_name)))
            .push(" ESCAPE '\\'))");
        }
        qb.push(" ORDER BY p.id ASC");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_post).collect())
    }

    #[instrument(skip_all)]
    async fn insert_or_update_post(&self, fields: &PostFields) -> Result<PostId> {
        let blog_id = self.blog();
        let now = Utc::now();
        let post_date = if fields.post_date.is_empty() {
            now.naive_local().format(WP_DATE_FORMAT).to_string()
        } else {
            fields.post_date.clone()
        };
        let post_date_gmt = if fields.post_date_gmt.is_empty() {
            now.naive_utc().format(WP_DATE_FORMAT).to_string()
        } else {
            fields.post_date_gmt.clone()
        };
        let post_type = if fields.post_type.is_empty() {
            "post".to_string()
        } else {
            fields.post_type.clone()
        };
        let post_status = if fields.post_status.is_empty() {
            "publish".to_string()
        } else {
            fields.post_status.clone()
        };

        let mut tx = self.pool.begin().await?;
        let post_name = self
            .unique_post_name(&mut tx, &fields.post_name, &post_type, fields.id)
            .await?;
        let id = match fields.id {
            Some(id) => {
                let res = sqlx::query(
                    "UPDATE posts SET post_type = ?, post_title = ?, post_name = ?, post_content = ?, \
                     post_excerpt = ?, post_status = ?, post_date = ?, post_date_gmt = ?, \
                     post_author = ?, post_parent = ?, post_mime_type = ? \
                     WHERE blog_id = ? AND id = ?",
                )
                .bind(&post_type)
                .bind(&fields.post_title)
                .bind(&post_name)
                .bind(&fields.post_content)
                .bind(&fields.post_excerpt)
                .bind(&post_status)
                .bind(&post_date)
                .bind(&post_date_gmt)
                .bind(fields.post_author)
                .bind(fields.post_parent)
                .bind(&fields.post_mime_type)
                .bind(blog_id)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                if res.rows_affected() == 0 {
                    bail!("post {} does not exist on blog {}", id, blog_id);
                }
                id
            }
            None => {
                let id: i64 = sqlx::query_scalar(
                    "SELECT COALESCE(MAX(id), 0) + 1 FROM posts WHERE blog_id = ?",
                )
                .bind(blog_id)
                .fetch_one(&mut *tx)
                .await?;
                sqlx::query(
                    "INSERT INTO posts (blog_id, id, post_type, post_title, post_name, post_content, \
                     post_excerpt, post_status, post_date, post_date_gmt, post_author, post_parent, \
                     post_mime_type) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(blog_id)
                .bind(id)
                .bind(&post_type)
                .bind(&fields.post_title)
                .bind(&post_name)
                .bind(&fields.post_content)
                .bind(&fields.post_excerpt)
                .bind(&post_status)
                .bind(&post_date)
                .bind(&post_date_gmt)
                .bind(fields.post_author)
                .bind(fields.post_parent)
                .bind(&fields.post_mime_type)
                .execute(&mut *tx)
                .await?;
                id
            }
        };
        tx.commit().await?;
        debug!(blog_id, post_id = id, "post written");
        Ok(id)
    }

    async fn insert_attachment(&self, fields: &PostFields, file: &Path) -> Result<PostId> {
        let upload_dir = self.upload_dir_for(self.blog());
        let relative = file
            .strip_prefix(&upload_dir)
            .with_context(|| format!("{} is outside the uploads dir", file.display()))?
            .to_string_lossy()
            .replace('\\', "/");
        let size = tokio::fs::metadata(file)
            .await
            .with_context(|| format!("attachment file missing: {}", file.display()))?
            .len();

        let mut fields = fields.clone();
        fields.post_type = POST_TYPE_ATTACHMENT.to_string();
        if fields.post_status.is_empty() {
            fields.post_status = "inherit".to_string();
        }
        if fields.post_mime_type.is_empty() {
            fields.post_mime_type = content_type_for(file).to_string();
        }
        let id = self.insert_or_update_post(&fields).await?;
        self.update_post_meta(id, META_ATTACHED_FILE, &Value::String(relative.clone()), None)
            .await?;
        self.update_post_meta(
            id,
            META_ATTACHMENT_METADATA,
            &json!({ "file": relative, "filesize": size, "mime_type": fields.post_mime_type }),
            None,
        )
        .await?;
        Ok(id)
    }

    #[instrument(skip_all)]
    async fn delete_post(&self, id: PostId, force: bool) -> Result<bool> {
        let blog_id = self.blog();
        let Some(post) = self.get_post(id).await? else {
            return Ok(false);
        };

        if !force {
            if post.post_status != "trash" {
                self.update_post_meta(
                    id,
                    META_TRASH_STATUS,
                    &Value::String(post.post_status.clone()),
                    None,
                )
                .await?;
                sqlx::query("UPDATE posts SET post_status = 'trash' WHERE blog_id = ? AND id = ?")
                    .bind(blog_id)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
            return Ok(true);
        }

        let file = if post.post_type == POST_TYPE_ATTACHMENT {
            self.attached_file_path(id).await?
        } else {
            None
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM postmeta WHERE blog_id = ? AND post_id = ?")
            .bind(blog_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM term_relationships WHERE blog_id = ? AND post_id = ?")
            .bind(blog_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE posts SET post_parent = ? WHERE blog_id = ? AND post_parent = ?")
            .bind(post.post_parent)
            .bind(blog_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM posts WHERE blog_id = ? AND id = ?")
            .bind(blog_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if let Some(path) = file {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(?err, path = %path.display(), "failed to remove attachment file");
                }
            }
        }
        Ok(true)
    }

    async fn get_post_meta(&self, id: PostId, key: &str) -> Result<Vec<Value>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT meta_value FROM postmeta WHERE blog_id = ? AND post_id = ? AND meta_key = ? \
             ORDER BY meta_id ASC",
        )
        .bind(self.blog())
        .bind(id)
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|raw| decode_meta(raw)).collect())
    }

    async fn get_all_post_meta(&self, id: PostId) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query(
            "SELECT meta_key, meta_value FROM postmeta WHERE blog_id = ? AND post_id = ? \
             ORDER BY meta_id ASC",
        )
        .bind(self.blog())
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let key: String = row.get("meta_key");
                let raw: String = row.get("meta_value");
                (key, decode_meta(&raw))
            })
            .collect())
    }

    async fn add_post_meta(&self, id: PostId, key: &str, value: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO postmeta (blog_id, post_id, meta_key, meta_value) VALUES (?, ?, ?, ?)",
        )
        .bind(self.blog())
        .bind(id)
        .bind(key)
        .bind(encode_meta(value)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_post_meta(
        &self,
        id: PostId,
        key: &str,
        value: &Value,
        prev: Option<&Value>,
    ) -> Result<()> {
        let blog_id = self.blog();
        let encoded = encode_meta(value)?;
        let updated = match prev {
            Some(prev) => {
                let slot: Option<i64> = sqlx::query_scalar(
                    "SELECT meta_id FROM postmeta WHERE blog_id = ? AND post_id = ? AND meta_key = ? \
                     AND meta_value = ? ORDER BY meta_id ASC LIMIT 1",
                )
                .bind(blog_id)
                .bind(id)
                .bind(key)
                .bind(encode_meta(prev)?)
                .fetch_optional(&self.pool)
                .await?;
                match slot {
                    Some(meta_id) => sqlx::query("UPDATE postmeta SET meta_value = ? WHERE meta_id = ?")
                        .bind(&encoded)
                        .bind(meta_id)
                        .execute(&self.pool)
                        .await?
                        .rows_affected(),
                    None => 0,
                }
            }
            None => sqlx::query(
                "UPDATE postmeta SET meta_value = ? WHERE blog_id = ? AND post_id = ? AND meta_key = ?",
            )
            .bind(&encoded)
            .bind(blog_id)
            .bind(id)
            .bind(key)
            .execute(&self.pool)
            .await?
            .rows_affected(),
        };
        if updated == 0 {
            self.add_post_meta(id, key, value).await?;
        }
        Ok(())
    }

    async fn delete_post_meta(&self, id: PostId, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM postmeta WHERE blog_id = ? AND post_id = ? AND meta_key = ?")
            .bind(self.blog())
            .bind(id)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_post_taxonomies(&self, id: PostId) -> Result<Vec<String>> {
        let taxonomies: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT taxonomy FROM term_relationships WHERE blog_id = ? AND post_id = ? \
             ORDER BY taxonomy",
        )
        .bind(self.blog())
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(taxonomies)
    }

    async fn get_object_terms(&self, id: PostId, taxonomy: &str) -> Result<Vec<Term>> {
        let rows = sqlx::query(
            "SELECT t.* FROM terms t JOIN term_relationships r \
             ON r.blog_id = t.blog_id AND r.term_id = t.term_id \
             WHERE r.blog_id = ? AND r.post_id = ? AND r.taxonomy = ? ORDER BY r.term_order ASC",
        )
        .bind(self.blog())
        .bind(id)
        .bind(taxonomy)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_term).collect())
    }

    async fn set_object_terms(
        &self,
        id: PostId,
        taxonomy: &str,
        term_ids: &[TermId],
    ) -> Result<()> {
        let blog_id = self.blog();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM term_relationships WHERE blog_id = ? AND post_id = ? AND taxonomy = ?")
            .bind(blog_id)
            .bind(id)
            .bind(taxonomy)
            .execute(&mut *tx)
            .await?;
        for (order, term_id) in term_ids.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO term_relationships (blog_id, post_id, term_id, taxonomy, term_order) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(blog_id)
            .bind(id)
            .bind(term_id)
            .bind(taxonomy)
            .bind(order as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_term(&self, term_id: TermId) -> Result<Option<Term>> {
        let row = sqlx::query("SELECT * FROM terms WHERE blog_id = ? AND term_id = ?")
            .bind(self.blog())
            .bind(term_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_term))
    }

    async fn get_term_by_slug(&self, slug: &str, taxonomy: &str) -> Result<Option<Term>> {
        let row = sqlx::query("SELECT * FROM terms WHERE blog_id = ? AND taxonomy = ? AND slug = ?")
            .bind(self.blog())
            .bind(taxonomy)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_term))
    }

    async fn get_terms(&self, taxonomy: &str) -> Result<Vec<Term>> {
        let rows = sqlx::query("SELECT * FROM terms WHERE blog_id = ? AND taxonomy = ? ORDER BY term_id")
            .bind(self.blog())
            .bind(taxonomy)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_term).collect())
    }

    #[instrument(skip_all)]
    async fn insert_term(&self, taxonomy: &str, args: &TermArgs) -> Result<TermId> {
        let blog_id = self.blog();
        let slug = if args.slug.is_empty() {
            sanitize_title(&args.name)
        } else {
            args.slug.clone()
        };
        if slug.is_empty() {
            bail!("term in {} needs a name or slug", taxonomy);
        }
        let mut tx = self.pool.begin().await?;
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT term_id FROM terms WHERE blog_id = ? AND taxonomy = ? AND slug = ?",
        )
        .bind(blog_id)
        .bind(taxonomy)
        .bind(&slug)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(existing) = exists {
            bail!("term '{}' already exists in {} as {}", slug, taxonomy, existing);
        }
        let term_id: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(term_id), 0) + 1 FROM terms WHERE blog_id = ?")
                .bind(blog_id)
                .fetch_one(&mut *tx)
                .await?;
        sqlx::query(
            "INSERT INTO terms (blog_id, term_id, taxonomy, slug, name, description, parent) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(blog_id)
        .bind(term_id)
        .bind(taxonomy)
        .bind(&slug)
        .bind(if args.name.is_empty() { &slug } else { &args.name })
        .bind(&args.description)
        .bind(args.parent)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(term_id)
    }

    async fn update_term(&self, term_id: TermId, args: &TermArgs) -> Result<()> {
        let res = sqlx::query(
            "UPDATE terms SET name = ?, description = ?, parent = ? WHERE blog_id = ? AND term_id = ?",
        )
        .bind(&args.name)
        .bind(&args.description)
        .bind(args.parent)
        .bind(self.blog())
        .bind(term_id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            bail!("term {} does not exist", term_id);
        }
        Ok(())
    }

    async fn register_taxonomy(&self, taxonomy: &str, object_types: &[String]) -> Result<()> {
        sqlx::query(
            "INSERT INTO taxonomies (blog_id, name, object_types) VALUES (?, ?, ?) \
             ON CONFLICT(blog_id, name) DO UPDATE SET object_types = excluded.object_types",
        )
        .bind(self.blog())
        .bind(taxonomy)
        .bind(serde_json::to_string(object_types)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_permalink(&self, id: PostId) -> Result<Option<String>> {
        let Some(post) = self.get_post(id).await? else {
            return Ok(None);
        };
        if post.post_type == POST_TYPE_ATTACHMENT {
            return self.attachment_url(id).await;
        }
        let home = self.home_url().await?;
        if post.post_status == "publish" && !post.post_name.is_empty() {
            Ok(Some(format!("{}/{}/", home, post.post_name)))
        } else {
            Ok(Some(format!("{}/?p={}", home, id)))
        }
    }

    async fn get_edit_url(&self, id: PostId) -> Result<Option<String>> {
        if self.get_post(id).await?.is_none() {
            return Ok(None);
        }
        let home = self.home_url().await?;
        Ok(Some(format!(
            "{}/wp-admin/post.php?post={}&action=edit",
            home, id
        )))
    }

    async fn attached_file_path(&self, id: PostId) -> Result<Option<PathBuf>> {
        let relative = self
            .get_post_meta(id, META_ATTACHED_FILE)
            .await?
            .into_iter()
            .next()
            .and_then(|v| v.as_str().map(str::to_string));
        Ok(relative.map(|rel| self.upload_dir_for(self.blog()).join(rel)))
    }

    async fn attachment_url(&self, id: PostId) -> Result<Option<String>> {
        let relative = self
            .get_post_meta(id, META_ATTACHED_FILE)
            .await?
            .into_iter()
            .next()
            .and_then(|v| v.as_str().map(str::to_string));
        Ok(relative.map(|rel| format!("{}/{}", self.upload_url_for(self.blog()), rel)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BlogSwitch;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_store() -> SqlitePostStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = SqlitePostStore::new(
            pool,
            1,
            "https://network.test",
            "/tmp/contentsync-uploads",
            "https://network.test/wp-content/uploads",
        );
        store.add_blog(1, "https://network.test").await.unwrap();
        store.add_blog(2, "https://network.test/two").await.unwrap();
        store
    }

    fn page(name: &str) -> PostFields {
        PostFields {
            post_type: "page".into(),
            post_title: name.into(),
            post_name: name.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ids_are_allocated_per_blog() {
        let store = setup_store().await;
        let a = store.insert_or_update_post(&page("a")).await.unwrap();
        let b = {
            let _switch = BlogSwitch::enter(&store, 2);
            store.insert_or_update_post(&page("b")).await.unwrap()
        };
        assert_eq!(a, 1);
        assert_eq!(b, 1);
        assert_eq!(store.get_post(1).await.unwrap().unwrap().post_name, "a");
    }

    #[tokio::test]
    async fn inserts_get_unique_slugs_and_updates_keep_theirs() {
        let store = setup_store().await;
        let first = store.insert_or_update_post(&page("about-us")).await.unwrap();
        let second = store.insert_or_update_post(&page("about-us")).await.unwrap();
        assert_eq!(store.get_post(second).await.unwrap().unwrap().post_name, "about-us-2");

        let mut update = page("about-us");
        update.id = Some(first);
        update.post_title = "About".into();
        store.insert_or_update_post(&update).await.unwrap();
        let post = store.get_post(first).await.unwrap().unwrap();
        assert_eq!(post.post_name, "about-us");
        assert_eq!(post.post_title, "About");
    }

    #[tokio::test]
    async fn positional_meta_updates() {
        let store = setup_store().await;
        let id = store.insert_or_update_post(&page("meta")).await.unwrap();
        store.add_post_meta(id, "color", &json!("red")).await.unwrap();
        store.add_post_meta(id, "color", &json!("blue")).await.unwrap();
        store
            .update_post_meta(id, "color", &json!("green"), Some(&json!("blue")))
            .await
            .unwrap();
        assert_eq!(
            store.get_post_meta(id, "color").await.unwrap(),
            vec![json!("red"), json!("green")]
        );

        let found = store
            .find_posts(&PostQuery::by_meta("color", json!("green")))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn trash_then_force_delete() {
        let store = setup_store().await;
        let id = store.insert_or_update_post(&page("gone")).await.unwrap();
        assert!(store.delete_post(id, false).await.unwrap());
        assert_eq!(store.get_post(id).await.unwrap().unwrap().post_status, "trash");
        assert!(store
            .find_posts(&PostQuery::by_name("gone", "page"))
            .await
            .unwrap()
            .is_empty());
        assert!(store.delete_post(id, true).await.unwrap());
        assert!(store.get_post(id).await.unwrap().is_none());
        assert!(!store.delete_post(id, true).await.unwrap());
    }

    #[tokio::test]
    async fn terms_are_unique_per_taxonomy() {
        let store = setup_store().await;
        let parent = store
            .insert_term("category", &TermArgs { name: "News".into(), ..Default::default() })
            .await
            .unwrap();
        let child = store
            .insert_term(
                "category",
                &TermArgs {
                    name: "Local News".into(),
                    parent,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store
            .insert_term("category", &TermArgs { name: "News".into(), ..Default::default() })
            .await
            .is_err());
        let term = store.get_term_by_slug("local-news", "category").await.unwrap().unwrap();
        assert_eq!(term.term_id, child);
        assert_eq!(term.parent, parent);

        let post = store.insert_or_update_post(&page("tagged")).await.unwrap();
        store.set_object_terms(post, "category", &[child, parent]).await.unwrap();
        let assigned = store.get_object_terms(post, "category").await.unwrap();
        assert_eq!(assigned.iter().map(|t| t.term_id).collect::<Vec<_>>(), vec![child, parent]);
        assert_eq!(store.get_post_taxonomies(post).await.unwrap(), vec!["category"]);
    }

    #[test]
    fn sanitize_title_makes_slugs() {
        assert_eq!(sanitize_title("  Hello, World! "), "hello-world");
        assert_eq!(sanitize_title("Über"), "ber");
    }
}
