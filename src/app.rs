//! Wiring shared by the binaries: pool, store, collaborators, distributor.
use crate::config::{Config, TranslationToolKind};
use crate::db;
use crate::distributor::{Distributor, DistributorSettings};
use crate::queue::SqliteScheduler;
use crate::remote::RemoteClient;
use crate::store::sqlite::SqlitePostStore;
use crate::translation::{MetaTranslations, NoTranslations, TranslationTool};
use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

pub struct App {
    pub pool: SqlitePool,
    pub store: Arc<SqlitePostStore>,
    pub distributor: Arc<Distributor>,
}

/// Open the database, seed the configured blogs and build the distributor.
pub async fn build(cfg: &Config) -> Result<App> {
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(SqlitePostStore::new(
        pool.clone(),
        cfg.site.blog_id,
        cfg.site.network_url.clone(),
        cfg.site.upload_root.clone(),
        cfg.site.upload_url.clone(),
    ));
    if !cfg.site.blogs.contains_key(&cfg.site.blog_id) {
        store.add_blog(cfg.site.blog_id, &cfg.site.network_url).await?;
    }
    for (blog_id, home_url) in &cfg.site.blogs {
        store.add_blog(*blog_id, home_url).await?;
    }

    let translations: Arc<dyn TranslationTool> = match cfg.translations.tool {
        TranslationToolKind::None => Arc::new(NoTranslations),
        TranslationToolKind::Meta => Arc::new(MetaTranslations::new(
            cfg.translations
                .languages
                .iter()
                .map(|(blog, codes)| (*blog, codes.clone()))
                .collect(),
        )),
    };
    info!(tool = translations.tool_name(), blogs = cfg.site.blogs.len(), "post store ready");

    let distributor = Distributor::new(
        pool.clone(),
        store.clone(),
        Arc::new(SqliteScheduler::new(pool.clone())),
        Arc::new(RemoteClient::from_config(cfg)?),
    )
    .with_translations(translations)
    .with_settings(DistributorSettings {
        chunk_size: cfg.distribution.chunk_size,
        retention_days: cfg.distribution.retention_days,
        report_remote_completion: cfg.distribution.report_remote_completion,
    });

    Ok(App {
        pool,
        store,
        distributor: Arc::new(distributor),
    })
}
