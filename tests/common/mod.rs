#![allow(dead_code)]

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use contentsync::db;
use contentsync::distributor::Distributor;
use contentsync::model::{BlogId, PostId};
use contentsync::queue::{Scheduler, SqliteScheduler};
use contentsync::remote::{RemoteDistribution, RemoteTransport, StatusReport};
use contentsync::store::{BlogSwitch, PostFields, PostQuery, PostStore, SqlitePostStore};
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

pub const NETWORK: &str = "https://network.test";
pub const REMOTE_NETWORK: &str = "https://partner.test";

pub struct Env {
    pub pool: SqlitePool,
    pub store: Arc<SqlitePostStore>,
    pub uploads: TempDir,
}

pub async fn setup_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

/// Network with blogs 1 (main), 2 and 3.
pub async fn setup() -> Env {
    setup_network(NETWORK).await
}

pub async fn setup_network(network_url: &str) -> Env {
    let pool = setup_pool().await;
    let uploads = tempfile::tempdir().unwrap();
    let store = Arc::new(SqlitePostStore::new(
        pool.clone(),
        1,
        network_url,
        uploads.path(),
        format!("{network_url}/wp-content/uploads"),
    ));
    store.add_blog(1, network_url).await.unwrap();
    store.add_blog(2, &format!("{network_url}/two")).await.unwrap();
    store.add_blog(3, &format!("{network_url}/three")).await.unwrap();
    Env { pool, store, uploads }
}

pub fn page(name: &str, content: &str) -> PostFields {
    PostFields {
        post_type: "page".into(),
        post_title: name.replace('-', " "),
        post_name: name.into(),
        post_content: content.into(),
        post_status: "publish".into(),
        post_date: "2024-05-02 10:00:00".into(),
        post_date_gmt: "2024-05-02 08:00:00".into(),
        ..Default::default()
    }
}

pub async fn insert_page(store: &dyn PostStore, blog_id: BlogId, name: &str, content: &str) -> PostId {
    let _switch = BlogSwitch::enter(store, blog_id);
    store.insert_or_update_post(&page(name, content)).await.unwrap()
}

pub async fn pages_on(store: &dyn PostStore, blog_id: BlogId) -> Vec<contentsync::store::Post> {
    let _switch = BlogSwitch::enter(store, blog_id);
    store
        .find_posts(&PostQuery::default().of_type("page"))
        .await
        .unwrap()
}

pub async fn meta_str(store: &dyn PostStore, blog_id: BlogId, post_id: PostId, key: &str) -> Option<String> {
    let _switch = BlogSwitch::enter(store, blog_id);
    store
        .get_post_meta(post_id, key)
        .await
        .unwrap()
        .into_iter()
        .find_map(|v| v.as_str().map(str::to_string))
}

#[derive(Debug, Clone)]
pub struct SentDistribution {
    pub network_url: String,
    pub payload: RemoteDistribution,
}

#[derive(Debug, Clone)]
pub struct SentReport {
    pub origin: String,
    pub origin_id: i64,
    pub report: StatusReport,
}

/// Remote transport that records calls and answers from a queue.
#[derive(Clone, Default)]
pub struct RecordingRemote {
    responses: Arc<Mutex<VecDeque<Result<Option<Value>>>>>,
    sent: Arc<Mutex<Vec<SentDistribution>>>,
    reports: Arc<Mutex<Vec<SentReport>>>,
}

impl RecordingRemote {
    pub fn with_responses(responses: Vec<Result<Option<Value>>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub async fn sent(&self) -> Vec<SentDistribution> {
        self.sent.lock().await.clone()
    }

    pub async fn reports(&self) -> Vec<SentReport> {
        self.reports.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl RemoteTransport for RecordingRemote {
    async fn distribute_item(&self, network_url: &str, payload: &RemoteDistribution) -> Result<Option<Value>> {
        self.sent.lock().await.push(SentDistribution {
            network_url: network_url.to_string(),
            payload: payload.clone(),
        });
        let mut guard = self.responses.lock().await;
        guard
            .pop_front()
            .unwrap_or_else(|| Ok(Some(json!({"status": "started"}))))
    }

    async fn report_item_status(&self, origin: &str, origin_id: i64, report: &StatusReport) -> Result<()> {
        self.reports.lock().await.push(SentReport {
            origin: origin.to_string(),
            origin_id,
            report: report.clone(),
        });
        Ok(())
    }
}

/// Scheduler that refuses every task.
pub struct RejectingScheduler {
    pub error: bool,
}

#[async_trait::async_trait]
impl Scheduler for RejectingScheduler {
    async fn schedule_task(&self, _at: DateTime<Utc>, _task_name: &str, _args: &Value) -> Result<i64> {
        if self.error {
            Err(anyhow!("queue is full"))
        } else {
            Ok(0)
        }
    }
}

pub fn distributor(env: &Env, remote: &RecordingRemote) -> Distributor {
    Distributor::new(
        env.pool.clone(),
        env.store.clone(),
        Arc::new(SqliteScheduler::new(env.pool.clone())),
        Arc::new(remote.clone()),
    )
}
