//! Durable async task queue and the worker step that drains it.
use crate::db;
use crate::distributor::Distributor;
use crate::error::SyncError;
use crate::remote::StatusReport;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::{info, instrument, warn};

pub const TASK_DISTRIBUTE_ITEM: &str = "contentsync_distribute_item";
pub const TASK_APPLY_STATUS_REPORT: &str = "contentsync_apply_status_report";

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Queue `task_name` to run at `at`. Returns the task ID, `0` when the
    /// scheduler refused the task.
    async fn schedule_task(&self, at: DateTime<Utc>, task_name: &str, args: &Value) -> Result<i64>;
}

/// Scheduler backed by `contentsync_scheduled_tasks`.
#[derive(Debug, Clone)]
pub struct SqliteScheduler {
    pool: SqlitePool,
}

impl SqliteScheduler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Scheduler for SqliteScheduler {
    async fn schedule_task(&self, at: DateTime<Utc>, task_name: &str, args: &Value) -> Result<i64> {
        db::enqueue_task(&self.pool, task_name, args, at).await
    }
}

pub fn distribute_item_args(item_id: i64) -> Value {
    json!({ "item_id": item_id })
}

pub fn status_report_args(item_id: i64, report: &StatusReport) -> Result<Value> {
    Ok(json!({ "item_id": item_id, "report": serde_json::to_value(report)? }))
}

/// Failures a retry cannot fix.
fn is_permanent(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::ItemNotFound(_)) | Some(SyncError::Validation(_))
    )
}

/// Run the oldest due task. Returns false when nothing was due.
///
/// Infrastructure errors push the task back with capped backoff. Item-level
/// failures are recorded on the item by the distributor and not retried, and
/// tasks pointing at a missing item are dropped.
///
/// The worker is the only caller that enters blog contexts in the daemon.
#[instrument(skip_all)]
pub async fn process_next_task(
    pool: &SqlitePool,
    distributor: &Distributor,
    max_backoff_secs: i64,
) -> Result<bool> {
    let Some(task) = db::next_due_task(pool).await? else {
        return Ok(false);
    };
    let Some(item_id) = task.args.get("item_id").and_then(Value::as_i64) else {
        warn!(id = task.id, task = %task.task_name, args = %task.args, "task without item id dropped");
        db::delete_task(pool, task.id).await?;
        return Ok(true);
    };

    let outcome = match task.task_name.as_str() {
        TASK_DISTRIBUTE_ITEM => distributor.distribute_item(item_id).await,
        TASK_APPLY_STATUS_REPORT => {
            let report = task.args.get("report").cloned().map(serde_json::from_value::<StatusReport>);
            let Some(Ok(report)) = report else {
                warn!(id = task.id, item_id, "status report task without a readable report dropped");
                db::delete_task(pool, task.id).await?;
                return Ok(true);
            };
            distributor.apply_status_report(item_id, report).await
        }
        _ => {
            warn!(id = task.id, task = %task.task_name, "unknown task dropped");
            db::delete_task(pool, task.id).await?;
            return Ok(true);
        }
    };

    match outcome {
        Ok(status) => {
            db::delete_task(pool, task.id).await?;
            info!(id = task.id, task = %task.task_name, item_id, status = status.as_str(), "task done");
        }
        Err(err) if is_permanent(&err) => {
            warn!(error = %err, id = task.id, task = %task.task_name, item_id, "task dropped");
            db::delete_task(pool, task.id).await?;
        }
        Err(err) => {
            warn!(?err, id = task.id, item_id, attempt = task.attempt, "task failed; backoff");
            db::backoff_task_with_cap(pool, task.id, task.attempt, max_backoff_secs).await?;
        }
    }
    Ok(true)
}

/// Drain every task that is due right now.
pub async fn drain(pool: &SqlitePool, distributor: &Distributor, max_backoff_secs: i64) -> Result<usize> {
    let mut processed = 0;
    while process_next_task(pool, distributor, max_backoff_secs).await? {
        processed += 1;
    }
    Ok(processed)
}
