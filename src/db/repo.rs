use super::model::{DistributionItem, NewDistributionItem, ScheduledTask};
use crate::destination::Destination;
use crate::error::SyncError;
use crate::model::ItemStatus;
use crate::post::PreparedPosts;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/`, create the parent
/// directory and add `mode=rwc`. Other URLs are returned untouched.
pub fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{}&mode=rwc", q),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{}?{}", path, query)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn row_to_item(row: &SqliteRow) -> Result<DistributionItem> {
    let id: i64 = row.get("ID");
    let status: String = row.get("status");
    let posts: String = row.get("posts");
    let destination: String = row.get("destination");
    Ok(DistributionItem {
        id,
        status: ItemStatus::parse_status(&status)
            .ok_or_else(|| anyhow!("item {} has unknown status '{}'", id, status))?,
        posts: serde_json::from_str(&posts)
            .with_context(|| format!("item {} has unreadable posts", id))?,
        destination: serde_json::from_str(&destination)
            .with_context(|| format!("item {} has unreadable destination", id))?,
        origin: row.get("origin"),
        origin_id: row.get("origin_id"),
        error: row.get("error"),
        time: row.get("time"),
    })
}

/// Persist a new item with status `init` and return its ID.
#[instrument(skip_all)]
pub async fn insert_item(pool: &Pool, item: &NewDistributionItem) -> Result<i64> {
    if item.posts.is_empty() {
        return Err(SyncError::Validation("distribution item has no posts".into()).into());
    }
    if let Destination::Remote(remote) = &item.destination {
        if remote.blogs.is_empty() {
            return Err(SyncError::Validation("remote destination has no blogs".into()).into());
        }
    }
    let rec = sqlx::query(
        "INSERT INTO contentsync_queue_distribution_items (status, posts, destination, origin, origin_id) \
         VALUES (?, ?, ?, ?, ?) RETURNING ID",
    )
    .bind(ItemStatus::Init.as_str())
    .bind(serde_json::to_string(&item.posts)?)
    .bind(serde_json::to_string(&item.destination)?)
    .bind(item.origin.as_deref())
    .bind(item.origin_id)
    .fetch_one(pool)
    .await
    .context("failed to save distribution item")?;
    Ok(rec.get("ID"))
}

/// Write back status, destination, posts and error; touches `time`.
#[instrument(skip_all, fields(item_id = item.id))]
pub async fn update_item(pool: &Pool, item: &DistributionItem) -> Result<()> {
    let done = sqlx::query(
        "UPDATE contentsync_queue_distribution_items \
         SET status = ?, posts = ?, destination = ?, error = ?, time = CURRENT_TIMESTAMP WHERE ID = ?",
    )
    .bind(item.status.as_str())
    .bind(serde_json::to_string(&item.posts)?)
    .bind(serde_json::to_string(&item.destination)?)
    .bind(item.error.as_deref())
    .bind(item.id)
    .execute(pool)
    .await?;
    if done.rows_affected() == 0 {
        return Err(anyhow!("distribution item {} not found", item.id));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_item_status(
    pool: &Pool,
    id: i64,
    status: ItemStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE contentsync_queue_distribution_items \
         SET status = ?, error = ?, time = CURRENT_TIMESTAMP WHERE ID = ?",
    )
    .bind(status.as_str())
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_item(pool: &Pool, id: i64) -> Result<Option<DistributionItem>> {
    let row = sqlx::query("SELECT * FROM contentsync_queue_distribution_items WHERE ID = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_item).transpose()
}

/// Items newest first, optionally filtered by status.
#[instrument(skip_all)]
pub async fn list_items(
    pool: &Pool,
    status: Option<ItemStatus>,
    limit: i64,
) -> Result<Vec<DistributionItem>> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT * FROM contentsync_queue_distribution_items");
    if let Some(status) = status {
        qb.push(" WHERE status = ").push_bind(status.as_str());
    }
    qb.push(" ORDER BY ID DESC LIMIT ").push_bind(limit);
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(row_to_item).collect()
}

/// Delete items last touched more than `days` ago, whatever their status.
#[instrument(skip_all)]
pub async fn delete_items_older_than(pool: &Pool, days: i64) -> Result<u64> {
    let done = sqlx::query(
        "DELETE FROM contentsync_queue_distribution_items \
         WHERE datetime(time) < datetime('now', ? || ' days')",
    )
    .bind(-days)
    .execute(pool)
    .await?;
    Ok(done.rows_affected())
}

#[instrument(skip_all)]
pub async fn enqueue_task(
    pool: &Pool,
    task_name: &str,
    args: &Value,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO contentsync_scheduled_tasks (task_name, args, attempt, due_at) \
         VALUES (?, ?, 0, ?) RETURNING id",
    )
    .bind(task_name)
    .bind(serde_json::to_string(args)?)
    .bind(due_at.format("%Y-%m-%d %H:%M:%S").to_string())
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due_task(pool: &Pool) -> Result<Option<ScheduledTask>> {
    let row = sqlx::query(
        "SELECT id, task_name, args, attempt FROM contentsync_scheduled_tasks \
         WHERE datetime(due_at) <= CURRENT_TIMESTAMP ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let args: String = row.get("args");
    Ok(Some(ScheduledTask {
        id: row.get("id"),
        task_name: row.get("task_name"),
        args: serde_json::from_str(&args).unwrap_or(Value::Null),
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all)]
pub async fn delete_task(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM contentsync_scheduled_tasks WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Push a task back: 5s * 2^attempt, capped at `max_cap_secs` (no cap when <= 0).
#[instrument(skip_all)]
pub async fn backoff_task_with_cap(pool: &Pool, id: i64, attempt: i32, max_cap_secs: i64) -> Result<()> {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    let secs = if max_cap_secs > 0 { secs.min(max_cap_secs) } else { secs };
    sqlx::query(
        "UPDATE contentsync_scheduled_tasks SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_pending_tasks(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contentsync_scheduled_tasks")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{BlogDestination, DestinationOverrides};
    use crate::post::PreparedPost;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn new_item() -> NewDistributionItem {
        let mut posts = PreparedPosts::new();
        posts.insert(
            10,
            PreparedPost {
                id: 10,
                post_type: "post".into(),
                ..Default::default()
            },
        );
        NewDistributionItem {
            posts,
            destination: Destination::Blog(BlogDestination::new(2, &DestinationOverrides::default())),
            origin: None,
            origin_id: None,
        }
    }

    #[tokio::test]
    async fn item_lifecycle() {
        let pool = setup_pool().await;
        let id = insert_item(&pool, &new_item()).await.unwrap();
        let mut item = fetch_item(&pool, id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Init);
        assert_eq!(item.destination.key(), "2");
        assert_eq!(item.posts.keys().copied().collect::<Vec<_>>(), vec![10]);

        item.status = ItemStatus::Failed;
        item.error = Some("boom".into());
        update_item(&pool, &item).await.unwrap();
        let failed = list_items(&pool, Some(ItemStatus::Failed), 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.as_deref(), Some("boom"));

        assert_eq!(delete_items_older_than(&pool, 3).await.unwrap(), 0);
        sqlx::query("UPDATE contentsync_queue_distribution_items SET time = datetime('now', '-4 days')")
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(delete_items_older_than(&pool, 3).await.unwrap(), 1);
        assert!(fetch_item(&pool, id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_items_are_rejected() {
        let pool = setup_pool().await;
        let mut item = new_item();
        item.posts.clear();
        let err = insert_item(&pool, &item).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::Validation(_))));
    }

    #[tokio::test]
    async fn tasks_back_off() {
        let pool = setup_pool().await;
        let id = enqueue_task(&pool, "contentsync_distribute_item", &serde_json::json!({"item_id": 1}), Utc::now())
            .await
            .unwrap();
        let task = next_due_task(&pool).await.unwrap().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.args["item_id"], 1);

        backoff_task_with_cap(&pool, id, task.attempt, 60).await.unwrap();
        assert!(next_due_task(&pool).await.unwrap().is_none());
        assert_eq!(count_pending_tasks(&pool).await.unwrap(), 1);
        delete_task(&pool, id).await.unwrap();
        assert_eq!(count_pending_tasks(&pool).await.unwrap(), 0);
    }
}
