//! Rows of the distribution queue tables.
//!
//! Keep these structs focused on the data returned by queries. The state
//! machine that moves items along lives in `distributor`.

use crate::destination::Destination;
use crate::model::ItemStatus;
use crate::post::PreparedPosts;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One persisted unit of queued work: a post set and a single destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionItem {
    #[serde(rename = "ID")]
    pub id: i64,
    pub status: ItemStatus,
    pub posts: PreparedPosts,
    pub destination: Destination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last time the row was written.
    pub time: NaiveDateTime,
}

/// Fields of an item that does not have an ID yet.
#[derive(Debug, Clone)]
pub struct NewDistributionItem {
    pub posts: PreparedPosts,
    pub destination: Destination,
    pub origin: Option<String>,
    pub origin_id: Option<i64>,
}

/// Row of `contentsync_scheduled_tasks`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub id: i64,
    pub task_name: String,
    pub args: serde_json::Value,
    pub attempt: i32,
}
