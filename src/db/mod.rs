//! Database module: entity models and SQL repositories.
//!
//! - `model`: typed rows returned by repositories.
//! - `repo`: SQL-only functions for distribution items and scheduled tasks.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{DistributionItem, NewDistributionItem, ScheduledTask};
