//! Moving posts between blogs: export, conflict matching and import.
pub mod archive;
pub mod conflict;
pub mod export;
pub mod import;
pub mod markers;
pub mod media;
pub mod prepared;
pub mod references;
pub mod resolution;

pub use conflict::{find_existing_post, get_posts_with_conflicts};
pub use export::{export_post, export_posts, Exporter};
pub use import::{ConflictDecision, ConflictDecisions, Importer};
pub use media::MediaSource;
pub use prepared::{PreparedPost, PreparedPosts};
pub use resolution::ResolutionTable;
