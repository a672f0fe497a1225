//! Typed failures surfaced by distribution and import.
//!
//! Plumbing code returns `anyhow::Result`; these variants are wrapped into it
//! where a caller may need to branch on the kind of failure.
use crate::model::PostId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("post {0} not found")]
    PostNotFound(PostId),
    #[error("distribution item {0} not found")]
    ItemNotFound(i64),
    /// Some parts of a batch failed; `completed` lists what did succeed.
    #[error("{}", .errors.join("; "))]
    Partial {
        completed: Vec<i64>,
        errors: Vec<String>,
    },
    #[error("post {post_id} could not be imported: {message}")]
    Import { post_id: PostId, message: String },
    #[error("remote site {network_url} rejected the distribution: {message}")]
    Remote {
        network_url: String,
        message: String,
    },
    #[error("distribution item {item_id} could not be scheduled: {message}")]
    Scheduling { item_id: i64, message: String },
    #[error("post could not be deleted, not found by global ID {gid}")]
    NotFoundByGid { gid: String },
}

impl SyncError {
    pub fn partial(completed: Vec<i64>, errors: Vec<String>) -> Self {
        SyncError::Partial { completed, errors }
    }
}

/// Collect per-part failures of a batch and turn them into one result.
#[derive(Debug, Default)]
pub struct BatchErrors {
    completed: Vec<i64>,
    errors: Vec<String>,
}

impl BatchErrors {
    pub fn complete(&mut self, id: i64) {
        self.completed.push(id);
    }

    pub fn extend_completed(&mut self, ids: impl IntoIterator<Item = i64>) {
        self.completed.extend(ids);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Fold another failure in, keeping the completed IDs of a nested partial error.
    pub fn absorb(&mut self, err: anyhow::Error) {
        match err.downcast::<SyncError>() {
            Ok(SyncError::Partial { completed, errors }) => {
                self.completed.extend(completed);
                self.errors.extend(errors);
            }
            Ok(other) => self.errors.push(other.to_string()),
            Err(other) => self.errors.push(format!("{other:#}")),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> anyhow::Result<Vec<i64>> {
        if self.errors.is_empty() {
            Ok(self.completed)
        } else {
            Err(SyncError::partial(self.completed, self.errors).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_without_errors_returns_completed_ids() {
        let mut batch = BatchErrors::default();
        batch.complete(1);
        batch.complete(2);
        assert_eq!(batch.into_result().unwrap(), vec![1, 2]);
    }

    #[test]
    fn partial_error_keeps_completed_ids_and_joins_messages() {
        let mut batch = BatchErrors::default();
        batch.complete(7);
        batch.fail("blog 3: boom");
        batch.absorb(SyncError::partial(vec![8], vec!["blog 4: bang".into()]).into());
        let err = batch.into_result().unwrap_err();
        assert_eq!(err.to_string(), "blog 3: boom; blog 4: bang");
        match err.downcast::<SyncError>().unwrap() {
            SyncError::Partial { completed, errors } => {
                assert_eq!(completed, vec![7, 8]);
                assert_eq!(errors.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
