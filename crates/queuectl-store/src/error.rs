use queuectl_core::{ConfigError, JobState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Enqueue with an id that already exists.
    #[error("job id already exists: {0}")]
    DuplicateId(String),

    /// A settlement or requeue targeted a row that is missing or not in
    /// the state the operation requires.
    #[error("job {id} not found in state {expected:?}")]
    NotInState { id: String, expected: JobState },

    /// The write lock stayed contended past the internal retry budget.
    #[error("database stayed locked after {attempts} attempts")]
    Contended { attempts: u32 },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}
