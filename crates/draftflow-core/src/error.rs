use thiserror::Error;
use uuid::Uuid;

/// Core error type for draftflow operations.
#[derive(Error, Debug)]
pub enum DraftflowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Store failure that is expected to clear on its own (pool exhaustion,
    /// dropped connection, serialization conflict).
    #[error("Transient store error: {0}")]
    TransientStore(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The subject has no allowance left. `instance_id` is set when the
    /// failure happened while starting a workflow instance.
    #[error("Insufficient allowance for subject {subject_id}")]
    InsufficientAllowance {
        subject_id: String,
        instance_id: Option<Uuid>,
    },

    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Invalid transition for instance {instance_id}: expected {expected}, found {actual}")]
    InvalidTransition {
        instance_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DraftflowError {
    /// Whether retrying the same store call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }
}

impl From<serde_json::Error> for DraftflowError {
    fn from(e: serde_json::Error) -> Self {
        DraftflowError::Serialization(e.to_string())
    }
}

/// An I/O error can arrive after the server committed, so a transient
/// classification means "outcome unknown". Retried calls must be safe to
/// repeat: instance transitions are, because a committed first attempt
/// makes the retry a conflict.
impl From<sqlx::Error> for DraftflowError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::WorkerCrashed => DraftflowError::TransientStore(e.to_string()),
            sqlx::Error::Database(db)
                if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) =>
            {
                DraftflowError::TransientStore(e.to_string())
            }
            // numeric_value_out_of_range, e.g. a credit past the bigint limit
            sqlx::Error::Database(db) if db.code().as_deref() == Some("22003") => {
                DraftflowError::Validation(e.to_string())
            }
            sqlx::Error::RowNotFound => DraftflowError::NotFound(e.to_string()),
            _ => DraftflowError::Database(e.to_string()),
        }
    }
}

/// Result type alias using DraftflowError.
pub type Result<T> = std::result::Result<T, DraftflowError>;
