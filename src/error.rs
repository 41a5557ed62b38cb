use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuillError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("File does not match declared dialect: {0}")]
    Dialect(String),

    #[error("Schema violation on field '{field}': {reason}")]
    SchemaViolation { field: String, reason: String },

    #[error("Transform step '{step}' failed: {reason}")]
    Transform { step: String, reason: String },

    #[error("Validation rule '{rule}' failed: {message}")]
    ValidationFailure { rule: String, message: String },

    #[error("Provenance integrity error: {0}")]
    ProvenanceIntegrity(String),

    #[error("Double-entry violation: debits and credits differ by {delta_cents} cents")]
    DoubleEntryViolation { delta_cents: i64 },

    #[error("Working copy of plan {0} changed since last read; re-read and retry")]
    ConcurrentEdit(i64),

    #[error("Committed plan version {0} cannot be mutated")]
    ImmutabilityViolation(i64),

    #[error("A reconciliation session is already active for account {0}")]
    SessionInProgress(i64),

    #[error("Commit-mode runs require a committed plan version, not a working copy")]
    WorkingCopyCommit,

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Unknown parse plan: {0}")]
    UnknownPlan(String),

    #[error("Unknown plan version: {0}")]
    UnknownVersion(i64),

    #[error("Unknown parse run: {0}")]
    UnknownRun(i64),

    #[error("Assistant call failed: {0}")]
    Assistant(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, QuillError>;
