/// Batch item identifiers are random v4 UUIDs assigned at submission.
pub type ItemId = uuid::Uuid;

/// Pool task identifiers are random v4 UUIDs assigned at enqueue time.
pub type TaskId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
