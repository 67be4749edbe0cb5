use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("row {id} has an unreadable timestamp '{value}'")]
    Timestamp { id: i64, value: String },
}

/// Outcome of a pipeline run that did not produce a record.
///
/// Only `Persistence` is a fault; the rest are normal traffic.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source package not allow-listed")]
    FilteredOut,
    #[error("notification title is blank")]
    ExtractionSkipped,
    #[error("duplicate of a recent detection: {title} / {artist}")]
    DuplicateSuppressed { title: String, artist: String },
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}
