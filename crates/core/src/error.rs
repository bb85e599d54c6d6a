use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("{backend} answer could not be reduced to a label: {answer:?}")]
    Unparseable { backend: String, answer: String },

    #[error("no labeling strategy configured")]
    NoStrategies,

    #[error("all labeling strategies failed: {0}")]
    AllFailed(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("storage credential rejected by {backend}")]
    Unauthorized { backend: String },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt index row: {0}")]
    CorruptRow(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("missing or invalid storage credential")]
    Auth,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata index unavailable, no stored file could be recorded: {0}")]
    IndexUnavailable(String),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("labeling failed: {0}")]
    Labeling(#[from] LabelError),

    #[error("index lookup failed: {0}")]
    Index(#[from] IndexError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
