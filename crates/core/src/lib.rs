pub mod error;
pub mod indexes;
pub mod ingest;
pub mod labeler;
pub mod labelers;
pub mod models;
pub mod normalize;
pub mod resolver;
pub mod server;
pub mod storage;
pub mod stores;
pub mod traits;

pub use error::{IndexError, IngestError, LabelError, QueryError, StorageError};
pub use indexes::{InMemoryIndex, SqliteIndex};
pub use ingest::{
    digest_bytes, discover_files, mime_from_name, object_name, IngestionPipeline, TempUpload,
    UploadedFile,
};
pub use labeler::{Labeler, LabelerOptions, DEFAULT_CONTENT_PROMPT, DEFAULT_REDUCE_PROMPT};
pub use labelers::{GeminiConfig, GeminiLabeler, PredictConfig, PredictLabeler};
pub use models::{
    BatchReport, CanonicalLabel, ContainerId, DelegatedCredential, FileOutcome, IndexRecord,
    NewObject, ObjectDownload, ObjectFilter, OwnerId, PipelineOptions, QueryResolution,
    StorageReference, StorageSession, StoredObject,
};
pub use normalize::{normalize_label, MAX_LABEL_CHARS};
pub use resolver::QueryResolver;
pub use server::{router, run_server, AppState, ServerOptions};
pub use storage::StorageConnector;
pub use stores::{DriveConfig, DriveStore, InMemoryObjectStore};
pub use traits::{Attachment, LabelRequest, LabelStrategy, MetadataIndex, ObjectStore};
