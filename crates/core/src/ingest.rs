use crate::error::{IngestError, LabelError, StorageError};
use crate::labeler::Labeler;
use crate::models::{
    BatchReport, CanonicalLabel, FileOutcome, IndexRecord, NewObject, PipelineOptions,
    StorageReference, StorageSession,
};
use crate::storage::StorageConnector;
use crate::traits::MetadataIndex;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Deleted by `remove`, or by `Drop` if the owning task is cancelled.
#[derive(Debug)]
pub struct TempUpload {
    path: PathBuf,
    writer: Option<tokio::fs::File>,
    removed: bool,
}

impl TempUpload {
    pub async fn begin(dir: &Path) -> Result<Self, IngestError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("upload-{}", Uuid::new_v4().simple()));
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self {
            path,
            writer: Some(file),
            removed: false,
        })
    }

    pub async fn from_bytes(dir: &Path, bytes: &[u8]) -> Result<Self, IngestError> {
        let mut upload = Self::begin(dir).await?;
        upload.write_chunk(bytes).await?;
        upload.finish().await?;
        Ok(upload)
    }

    pub async fn copy_of(dir: &Path, source: &Path) -> Result<Self, IngestError> {
        let mut upload = Self::begin(dir).await?;
        upload.finish().await?;
        tokio::fs::copy(source, &upload.path).await?;
        Ok(upload)
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), IngestError> {
        match self.writer.as_mut() {
            Some(file) => Ok(file.write_all(chunk).await?),
            None => Err(IngestError::Validation(format!(
                "temp upload {} is already closed",
                self.path.display()
            ))),
        }
    }

    pub async fn finish(&mut self) -> Result<(), IngestError> {
        if let Some(mut file) = self.writer.take() {
            file.flush().await?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    pub async fn remove(mut self) {
        self.writer.take();
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!(path = %self.path.display(), error = %error, "failed to remove temp upload"),
        }
        self.removed = true;
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if !self.removed {
            self.writer.take();
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[derive(Debug)]
pub struct UploadedFile {
    pub original_name: String,
    pub mime_type: String,
    pub temp: TempUpload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexStatus {
    Recorded,
    Failed,
    NotAttempted,
}

struct PipelineShared {
    labeler: Arc<Labeler>,
    storage: Arc<StorageConnector>,
    index: Arc<dyn MetadataIndex>,
    options: PipelineOptions,
}

#[derive(Clone)]
pub struct IngestionPipeline {
    shared: Arc<PipelineShared>,
}

impl IngestionPipeline {
    pub fn new(
        labeler: Arc<Labeler>,
        storage: Arc<StorageConnector>,
        index: Arc<dyn MetadataIndex>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                labeler,
                storage,
                index,
                options,
            }),
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.shared.options
    }

    pub async fn ingest(
        &self,
        session: &StorageSession,
        files: Vec<UploadedFile>,
    ) -> Result<BatchReport, IngestError> {
        if files.is_empty() {
            return Err(IngestError::Validation("no files uploaded".to_string()));
        }

        // A rejected credential fails the whole batch before anything is labeled.
        let container_name = &self.shared.options.container_name;
        match self
            .shared
            .storage
            .get_or_create_container(session, container_name)
            .await
        {
            Ok(_) => {}
            Err(StorageError::Unauthorized { backend }) => {
                warn!(backend = %backend, owner = %session.owner, "storage rejected the credential");
                return Err(IngestError::Auth);
            }
            Err(error) => {
                warn!(container = %container_name, error = %error, "container not resolved up front");
            }
        }

        let names: Vec<String> = files.iter().map(|file| file.original_name.clone()).collect();
        let mut slots: Vec<Option<(FileOutcome, IndexStatus)>> = vec![None; files.len()];
        let mut tasks = JoinSet::new();

        for (position, file) in files.into_iter().enumerate() {
            let shared = self.shared.clone();
            let session = session.clone();
            tasks.spawn(async move { (position, process_file(&shared, &session, file).await) });
        }

        let deadline = self
            .shared
            .options
            .request_timeout
            .map(|timeout| Instant::now() + timeout);
        let mut timed_out = false;

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        timed_out = true;
                        tasks.abort_all();
                        break;
                    }
                },
                None => tasks.join_next().await,
            };

            match next {
                Some(Ok((position, outcome))) => slots[position] = Some(outcome),
                Some(Err(error)) => warn!(error = %error, "file task did not complete"),
                None => break,
            }
        }

        // Aborted tasks finish dropping (and so deleting their temp files) before this drains.
        while let Some(joined) = tasks.join_next().await {
            if let Ok((position, outcome)) = joined {
                slots[position] = Some(outcome);
            }
        }

        let mut index_failures = 0usize;
        let mut recorded = 0usize;
        let results: Vec<FileOutcome> = slots
            .into_iter()
            .zip(names)
            .map(|(slot, original_file_name)| match slot {
                Some((outcome, status)) => {
                    match status {
                        IndexStatus::Recorded => recorded += 1,
                        IndexStatus::Failed => index_failures += 1,
                        IndexStatus::NotAttempted => {}
                    }
                    outcome
                }
                None => FileOutcome::Failed {
                    original_file_name,
                    error: if timed_out {
                        "request timed out".to_string()
                    } else {
                        "processing task failed".to_string()
                    },
                },
            })
            .collect();

        if index_failures > 0 && recorded == 0 {
            return Err(IngestError::IndexUnavailable(format!(
                "{index_failures} stored file(s) could not be indexed"
            )));
        }

        let report = BatchReport {
            success: true,
            results,
        };
        info!(
            files = report.results.len(),
            stored = report.stored_count(),
            failed = report.failed_count(),
            timed_out,
            "ingestion batch settled"
        );
        Ok(report)
    }

    /// Originals are copied first and never deleted.
    pub async fn ingest_folder(
        &self,
        session: &StorageSession,
        folder: &Path,
    ) -> Result<BatchReport, IngestError> {
        let paths = discover_files(folder);
        if paths.is_empty() {
            return Err(IngestError::Validation(format!(
                "no files found in {}",
                folder.display()
            )));
        }

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let original_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("unnamed")
                .to_string();
            let temp = TempUpload::copy_of(&self.shared.options.upload_dir, &path).await?;
            files.push(UploadedFile {
                mime_type: mime_from_name(&original_name).to_string(),
                original_name,
                temp,
            });
        }

        self.ingest(session, files).await
    }
}

enum FileFailure {
    Read(std::io::Error),
    Label(LabelError),
    Store(StorageError),
}

impl std::fmt::Display for FileFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileFailure::Read(error) => write!(f, "could not read upload: {error}"),
            FileFailure::Label(error) => write!(f, "labeling failed: {error}"),
            FileFailure::Store(error) => write!(f, "storage failed: {error}"),
        }
    }
}

async fn process_file(
    shared: &PipelineShared,
    session: &StorageSession,
    file: UploadedFile,
) -> (FileOutcome, IndexStatus) {
    let UploadedFile {
        original_name,
        mime_type,
        temp,
    } = file;

    let stored = label_and_store(shared, session, &original_name, &mime_type, &temp).await;
    temp.remove().await;

    let (label, storage_ref, bytes_checksum) = match stored {
        Ok(stored) => stored,
        Err(failure) => {
            warn!(file = %original_name, error = %failure, "file not stored");
            return (
                FileOutcome::Failed {
                    original_file_name: original_name,
                    error: failure.to_string(),
                },
                IndexStatus::NotAttempted,
            );
        }
    };

    let record = IndexRecord {
        id: Uuid::new_v4().to_string(),
        owner: session.owner.clone(),
        label: label.clone(),
        storage_ref: storage_ref.clone(),
        original_name: original_name.clone(),
        mime_type,
        checksum: bytes_checksum,
        created_at: Utc::now(),
    };

    let (warning, status) = match shared.index.insert(&record).await {
        Ok(()) => (None, IndexStatus::Recorded),
        Err(error) => {
            warn!(file = %original_name, object = %storage_ref.object_id, error = %error, "stored file could not be indexed");
            (
                Some(format!("stored but not indexed, lookup by label will miss it: {error}")),
                IndexStatus::Failed,
            )
        }
    };

    (
        FileOutcome::Stored {
            original_file_name: original_name,
            label,
            storage_ref,
            warning,
        },
        status,
    )
}

async fn label_and_store(
    shared: &PipelineShared,
    session: &StorageSession,
    original_name: &str,
    mime_type: &str,
    temp: &TempUpload,
) -> Result<(CanonicalLabel, StorageReference, String), FileFailure> {
    let bytes = temp.read().await.map_err(FileFailure::Read)?;
    let label = shared
        .labeler
        .label(&bytes, mime_type)
        .await
        .map_err(FileFailure::Label)?;

    let object_name = object_name(&label, original_name);
    let container_name = &shared.options.container_name;
    let object = NewObject {
        name: &object_name,
        mime_type,
        bytes: &bytes,
    };

    let credential = &session.credential;
    let container = shared
        .storage
        .get_or_create_container(session, container_name)
        .await
        .map_err(FileFailure::Store)?;

    let reference = match shared.storage.create_object(credential, &container, object).await {
        Err(StorageError::ContainerNotFound(_)) => {
            // Cached container was deleted remotely; resolve it again once.
            shared.storage.forget_container(session, container_name);
            let container = shared
                .storage
                .get_or_create_container(session, container_name)
                .await
                .map_err(FileFailure::Store)?;
            shared.storage.create_object(credential, &container, object).await
        }
        other => other,
    }
    .map_err(FileFailure::Store)?;

    debug!(file = %original_name, label = %label, object = %reference.object_id, "stored");
    Ok((label, reference, digest_bytes(&bytes)))
}

/// `<label><.ext>`
pub fn object_name(label: &CanonicalLabel, original_name: &str) -> String {
    let extension = Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|ch| ch.is_ascii_alphanumeric()));

    match extension {
        Some(ext) => format!("{}.{}", label, ext.to_ascii_lowercase()),
        None => label.to_string(),
    }
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn discover_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with('.'))
        })
        .filter_map(|item| item.ok())
    {
        if entry.file_type().is_file() {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn mime_from_name(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("pdf") => "application/pdf",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("csv") => "text/csv",
        Some("html" | "htm") => "text/html",
        Some("json") => "application/json",
        Some("doc") => "application/msword",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("xls") => "application/vnd.ms-excel",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}
