use crate::error::{IndexError, LabelError, StorageError};
use crate::models::{
    CanonicalLabel, ContainerId, DelegatedCredential, IndexRecord, NewObject, ObjectDownload,
    ObjectFilter, OwnerId, StorageReference, StoredObject,
};
use async_trait::async_trait;

#[derive(Debug, Clone, Copy)]
pub struct Attachment<'a> {
    pub bytes: &'a [u8],
    pub mime_type: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct LabelRequest<'a> {
    pub prompt: &'a str,
    pub attachment: Option<Attachment<'a>>,
}

#[async_trait]
pub trait LabelStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: LabelRequest<'_>) -> Result<String, LabelError>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn backend(&self) -> &str;

    /// Account behind the credential. `Unauthorized` when the store rejects it.
    async fn owner_id(&self, credential: &DelegatedCredential) -> Result<OwnerId, StorageError>;

    /// Oldest container with exactly this name, if any.
    async fn find_container(
        &self,
        credential: &DelegatedCredential,
        name: &str,
    ) -> Result<Option<ContainerId>, StorageError>;

    async fn create_container(
        &self,
        credential: &DelegatedCredential,
        name: &str,
    ) -> Result<ContainerId, StorageError>;

    async fn create_object(
        &self,
        credential: &DelegatedCredential,
        container: &ContainerId,
        object: NewObject<'_>,
    ) -> Result<StorageReference, StorageError>;

    async fn rename_object(
        &self,
        credential: &DelegatedCredential,
        reference: &StorageReference,
        new_name: &str,
    ) -> Result<(), StorageError>;

    async fn list_objects(
        &self,
        credential: &DelegatedCredential,
        container: &ContainerId,
        filter: &ObjectFilter,
    ) -> Result<Vec<StoredObject>, StorageError>;

    async fn read_object(
        &self,
        credential: &DelegatedCredential,
        reference: &StorageReference,
    ) -> Result<ObjectDownload, StorageError>;
}

#[async_trait]
pub trait MetadataIndex: Send + Sync {
    async fn insert(&self, record: &IndexRecord) -> Result<(), IndexError>;

    async fn find_by_label(
        &self,
        owner: &OwnerId,
        label: &CanonicalLabel,
    ) -> Result<Option<IndexRecord>, IndexError>;

    /// First inserted record of `owner` whose label contains `fragment`.
    async fn find_by_partial_label(
        &self,
        owner: &OwnerId,
        fragment: &str,
    ) -> Result<Option<IndexRecord>, IndexError>;

    async fn find_by_object_id(
        &self,
        owner: &OwnerId,
        object_id: &str,
    ) -> Result<Option<IndexRecord>, IndexError>;

    async fn list(&self, owner: &OwnerId, limit: usize) -> Result<Vec<IndexRecord>, IndexError>;
}
