use crate::error::StorageError;
use crate::models::{
    ContainerId, DelegatedCredential, NewObject, ObjectDownload, ObjectFilter, OwnerId,
    StorageReference, StoredObject,
};
use crate::traits::ObjectStore;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use uuid::Uuid;

struct MemoryContainer {
    id: ContainerId,
    owner: String,
    name: String,
}

struct MemoryObject {
    owner: String,
    container: ContainerId,
    name: String,
    mime_type: String,
    bytes: Bytes,
}

pub struct InMemoryObjectStore {
    containers: RwLock<Vec<MemoryContainer>>,
    objects: RwLock<HashMap<String, MemoryObject>>,
    created: AtomicUsize,
    latency: Option<Duration>,
    failing_names: RwLock<Vec<String>>,
    revoked: RwLock<Vec<String>>,
    accounts: RwLock<HashMap<String, String>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(Vec::new()),
            objects: RwLock::new(HashMap::new()),
            created: AtomicUsize::new(0),
            latency: None,
            failing_names: RwLock::new(Vec::new()),
            revoked: RwLock::new(Vec::new()),
            accounts: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::new()
        }
    }

    pub fn containers_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().map(|objects| objects.len()).unwrap_or(0)
    }

    /// Makes `create_object` fail for names containing `fragment`.
    pub fn fail_uploads_matching(&self, fragment: impl Into<String>) {
        if let Ok(mut failing) = self.failing_names.write() {
            failing.push(fragment.into());
        }
    }

    /// Binds a credential to a named account, like a refreshed token.
    pub fn link_account(&self, credential: &DelegatedCredential, account: impl Into<String>) {
        if let Ok(mut accounts) = self.accounts.write() {
            accounts.insert(credential.scope_key(), account.into());
        }
    }

    /// Every later call with this credential fails with `Unauthorized`.
    pub fn revoke(&self, credential: &DelegatedCredential) {
        if let Ok(mut revoked) = self.revoked.write() {
            revoked.push(credential.scope_key());
        }
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    async fn authorize(&self, credential: &DelegatedCredential) -> Result<String, StorageError> {
        self.pause().await;
        let scope = credential.scope_key();
        let revoked = self.revoked.read().map_err(|_| Self::poisoned())?;
        if revoked.contains(&scope) {
            return Err(StorageError::Unauthorized {
                backend: "memory".to_string(),
            });
        }
        let accounts = self.accounts.read().map_err(|_| Self::poisoned())?;
        Ok(accounts.get(&scope).cloned().unwrap_or(scope))
    }

    fn poisoned() -> StorageError {
        StorageError::BackendResponse {
            backend: "memory".to_string(),
            details: "lock poisoned".to_string(),
        }
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn owner_id(&self, credential: &DelegatedCredential) -> Result<OwnerId, StorageError> {
        Ok(OwnerId(self.authorize(credential).await?))
    }

    async fn find_container(
        &self,
        credential: &DelegatedCredential,
        name: &str,
    ) -> Result<Option<ContainerId>, StorageError> {
        let owner = self.authorize(credential).await?;
        let containers = self.containers.read().map_err(|_| Self::poisoned())?;
        Ok(containers
            .iter()
            .find(|container| container.owner == owner && container.name == name)
            .map(|container| container.id.clone()))
    }

    async fn create_container(
        &self,
        credential: &DelegatedCredential,
        name: &str,
    ) -> Result<ContainerId, StorageError> {
        let owner = self.authorize(credential).await?;
        let id = ContainerId(format!("folder-{}", Uuid::new_v4().simple()));
        let mut containers = self.containers.write().map_err(|_| Self::poisoned())?;
        containers.push(MemoryContainer {
            id: id.clone(),
            owner,
            name: name.to_string(),
        });
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn create_object(
        &self,
        credential: &DelegatedCredential,
        container: &ContainerId,
        object: NewObject<'_>,
    ) -> Result<StorageReference, StorageError> {
        let owner = self.authorize(credential).await?;

        {
            let containers = self.containers.read().map_err(|_| Self::poisoned())?;
            if !containers
                .iter()
                .any(|known| &known.id == container && known.owner == owner)
            {
                return Err(StorageError::ContainerNotFound(container.to_string()));
            }
        }

        {
            let failing = self.failing_names.read().map_err(|_| Self::poisoned())?;
            if failing.iter().any(|fragment| object.name.contains(fragment.as_str())) {
                return Err(StorageError::BackendResponse {
                    backend: "memory".to_string(),
                    details: format!("upload of {} rejected", object.name),
                });
            }
        }

        let object_id = Uuid::new_v4().simple().to_string();
        let reference = StorageReference {
            web_link: format!("memory://{}/{}", container, object_id),
            object_id: object_id.clone(),
            container_id: container.clone(),
        };

        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.insert(
            object_id,
            MemoryObject {
                owner,
                container: container.clone(),
                name: object.name.to_string(),
                mime_type: object.mime_type.to_string(),
                bytes: Bytes::copy_from_slice(object.bytes),
            },
        );

        Ok(reference)
    }

    async fn rename_object(
        &self,
        credential: &DelegatedCredential,
        reference: &StorageReference,
        new_name: &str,
    ) -> Result<(), StorageError> {
        let owner = self.authorize(credential).await?;
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        match objects.get_mut(&reference.object_id) {
            Some(object) if object.owner == owner => {
                object.name = new_name.to_string();
                Ok(())
            }
            _ => Err(StorageError::NotFound(reference.object_id.clone())),
        }
    }

    async fn list_objects(
        &self,
        credential: &DelegatedCredential,
        container: &ContainerId,
        filter: &ObjectFilter,
    ) -> Result<Vec<StoredObject>, StorageError> {
        let owner = self.authorize(credential).await?;
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;

        let mut listed = objects
            .iter()
            .filter(|(_, object)| object.owner == owner && &object.container == container)
            .filter(|(_, object)| filter.matches(&object.name, &object.mime_type))
            .map(|(id, object)| StoredObject {
                reference: StorageReference {
                    object_id: id.clone(),
                    web_link: format!("memory://{}/{}", container, id),
                    container_id: container.clone(),
                },
                name: object.name.clone(),
                mime_type: object.mime_type.clone(),
            })
            .collect::<Vec<_>>();

        listed.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(listed)
    }

    async fn read_object(
        &self,
        credential: &DelegatedCredential,
        reference: &StorageReference,
    ) -> Result<ObjectDownload, StorageError> {
        let owner = self.authorize(credential).await?;
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        let object = objects
            .get(&reference.object_id)
            .filter(|object| object.owner == owner)
            .ok_or_else(|| StorageError::NotFound(reference.object_id.clone()))?;

        let bytes = object.bytes.clone();
        Ok(ObjectDownload {
            name: object.name.clone(),
            mime_type: object.mime_type.clone(),
            body: stream::once(async move { Ok(bytes) }).boxed(),
        })
    }
}
