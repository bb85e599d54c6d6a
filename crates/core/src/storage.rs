use crate::error::StorageError;
use crate::models::{
    ContainerId, DelegatedCredential, NewObject, ObjectDownload, ObjectFilter, StorageReference,
    StorageSession, StoredObject,
};
use crate::traits::ObjectStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

type ContainerSlot = Arc<AsyncMutex<Option<ContainerId>>>;

/// Callers racing on one (owner, name) pair serialize on its slot. Across
/// processes `find_container` returns the oldest match.
pub struct StorageConnector {
    store: Arc<dyn ObjectStore>,
    containers: Mutex<HashMap<(String, String), ContainerSlot>>,
}

impl StorageConnector {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &str {
        self.store.backend()
    }

    pub async fn open_session(
        &self,
        credential: &DelegatedCredential,
    ) -> Result<StorageSession, StorageError> {
        let owner = self.store.owner_id(credential).await?;
        Ok(StorageSession {
            credential: credential.clone(),
            owner,
        })
    }

    fn slot(&self, session: &StorageSession, name: &str) -> ContainerSlot {
        let key = (session.owner.0.clone(), name.to_string());
        let mut containers = self
            .containers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        containers.entry(key).or_default().clone()
    }

    pub async fn get_or_create_container(
        &self,
        session: &StorageSession,
        name: &str,
    ) -> Result<ContainerId, StorageError> {
        let credential = &session.credential;
        let slot = self.slot(session, name);
        let mut cached = slot.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let id = match self.store.find_container(credential, name).await? {
            Some(existing) => existing,
            None => {
                let created = self.store.create_container(credential, name).await?;
                info!(backend = self.store.backend(), container = %name, id = %created, "created container");
                created
            }
        };

        *cached = Some(id.clone());
        Ok(id)
    }

    pub fn forget_container(&self, session: &StorageSession, name: &str) {
        let key = (session.owner.0.clone(), name.to_string());
        let mut containers = self
            .containers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        containers.remove(&key);
    }

    #[cfg(test)]
    pub(crate) fn cached_containers(&self) -> usize {
        self.containers
            .lock()
            .map(|containers| containers.len())
            .unwrap_or(0)
    }

    pub async fn create_object(
        &self,
        credential: &DelegatedCredential,
        container: &ContainerId,
        object: NewObject<'_>,
    ) -> Result<StorageReference, StorageError> {
        self.store.create_object(credential, container, object).await
    }

    pub async fn rename_object(
        &self,
        credential: &DelegatedCredential,
        reference: &StorageReference,
        new_name: &str,
    ) -> Result<(), StorageError> {
        self.store.rename_object(credential, reference, new_name).await
    }

    pub async fn list_objects(
        &self,
        credential: &DelegatedCredential,
        container: &ContainerId,
        filter: &ObjectFilter,
    ) -> Result<Vec<StoredObject>, StorageError> {
        self.store.list_objects(credential, container, filter).await
    }

    pub async fn read_object(
        &self,
        credential: &DelegatedCredential,
        reference: &StorageReference,
    ) -> Result<ObjectDownload, StorageError> {
        self.store.read_object(credential, reference).await
    }
}
