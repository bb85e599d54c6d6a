use crate::error::IndexError;
use crate::models::{CanonicalLabel, IndexRecord, OwnerId};
use crate::traits::MetadataIndex;
use async_trait::async_trait;
use std::sync::RwLock;

/// Append-only index held in a vector; insertion order decides "first match".
#[derive(Default)]
pub struct InMemoryIndex {
    records: RwLock<Vec<IndexRecord>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find<F>(&self, owner: &OwnerId, predicate: F) -> Result<Option<IndexRecord>, IndexError>
    where
        F: Fn(&IndexRecord) -> bool,
    {
        let records = self
            .records
            .read()
            .map_err(|_| IndexError::CorruptRow("index lock poisoned".to_string()))?;
        Ok(records
            .iter()
            .find(|record| &record.owner == owner && predicate(record))
            .cloned())
    }
}

#[async_trait]
impl MetadataIndex for InMemoryIndex {
    async fn insert(&self, record: &IndexRecord) -> Result<(), IndexError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| IndexError::CorruptRow("index lock poisoned".to_string()))?;
        records.push(record.clone());
        Ok(())
    }

    async fn find_by_label(
        &self,
        owner: &OwnerId,
        label: &CanonicalLabel,
    ) -> Result<Option<IndexRecord>, IndexError> {
        self.find(owner, |record| &record.label == label)
    }

    async fn find_by_partial_label(
        &self,
        owner: &OwnerId,
        fragment: &str,
    ) -> Result<Option<IndexRecord>, IndexError> {
        self.find(owner, |record| record.label.as_str().contains(fragment))
    }

    async fn find_by_object_id(
        &self,
        owner: &OwnerId,
        object_id: &str,
    ) -> Result<Option<IndexRecord>, IndexError> {
        self.find(owner, |record| record.storage_ref.object_id == object_id)
    }

    async fn list(&self, owner: &OwnerId, limit: usize) -> Result<Vec<IndexRecord>, IndexError> {
        let records = self
            .records
            .read()
            .map_err(|_| IndexError::CorruptRow("index lock poisoned".to_string()))?;
        Ok(records
            .iter()
            .filter(|record| &record.owner == owner)
            .take(limit)
            .cloned()
            .collect())
    }
}
