use crate::error::QueryError;
use crate::labeler::Labeler;
use crate::models::{OwnerId, QueryResolution};
use crate::traits::MetadataIndex;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct QueryResolver {
    labeler: Arc<Labeler>,
    index: Arc<dyn MetadataIndex>,
}

impl QueryResolver {
    pub fn new(labeler: Arc<Labeler>, index: Arc<dyn MetadataIndex>) -> Self {
        Self { labeler, index }
    }

    pub async fn resolve(&self, owner: &OwnerId, text: &str) -> Result<QueryResolution, QueryError> {
        if text.trim().is_empty() {
            return Err(QueryError::Validation("query is empty".to_string()));
        }

        let label = self.labeler.reduce(text).await?;
        let record = self
            .index
            .find_by_partial_label(owner, label.as_str())
            .await?;
        debug!(label = %label, found = record.is_some(), "query resolved");

        Ok(QueryResolution {
            found: record.is_some(),
            storage_ref: record.map(|record| record.storage_ref),
            label,
        })
    }
}
