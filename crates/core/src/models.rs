use crate::error::StorageError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Opaque bearer token, forwarded to the object store and never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct DelegatedCredential(String);

impl DelegatedCredential {
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            None
        } else {
            Some(Self(token))
        }
    }

    pub fn from_authorization(header: &str) -> Option<Self> {
        let (scheme, token) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        Self::new(token)
    }

    pub fn bearer_token(&self) -> &str {
        &self.0
    }

    /// sha256 of the token.
    pub fn scope_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Debug for DelegatedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DelegatedCredential(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CanonicalLabel(pub(crate) String);

impl CanonicalLabel {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(pub String);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Account id reported by the object store; survives token refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct StorageSession {
    pub credential: DelegatedCredential,
    pub owner: OwnerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageReference {
    pub object_id: String,
    pub web_link: String,
    pub container_id: ContainerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub reference: StorageReference,
    pub name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy)]
pub struct NewObject<'a> {
    pub name: &'a str,
    pub mime_type: &'a str,
    pub bytes: &'a [u8],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectFilter {
    pub name_contains: Option<String>,
    pub mime_type: Option<String>,
}

impl ObjectFilter {
    pub fn matches(&self, name: &str, mime_type: &str) -> bool {
        let name_ok = self
            .name_contains
            .as_ref()
            .map_or(true, |needle| name.to_lowercase().contains(&needle.to_lowercase()));
        let mime_ok = self
            .mime_type
            .as_ref()
            .map_or(true, |wanted| wanted.eq_ignore_ascii_case(mime_type));
        name_ok && mime_ok
    }
}

pub type ObjectBody = BoxStream<'static, Result<Bytes, StorageError>>;

pub struct ObjectDownload {
    pub name: String,
    pub mime_type: String,
    pub body: ObjectBody,
}

impl fmt::Debug for ObjectDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDownload")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    pub id: String,
    pub owner: OwnerId,
    pub label: CanonicalLabel,
    pub storage_ref: StorageReference,
    pub original_name: String,
    pub mime_type: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FileOutcome {
    #[serde(rename_all = "camelCase")]
    Stored {
        original_file_name: String,
        label: CanonicalLabel,
        storage_ref: StorageReference,
        warning: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        original_file_name: String,
        error: String,
    },
}

impl FileOutcome {
    pub fn original_file_name(&self) -> &str {
        match self {
            FileOutcome::Stored {
                original_file_name, ..
            }
            | FileOutcome::Failed {
                original_file_name, ..
            } => original_file_name,
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, FileOutcome::Stored { .. })
    }

    pub fn storage_ref(&self) -> Option<&StorageReference> {
        match self {
            FileOutcome::Stored { storage_ref, .. } => Some(storage_ref),
            FileOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub success: bool,
    pub results: Vec<FileOutcome>,
}

impl BatchReport {
    pub fn stored_count(&self) -> usize {
        self.results.iter().filter(|item| item.is_stored()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.len() - self.stored_count()
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResolution {
    pub label: CanonicalLabel,
    pub found: bool,
    pub storage_ref: Option<StorageReference>,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub container_name: String,
    pub upload_dir: PathBuf,
    pub request_timeout: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            container_name: "DocVault".to_string(),
            upload_dir: std::env::temp_dir().join("docvault-uploads"),
            request_timeout: Some(Duration::from_secs(120)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DelegatedCredential, ObjectFilter};

    #[test]
    fn bearer_header_is_parsed_case_insensitively() {
        let credential = DelegatedCredential::from_authorization("bearer ya29.token")
            .expect("bearer header should parse");
        assert_eq!(credential.bearer_token(), "ya29.token");

        assert!(DelegatedCredential::from_authorization("Basic abc").is_none());
        assert!(DelegatedCredential::from_authorization("Bearer   ").is_none());
    }

    #[test]
    fn credential_debug_output_is_redacted() {
        let credential = DelegatedCredential::new("secret-token").expect("non-empty token");
        assert!(!format!("{credential:?}").contains("secret-token"));
    }

    #[test]
    fn object_filter_matches_name_and_mime() {
        let filter = ObjectFilter {
            name_contains: Some("Pass".to_string()),
            mime_type: Some("application/pdf".to_string()),
        };
        assert!(filter.matches("passport.pdf", "application/pdf"));
        assert!(!filter.matches("passport.jpg", "image/jpeg"));
        assert!(ObjectFilter::default().matches("anything", "any/type"));
    }
}
