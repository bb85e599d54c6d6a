use crate::error::StorageError;
use crate::models::{
    ContainerId, DelegatedCredential, NewObject, ObjectDownload, ObjectFilter, OwnerId,
    StorageReference, StoredObject,
};
use crate::traits::ObjectStore;
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const BACKEND: &str = "drive";

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub api_base: String,
    pub upload_base: String,
    pub timeout: Duration,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_base: "https://www.googleapis.com".to_string(),
            upload_base: "https://www.googleapis.com".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct DriveStore {
    client: Client,
    config: DriveConfig,
}

impl DriveStore {
    pub fn new(config: DriveConfig) -> Result<Self, StorageError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.config.api_base.trim_end_matches('/'))
    }

    fn about_url(&self) -> Result<Url, StorageError> {
        Ok(Url::parse_with_params(
            &format!("{}/drive/v3/about", self.config.api_base.trim_end_matches('/')),
            &[("fields", "user(permissionId)")],
        )?)
    }

    fn file_url(&self, object_id: &str) -> String {
        format!("{}/{}", self.files_url(), object_id)
    }

    fn upload_url(&self) -> Result<Url, StorageError> {
        Ok(Url::parse_with_params(
            &format!(
                "{}/upload/drive/v3/files",
                self.config.upload_base.trim_end_matches('/')
            ),
            &[("uploadType", "multipart"), ("fields", "id,webViewLink")],
        )?)
    }

    async fn send(
        &self,
        request: RequestBuilder,
        credential: &DelegatedCredential,
    ) -> Result<Response, StorageError> {
        let response = request.bearer_auth(credential.bearer_token()).send().await?;
        check_status(response).await
    }

    async fn query_files(
        &self,
        credential: &DelegatedCredential,
        query: &str,
        order_by: Option<&str>,
    ) -> Result<Vec<Value>, StorageError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("q", query.to_string()),
                ("spaces", "drive".to_string()),
                ("pageSize", "100".to_string()),
                (
                    "fields",
                    "nextPageToken,files(id,name,mimeType,webViewLink,createdTime)".to_string(),
                ),
            ];
            if let Some(order_by) = order_by {
                params.push(("orderBy", order_by.to_string()));
            }
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let url = Url::parse_with_params(&self.files_url(), &params)?;
            let parsed: Value = self
                .send(self.client.get(url), credential)
                .await?
                .json()
                .await?;

            files.extend(
                parsed
                    .pointer("/files")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            );

            page_token = parsed
                .pointer("/nextPageToken")
                .and_then(Value::as_str)
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }

        Ok(files)
    }
}

async fn check_status(response: Response) -> Result<Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StorageError::Unauthorized {
            backend: BACKEND.to_string(),
        }),
        StatusCode::NOT_FOUND => Err(StorageError::NotFound(response.url().path().to_string())),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(StorageError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("{status}: {}", body.chars().take(200).collect::<String>()),
            })
        }
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn folder_query(name: &str) -> String {
    format!(
        "name = {} and mimeType = {} and trashed = false",
        quote(name),
        quote(FOLDER_MIME)
    )
}

fn children_query(container: &ContainerId, filter: &ObjectFilter) -> String {
    let mut clauses = vec![
        format!("{} in parents", quote(&container.0)),
        "trashed = false".to_string(),
    ];
    if let Some(fragment) = &filter.name_contains {
        clauses.push(format!("name contains {}", quote(fragment)));
    }
    if let Some(mime_type) = &filter.mime_type {
        clauses.push(format!("mimeType = {}", quote(mime_type)));
    }
    clauses.join(" and ")
}

fn multipart_related(metadata: &Value, object: &NewObject<'_>, boundary: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(object.bytes.len() + 512);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{boundary}\r\nContent-Type: {}\r\n\r\n",
            object.mime_type
        )
        .as_bytes(),
    );
    body.extend_from_slice(object.bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

fn required_str(value: &Value, pointer: &str) -> Result<String, StorageError> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StorageError::BackendResponse {
            backend: BACKEND.to_string(),
            details: format!("response is missing {pointer}"),
        })
}

fn fallback_link(object_id: &str) -> String {
    format!("https://drive.google.com/file/d/{object_id}/view")
}

#[async_trait]
impl ObjectStore for DriveStore {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn owner_id(&self, credential: &DelegatedCredential) -> Result<OwnerId, StorageError> {
        let about: Value = self
            .send(self.client.get(self.about_url()?), credential)
            .await?
            .json()
            .await?;
        Ok(OwnerId(required_str(&about, "/user/permissionId")?))
    }

    async fn find_container(
        &self,
        credential: &DelegatedCredential,
        name: &str,
    ) -> Result<Option<ContainerId>, StorageError> {
        let folders = self
            .query_files(credential, &folder_query(name), Some("createdTime"))
            .await?;

        Ok(folders
            .first()
            .and_then(|folder| folder.pointer("/id"))
            .and_then(Value::as_str)
            .map(|id| ContainerId(id.to_string())))
    }

    async fn create_container(
        &self,
        credential: &DelegatedCredential,
        name: &str,
    ) -> Result<ContainerId, StorageError> {
        let url = Url::parse_with_params(&self.files_url(), &[("fields", "id")])?;
        let request = self
            .client
            .post(url)
            .json(&json!({ "name": name, "mimeType": FOLDER_MIME }));

        let created: Value = self.send(request, credential).await?.json().await?;
        Ok(ContainerId(required_str(&created, "/id")?))
    }

    async fn create_object(
        &self,
        credential: &DelegatedCredential,
        container: &ContainerId,
        object: NewObject<'_>,
    ) -> Result<StorageReference, StorageError> {
        let metadata = json!({
            "name": object.name,
            "mimeType": object.mime_type,
            "parents": [container.0],
        });
        let boundary = format!("docvault-{}", Uuid::new_v4().simple());
        let body = multipart_related(&metadata, &object, &boundary);

        let request = self
            .client
            .post(self.upload_url()?)
            .header(
                "content-type",
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body);

        // Drive answers 404 when the parent folder no longer exists.
        let response = match self.send(request, credential).await {
            Err(StorageError::NotFound(_)) => {
                return Err(StorageError::ContainerNotFound(container.to_string()))
            }
            other => other?,
        };
        let created: Value = response.json().await?;
        let object_id = required_str(&created, "/id")?;
        let web_link = created
            .pointer("/webViewLink")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| fallback_link(&object_id));

        Ok(StorageReference {
            object_id,
            web_link,
            container_id: container.clone(),
        })
    }

    async fn rename_object(
        &self,
        credential: &DelegatedCredential,
        reference: &StorageReference,
        new_name: &str,
    ) -> Result<(), StorageError> {
        let url = Url::parse_with_params(&self.file_url(&reference.object_id), &[("fields", "id")])?;
        let request = self.client.patch(url).json(&json!({ "name": new_name }));
        self.send(request, credential).await?;
        Ok(())
    }

    async fn list_objects(
        &self,
        credential: &DelegatedCredential,
        container: &ContainerId,
        filter: &ObjectFilter,
    ) -> Result<Vec<StoredObject>, StorageError> {
        let files = self
            .query_files(credential, &children_query(container, filter), Some("name"))
            .await?;

        files
            .iter()
            .map(|file| {
                let object_id = required_str(file, "/id")?;
                let web_link = file
                    .pointer("/webViewLink")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| fallback_link(&object_id));
                Ok(StoredObject {
                    name: required_str(file, "/name")?,
                    mime_type: required_str(file, "/mimeType")?,
                    reference: StorageReference {
                        object_id,
                        web_link,
                        container_id: container.clone(),
                    },
                })
            })
            .collect()
    }

    async fn read_object(
        &self,
        credential: &DelegatedCredential,
        reference: &StorageReference,
    ) -> Result<ObjectDownload, StorageError> {
        let metadata_url = Url::parse_with_params(
            &self.file_url(&reference.object_id),
            &[("fields", "name,mimeType")],
        )?;
        let metadata: Value = self
            .send(self.client.get(metadata_url), credential)
            .await?
            .json()
            .await?;

        let media_url = Url::parse_with_params(&self.file_url(&reference.object_id), &[("alt", "media")])?;
        let response = self.send(self.client.get(media_url), credential).await?;

        Ok(ObjectDownload {
            name: required_str(&metadata, "/name")?,
            mime_type: metadata
                .pointer("/mimeType")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream")
                .to_string(),
            body: response.bytes_stream().map_err(StorageError::from).boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{children_query, folder_query, multipart_related, quote, DriveConfig, DriveStore};
    use crate::models::{ContainerId, NewObject, ObjectFilter};
    use serde_json::json;

    #[test]
    fn query_values_are_escaped() {
        assert_eq!(quote("it's"), r"'it\'s'");
        assert_eq!(quote(r"a\b"), r"'a\\b'");
        assert_eq!(
            folder_query("DocVault"),
            "name = 'DocVault' and mimeType = 'application/vnd.google-apps.folder' and trashed = false"
        );
    }

    #[test]
    fn children_query_applies_filter() {
        let query = children_query(
            &ContainerId("folder-1".to_string()),
            &ObjectFilter {
                name_contains: Some("passport".to_string()),
                mime_type: Some("application/pdf".to_string()),
            },
        );
        assert_eq!(
            query,
            "'folder-1' in parents and trashed = false and name contains 'passport' and mimeType = 'application/pdf'"
        );
    }

    #[test]
    fn multipart_body_wraps_metadata_and_content() {
        let object = NewObject {
            name: "passport.pdf",
            mime_type: "application/pdf",
            bytes: b"%PDF-1.4",
        };
        let metadata = json!({ "name": object.name });
        let body = multipart_related(&metadata, &object, "b0undary");
        let text = String::from_utf8(body).expect("utf8 body");

        assert!(text.starts_with("--b0undary\r\nContent-Type: application/json"));
        assert!(text.contains("{\"name\":\"passport.pdf\"}"));
        assert!(text.contains("Content-Type: application/pdf\r\n\r\n%PDF-1.4"));
        assert!(text.ends_with("\r\n--b0undary--\r\n"));
    }

    #[test]
    fn about_url_asks_only_for_the_permission_id() {
        let store = DriveStore::new(DriveConfig {
            api_base: "http://localhost:9000/".to_string(),
            ..DriveConfig::default()
        })
        .expect("store");
        assert_eq!(
            store.about_url().expect("url").as_str(),
            "http://localhost:9000/drive/v3/about?fields=user%28permissionId%29"
        );
    }
}
