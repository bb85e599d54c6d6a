use crate::error::LabelError;
use crate::traits::{LabelRequest, LabelStrategy};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-1.5-flash".to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Managed `generateContent` client.
pub struct GeminiLabeler {
    client: Client,
    config: GeminiConfig,
}

impl GeminiLabeler {
    pub fn new(config: GeminiConfig) -> Result<Self, LabelError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }
}

fn request_body(request: &LabelRequest<'_>) -> Value {
    let mut parts = vec![json!({ "text": request.prompt })];
    if let Some(attachment) = request.attachment {
        parts.push(json!({
            "inline_data": {
                "mime_type": attachment.mime_type,
                "data": STANDARD.encode(attachment.bytes),
            }
        }));
    }

    json!({ "contents": [{ "role": "user", "parts": parts }] })
}

fn answer_text(response: &Value) -> Option<String> {
    let parts = response
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)?;

    let text = parts
        .iter()
        .filter_map(|part| part.pointer("/text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[async_trait]
impl LabelStrategy for GeminiLabeler {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, request: LabelRequest<'_>) -> Result<String, LabelError> {
        let response = self
            .client
            .post(self.url())
            .query(&[("key", self.config.api_key.as_str())])
            .json(&request_body(&request))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LabelError::BackendResponse {
                backend: "gemini".to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        answer_text(&parsed).ok_or_else(|| LabelError::BackendResponse {
            backend: "gemini".to_string(),
            details: "response had no candidate text".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{answer_text, request_body};
    use crate::traits::{Attachment, LabelRequest};
    use serde_json::json;

    #[test]
    fn attachment_is_sent_inline_as_base64() {
        let body = request_body(&LabelRequest {
            prompt: "name this",
            attachment: Some(Attachment {
                bytes: b"abc",
                mime_type: "application/pdf",
            }),
        });

        assert_eq!(body.pointer("/contents/0/parts/0/text"), Some(&json!("name this")));
        assert_eq!(
            body.pointer("/contents/0/parts/1/inline_data/mime_type"),
            Some(&json!("application/pdf"))
        );
        assert_eq!(
            body.pointer("/contents/0/parts/1/inline_data/data"),
            Some(&json!("YWJj"))
        );
    }

    #[test]
    fn text_only_request_has_single_part() {
        let body = request_body(&LabelRequest {
            prompt: "I want my adhar card",
            attachment: None,
        });
        let parts = body
            .pointer("/contents/0/parts")
            .and_then(|value| value.as_array())
            .expect("parts array");
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn candidate_parts_are_concatenated() {
        let response = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "```json\n{\"document_name\": " }, { "text": "\"pan\"}\n```" }] }
            }]
        });
        assert_eq!(
            answer_text(&response).as_deref(),
            Some("```json\n{\"document_name\": \"pan\"}\n```")
        );
        assert_eq!(answer_text(&json!({ "candidates": [] })), None);
    }
}
