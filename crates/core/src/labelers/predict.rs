use crate::error::LabelError;
use crate::traits::{LabelRequest, LabelStrategy};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PredictConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

pub struct PredictLabeler {
    client: Client,
    config: PredictConfig,
}

impl PredictLabeler {
    pub fn new(config: PredictConfig) -> Result<Self, LabelError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

fn request_body(request: &LabelRequest<'_>) -> Value {
    let mut instance = json!({ "prompt": request.prompt });
    if let Some(attachment) = request.attachment {
        instance["content"] = json!(STANDARD.encode(attachment.bytes));
        instance["mimeType"] = json!(attachment.mime_type);
    }
    json!({ "instances": [instance] })
}

fn prediction_text(response: &Value) -> Option<String> {
    let first = response.pointer("/predictions/0")?;
    let text = match first {
        Value::String(text) => text.clone(),
        other => other
            .pointer("/content")
            .and_then(Value::as_str)
            .map(str::to_string)?,
    };

    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[async_trait]
impl LabelStrategy for PredictLabeler {
    fn name(&self) -> &str {
        "predict"
    }

    async fn generate(&self, request: LabelRequest<'_>) -> Result<String, LabelError> {
        let mut builder = self
            .client
            .post(&self.config.endpoint)
            .header("content-type", "application/json")
            .json(&request_body(&request));

        if let Some(api_key) = &self.config.api_key {
            builder = builder.header("authorization", api_key);
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            return Err(LabelError::BackendResponse {
                backend: "predict".to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        prediction_text(&parsed).ok_or_else(|| LabelError::BackendResponse {
            backend: "predict".to_string(),
            details: "response had no prediction content".to_string(),
        })
    }
}
