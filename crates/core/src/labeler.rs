use crate::error::LabelError;
use crate::models::CanonicalLabel;
use crate::normalize::normalize_label;
use crate::traits::{Attachment, LabelRequest, LabelStrategy};
use tracing::{debug, warn};

pub const DEFAULT_CONTENT_PROMPT: &str = "Extract a one-word document name in lowercase for this file. \
Answer in JSON format: {\"document_name\": \"<name>\"}";

/// `{request}` is replaced with the user's text.
pub const DEFAULT_REDUCE_PROMPT: &str = "Extract a one-word document name in lowercase from this request. \
Answer in JSON format {\"document_name\": \"<name>\"}: \"{request}\"";

#[derive(Debug, Clone)]
pub struct LabelerOptions {
    pub content_prompt: String,
    pub reduce_prompt: String,
    pub fallback_label: Option<String>,
}

impl Default for LabelerOptions {
    fn default() -> Self {
        Self {
            content_prompt: DEFAULT_CONTENT_PROMPT.to_string(),
            reduce_prompt: DEFAULT_REDUCE_PROMPT.to_string(),
            fallback_label: None,
        }
    }
}

pub struct Labeler {
    strategies: Vec<Box<dyn LabelStrategy>>,
    content_prompt: String,
    reduce_prompt: String,
    fallback: Option<CanonicalLabel>,
}

impl Labeler {
    pub fn new(strategies: Vec<Box<dyn LabelStrategy>>, options: LabelerOptions) -> Self {
        let fallback = options.fallback_label.as_deref().and_then(normalize_label);
        Self {
            strategies,
            content_prompt: options.content_prompt,
            reduce_prompt: options.reduce_prompt,
            fallback,
        }
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|strategy| strategy.name()).collect()
    }

    pub async fn label(&self, content: &[u8], mime_type: &str) -> Result<CanonicalLabel, LabelError> {
        let request = LabelRequest {
            prompt: &self.content_prompt,
            attachment: Some(Attachment {
                bytes: content,
                mime_type,
            }),
        };
        self.run(request).await
    }

    pub async fn reduce(&self, text: &str) -> Result<CanonicalLabel, LabelError> {
        let prompt = self.reduce_prompt.replace("{request}", text.trim());
        let request = LabelRequest {
            prompt: &prompt,
            attachment: None,
        };
        self.run(request).await
    }

    async fn run(&self, request: LabelRequest<'_>) -> Result<CanonicalLabel, LabelError> {
        let error = match self.first_success(request).await {
            Ok(label) => return Ok(label),
            Err(error) => error,
        };

        match &self.fallback {
            Some(fallback) => {
                warn!(error = %error, fallback = %fallback, "labeling failed, using fallback label");
                Ok(fallback.clone())
            }
            None => Err(error),
        }
    }

    async fn first_success(&self, request: LabelRequest<'_>) -> Result<CanonicalLabel, LabelError> {
        if self.strategies.is_empty() {
            return Err(LabelError::NoStrategies);
        }

        let mut failures = Vec::new();
        for strategy in &self.strategies {
            let outcome = match strategy.generate(request).await {
                Ok(answer) => normalize_label(&answer).ok_or_else(|| LabelError::Unparseable {
                    backend: strategy.name().to_string(),
                    answer,
                }),
                Err(error) => Err(error),
            };

            match outcome {
                Ok(label) => {
                    debug!(strategy = strategy.name(), label = %label, "labeled");
                    return Ok(label);
                }
                Err(error) => {
                    warn!(strategy = strategy.name(), error = %error, "labeling strategy failed");
                    failures.push(format!("{}: {error}", strategy.name()));
                }
            }
        }

        Err(LabelError::AllFailed(failures.join("; ")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{Labeler, LabelerOptions};
    use crate::error::LabelError;
    use crate::traits::{LabelRequest, LabelStrategy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Answers with a fixed text, or fails when `answer` is `None`.
    pub(crate) struct ScriptedStrategy {
        pub name: &'static str,
        pub answer: Option<String>,
        pub calls: Arc<AtomicUsize>,
    }

    impl ScriptedStrategy {
        pub(crate) fn answering(name: &'static str, answer: &str) -> Self {
            Self {
                name,
                answer: Some(answer.to_string()),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub(crate) fn failing(name: &'static str) -> Self {
            Self {
                name,
                answer: None,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl LabelStrategy for ScriptedStrategy {
        fn name(&self) -> &str {
            self.name
        }

        async fn generate(&self, _request: LabelRequest<'_>) -> Result<String, LabelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone().ok_or_else(|| LabelError::BackendResponse {
                backend: self.name.to_string(),
                details: "503 Service Unavailable".to_string(),
            })
        }
    }

    /// Labels an attachment with its own text content and a free-text request
    /// with its last word. Attachments mentioning "timeout" fail; "slow" ones
    /// stall for `stall`.
    pub(crate) struct EchoStrategy {
        pub stall: std::time::Duration,
    }

    impl Default for EchoStrategy {
        fn default() -> Self {
            Self {
                stall: std::time::Duration::from_secs(30),
            }
        }
    }

    #[async_trait]
    impl LabelStrategy for EchoStrategy {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, request: LabelRequest<'_>) -> Result<String, LabelError> {
            match request.attachment {
                Some(attachment) => {
                    let text = String::from_utf8_lossy(attachment.bytes).to_string();
                    if text.contains("timeout") {
                        return Err(LabelError::BackendResponse {
                            backend: "echo".to_string(),
                            details: "request timed out".to_string(),
                        });
                    }
                    if text.contains("slow") {
                        tokio::time::sleep(self.stall).await;
                    }
                    Ok(text)
                }
                None => Ok(request
                    .prompt
                    .split_whitespace()
                    .last()
                    .unwrap_or_default()
                    .to_string()),
            }
        }
    }

    #[tokio::test]
    async fn first_successful_strategy_wins() {
        let managed = ScriptedStrategy::answering("managed", "```json\n{\"document_name\": \"Passport\"}\n```");
        let raw = ScriptedStrategy::answering("raw", "visa");
        let raw_calls = raw.calls.clone();

        let labeler = Labeler::new(vec![Box::new(managed), Box::new(raw)], LabelerOptions::default());
        let label = labeler.label(b"bytes", "image/png").await.expect("label");

        assert_eq!(label.as_str(), "passport");
        assert_eq!(raw_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn falls_through_failed_and_unparseable_strategies() {
        let labeler = Labeler::new(
            vec![
                Box::new(ScriptedStrategy::failing("managed")),
                Box::new(ScriptedStrategy::answering("garbled", "```\n```")),
                Box::new(ScriptedStrategy::answering("raw", "Marksheet")),
            ],
            LabelerOptions::default(),
        );

        let label = labeler.reduce("I need my marksheet").await.expect("label");
        assert_eq!(label.as_str(), "marksheet");
    }

    #[tokio::test]
    async fn all_strategies_failing_is_one_error() {
        let labeler = Labeler::new(
            vec![
                Box::new(ScriptedStrategy::failing("managed")),
                Box::new(ScriptedStrategy::failing("raw")),
            ],
            LabelerOptions::default(),
        );

        let error = labeler.label(b"x", "text/plain").await.expect_err("should fail");
        match error {
            LabelError::AllFailed(details) => {
                assert!(details.contains("managed"));
                assert!(details.contains("raw"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn fallback_label_replaces_total_failure() {
        let labeler = Labeler::new(
            vec![Box::new(ScriptedStrategy::failing("managed"))],
            LabelerOptions {
                fallback_label: Some("Unsorted!".to_string()),
                ..LabelerOptions::default()
            },
        );

        let label = labeler.label(b"x", "text/plain").await.expect("fallback");
        assert_eq!(label.as_str(), "unsorted");
    }

    #[tokio::test]
    async fn no_strategies_is_an_error() {
        let labeler = Labeler::new(Vec::new(), LabelerOptions::default());
        assert!(matches!(
            labeler.reduce("passport").await,
            Err(LabelError::NoStrategies)
        ));
    }
}
