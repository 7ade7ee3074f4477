use async_trait::async_trait;
use serde::Deserialize;

use draftflow_core::config::GenerationConfig;
use draftflow_core::error::{DraftflowError, Result};
use draftflow_core::workflow::{DraftGenerator, GenerationError, WorkflowInput};

use crate::http::{build_client, is_retryable_status, is_retryable_transport};

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    text: String,
}

/// Draft generator backed by an HTTP endpoint.
///
/// The tagged input is POSTed as JSON; the endpoint answers with
/// `{"text": "..."}`.
pub struct HttpDraftGenerator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDraftGenerator {
    pub fn new(endpoint: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: endpoint.into(),
        })
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| DraftflowError::Config("generation.endpoint is not set".into()))?;
        Self::new(endpoint, config.timeout())
    }
}

#[async_trait]
impl DraftGenerator for HttpDraftGenerator {
    async fn generate(&self, input: &WorkflowInput) -> std::result::Result<String, GenerationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(input)
            .send()
            .await
            .map_err(|e| {
                if is_retryable_transport(&e) {
                    GenerationError::Transient(e.to_string())
                } else {
                    GenerationError::Permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("generator returned {}: {}", status, text);
            return Err(if is_retryable_status(status) {
                GenerationError::Transient(message)
            } else {
                GenerationError::Permanent(message)
            });
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Permanent(format!("invalid generator response: {}", e)))?;

        if body.text.trim().is_empty() {
            return Err(GenerationError::Permanent("generator returned an empty draft".into()));
        }
        Ok(body.text)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn input() -> WorkflowInput {
        WorkflowInput::CeaseAndDesist {
            recipient: "Neighbour".into(),
            facts: "Loud music nightly".into(),
            demanded_action: "Stop after 10pm".into(),
        }
    }

    async fn generator_for(server: &MockServer) -> HttpDraftGenerator {
        HttpDraftGenerator::new(format!("{}/generate", server.uri()), Duration::from_secs(5))
            .unwrap()
    }

    #[tokio::test]
    async fn test_returns_generated_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .and(body_partial_json(json!({"kind": "cease_and_desist"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "Dear Neighbour"})))
            .mount(&server)
            .await;

        let text = generator_for(&server).await.generate(&input()).await.unwrap();
        assert_eq!(text, "Dear Neighbour");
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = generator_for(&server).await.generate(&input()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Transient(_)));
    }

    #[tokio::test]
    async fn test_bad_request_and_bad_body_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        let err = generator_for(&server).await.generate(&input()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Permanent(_)));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"draft": "x"})))
            .mount(&server)
            .await;
        let err = generator_for(&server).await.generate(&input()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Permanent(_)));
    }
}
