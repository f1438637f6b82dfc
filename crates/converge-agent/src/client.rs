//! Model client for refinement requests
//!
//! A client issues exactly one request per call and classifies failures as
//! transient (worth retrying) or fatal. Retrying is the invoker's job.

use crate::types::{ApiErrorEnvelope, ModelResponse, ResponsesRequest, ResponsesResponse};
use async_trait::async_trait;
use converge_core::{ConvergeError, Result};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

/// A backend that can refine text
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send one request: fixed instructions plus the current history text
    async fn refine(&self, instructions: &str, history: &str) -> Result<ModelResponse>;

    /// Model identifier, for logging
    fn model_name(&self) -> &str;
}

#[async_trait]
impl<C: ModelClient + ?Sized> ModelClient for Arc<C> {
    async fn refine(&self, instructions: &str, history: &str) -> Result<ModelResponse> {
        (**self).refine(instructions, history).await
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

/// Client for the OpenAI Responses API
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    /// Create a new client
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConvergeError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/responses", self.base_url)
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn refine(&self, instructions: &str, history: &str) -> Result<ModelResponse> {
        let request = ResponsesRequest {
            model: self.model.clone(),
            instructions: instructions.to_string(),
            input: history.to_string(),
        };

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown".to_string());
            return Err(classify_status(status, &body));
        }

        let parsed: ResponsesResponse = response
            .json()
            .await
            .map_err(|e| ConvergeError::Transient(format!("Failed to read response: {}", e)))?;

        if parsed.status.as_deref() == Some("failed") {
            return Err(ConvergeError::Api("Response status is 'failed'".to_string()));
        }

        let text = parsed.output_text();
        if text.is_empty() {
            return Err(ConvergeError::Transient(format!(
                "No output text in response (status: {})",
                parsed.status.as_deref().unwrap_or("unknown")
            )));
        }

        Ok(ModelResponse {
            text,
            usage: parsed.usage,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Map a transport failure to an error class
fn classify_send_error(e: reqwest::Error) -> ConvergeError {
    if e.is_builder() {
        ConvergeError::Api(format!("Failed to build request: {}", e))
    } else {
        ConvergeError::Transient(format!("Failed to send request: {}", e))
    }
}

/// Map a non-success HTTP status to an error class
fn classify_status(status: StatusCode, body: &str) -> ConvergeError {
    let detail = serde_json::from_str::<ApiErrorEnvelope>(body)
        .map(|env| match env.error.error_type {
            Some(kind) => format!("{} ({})", env.error.message, kind),
            None => env.error.message,
        })
        .unwrap_or_else(|_| body.to_string());
    let message = format!("API error {}: {}", status, detail);

    match status.as_u16() {
        401 | 403 => ConvergeError::Auth(message),
        408 | 409 | 429 => ConvergeError::Transient(message),
        s if s >= 500 => ConvergeError::Transient(message),
        _ => ConvergeError::Api(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK_BODY: &str = r#"{
        "id": "resp_abc",
        "status": "completed",
        "output": [
            {"type": "message", "role": "assistant", "content": [
                {"type": "output_text", "text": "refined text"}
            ]}
        ],
        "usage": {"input_tokens": 7, "output_tokens": 2, "total_tokens": 9}
    }"#;

    fn client_for(server: &mockito::ServerGuard) -> OpenAiClient {
        OpenAiClient::new("sk-test", "o3-pro", server.url(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "{}"),
            ConvergeError::Auth(_)
        ));
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad"),
            ConvergeError::Api(_)
        ));
    }

    #[test]
    fn test_classify_status_uses_error_message() {
        let body = r#"{"error": {"message": "Rate limit reached", "type": "requests"}}"#;
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, body);
        assert!(err.to_string().contains("Rate limit reached (requests)"));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let client =
            OpenAiClient::new("k", "m", "http://localhost:1/v1/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.endpoint(), "http://localhost:1/v1/responses");
        assert_eq!(client.model_name(), "m");
    }

    #[tokio::test]
    async fn test_refine_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/responses")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(OK_BODY)
            .create_async()
            .await;

        let response = client_for(&server)
            .refine("polish this", "some draft")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.text, "refined text");
        assert_eq!(response.usage.unwrap().input_tokens, 7);
    }

    #[tokio::test]
    async fn test_refine_rate_limited_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/responses")
            .with_status(429)
            .with_body(r#"{"error": {"message": "Too many requests"}}"#)
            .create_async()
            .await;

        let err = client_for(&server).refine("i", "h").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_refine_bad_key_is_auth() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/responses")
            .with_status(401)
            .with_body(r#"{"error": {"message": "Incorrect API key provided"}}"#)
            .create_async()
            .await;

        let err = client_for(&server).refine("i", "h").await.unwrap_err();
        assert!(matches!(err, ConvergeError::Auth(_)));
    }

    #[tokio::test]
    async fn test_refine_empty_output_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/responses")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": "incomplete", "output": []}"#)
            .create_async()
            .await;

        let err = client_for(&server).refine("i", "h").await.unwrap_err();
        assert!(err.is_transient());
    }
}
