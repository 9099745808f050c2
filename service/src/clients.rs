//! HTTP adapters for the remote collaborators.

use async_trait::async_trait;
use census_rm_core::collaborators::{
    AddressIndex, ExceptionAdvice, ExceptionManager, ExceptionReport, NewAddressEnhanced,
    SkippedMessage, UacQidGenerator,
};
use census_rm_core::error::CollaboratorError;
use census_rm_core::model::UacQidPair;
use census_rm_core::questionnaire::QuestionnaireType;
use census_rm_runtime::RetryPolicy;
use census_rm_runtime::retry::retry_with_predicate;
use serde::Serialize;
use std::time::Duration;

/// Longest response body kept in an error.
const MAX_ERROR_BODY: usize = 512;

/// Shared HTTP client.
///
/// # Errors
///
/// Returns [`CollaboratorError::Transport`] if the TLS backend cannot be initialised.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, CollaboratorError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CollaboratorError::Transport(e.to_string()))
}

/// Send a request and fail on any non-success status.
async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, CollaboratorError> {
    let response = request
        .send()
        .await
        .map_err(|e| CollaboratorError::Transport(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    Err(CollaboratorError::Status {
        status: status.as_u16(),
        body,
    })
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{path}", base_url.trim_end_matches('/'))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    questionnaire_type: u8,
    number_to_create: usize,
}

/// UAC/QID generator reached over HTTP.
pub struct HttpUacQidGenerator {
    client: reqwest::Client,
    url: String,
}

impl HttpUacQidGenerator {
    /// Create a client for the service at `base_url`.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            url: endpoint(base_url, "multiple_qids"),
        }
    }
}

#[async_trait]
impl UacQidGenerator for HttpUacQidGenerator {
    async fn generate(
        &self,
        questionnaire_type: QuestionnaireType,
        count: usize,
    ) -> Result<Vec<UacQidPair>, CollaboratorError> {
        let request = self.client.post(&self.url).json(&GenerateRequest {
            questionnaire_type: questionnaire_type.code(),
            number_to_create: count,
        });
        let pairs: Vec<UacQidPair> = send(request)
            .await?
            .json()
            .await
            .map_err(|e| CollaboratorError::Decode(e.to_string()))?;

        if pairs.len() != count {
            tracing::warn!(
                questionnaire_type = questionnaire_type.code(),
                requested = count,
                received = pairs.len(),
                "UAC/QID service returned a different number of pairs"
            );
        }
        Ok(pairs)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PeekReply<'a> {
    message_hash: &'a str,
    message_payload: &'a [u8],
}

/// Exception manager reached over HTTP.
pub struct HttpExceptionManager {
    client: reqwest::Client,
    base_url: String,
}

impl HttpExceptionManager {
    /// Create a client for the service at `base_url`.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl ExceptionManager for HttpExceptionManager {
    async fn report_exception(&self, report: ExceptionReport) -> Result<ExceptionAdvice, CollaboratorError> {
        let request = self
            .client
            .post(endpoint(&self.base_url, "reportexception"))
            .json(&report);
        send(request)
            .await?
            .json()
            .await
            .map_err(|e| CollaboratorError::Decode(e.to_string()))
    }

    async fn store_skipped_message(&self, message: SkippedMessage) -> Result<(), CollaboratorError> {
        let request = self
            .client
            .post(endpoint(&self.base_url, "storeskippedmessage"))
            .json(&message);
        send(request).await?;
        Ok(())
    }

    async fn respond_to_peek(&self, message_hash: &str, payload: &[u8]) -> Result<(), CollaboratorError> {
        let request = self
            .client
            .post(endpoint(&self.base_url, "peekreply"))
            .json(&PeekReply {
                message_hash,
                message_payload: payload,
            });
        send(request).await?;
        Ok(())
    }
}

/// Address index reached over HTTP, retrying transient failures.
pub struct HttpAddressIndex {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl HttpAddressIndex {
    /// Create a client for the service at `base_url`.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str, retry: RetryPolicy) -> Self {
        Self {
            client,
            url: endpoint(base_url, "addresses"),
            retry,
        }
    }
}

#[async_trait]
impl AddressIndex for HttpAddressIndex {
    async fn publish(&self, address: NewAddressEnhanced) -> Result<(), CollaboratorError> {
        retry_with_predicate(
            self.retry.clone(),
            || {
                let request = self.client.post(&self.url).json(&address);
                async move { send(request).await.map(|_| ()) }
            },
            CollaboratorError::is_retryable,
        )
        .await
    }
}
