//! HTTP adapters for the generation and publishing services.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{classify_status, classify_transport};
use crate::error::{CallError, ConfigError};
use crate::feedback::{Feedback, FeedbackSink};
use crate::publish::{Publisher, Receipt};
use crate::scheduler::{Artifact, Generator, Request};

/// Default request timeout for the underlying HTTP client.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Body marker that turns a 429 from the publisher into a quota signal.
const QUOTA_MARKER: &str = "quota";

/// Connection settings shared by the HTTP adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub base_url: String,
    /// Bearer token, if the service requires one.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(with = "crate::utils::serde_secs")]
    pub timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

impl HttpSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn client(&self, key: &str) -> Result<Client, ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: "base URL is required".to_string(),
            });
        }
        Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("failed to build HTTP client: {}", e),
            })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    video_url: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

/// Generation service client: `POST {base}/video/generate`.
pub struct HttpGenerator {
    client: Client,
    settings: HttpSettings,
}

impl HttpGenerator {
    pub fn new(settings: HttpSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            client: settings.client("generator.base_url")?,
            settings,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/video/generate", self.settings.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, request: &Request) -> Result<Artifact, CallError> {
        let response = self
            .settings
            .authorize(self.client.post(self.endpoint()))
            .json(&GenerateBody {
                prompt: &request.payload,
            })
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &body, None));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| CallError::Transient(format!("failed to decode response: {}", e)))?;

        let locator = parsed
            .video_url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| CallError::Transient("response carried no video_url".to_string()))?;

        let mut artifact = Artifact::new(&request.id, locator);
        artifact.metadata = request.metadata.clone();
        if let Some(id) = parsed.id {
            artifact.metadata.insert("remote_id".to_string(), id);
        }
        Ok(artifact)
    }
}

#[derive(Debug, Serialize)]
struct PublishBody<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_url: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

/// Publishing endpoint client: `POST {url}` with the caption and media link.
pub struct WebhookPublisher {
    client: Client,
    settings: HttpSettings,
}

impl WebhookPublisher {
    pub fn new(settings: HttpSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            client: settings.client("publisher.base_url")?,
            settings,
        })
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, text: &str, media: Option<&str>) -> Result<Receipt, CallError> {
        let response = self
            .settings
            .authorize(self.client.post(&self.settings.base_url))
            .json(&PublishBody {
                text,
                media_url: media,
            })
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &body, Some(QUOTA_MARKER)));
        }

        // The post went through; a body we cannot read must not trigger a
        // retry that would publish it again.
        match response.json::<PublishResponse>().await {
            Ok(parsed) => Ok(Receipt {
                id: parsed.id,
                url: parsed.url,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "Publish succeeded but receipt was unreadable");
                Ok(Receipt::new(format!("unknown-{}", uuid::Uuid::new_v4())))
            }
        }
    }
}

/// Feedback endpoint client: `POST {url}` with the feedback entry.
pub struct HttpFeedbackSink {
    client: Client,
    settings: HttpSettings,
}

impl HttpFeedbackSink {
    pub fn new(settings: HttpSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            client: settings.client("feedback.http.base_url")?,
            settings,
        })
    }
}

#[async_trait]
impl FeedbackSink for HttpFeedbackSink {
    async fn submit(&self, feedback: &Feedback) -> Result<serde_json::Value, CallError> {
        let response = self
            .settings
            .authorize(self.client.post(&self.settings.base_url))
            .json(feedback)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &body, None));
        }

        // Accepted feedback with an empty or non-JSON body is still accepted.
        Ok(response
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null))
    }
}
