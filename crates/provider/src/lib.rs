//! HTTP client for the external image generation service.
//!
//! Implements [`ImageGenerator`] over a JSON REST API using [`reqwest`]:
//! one `POST` to request the image, then a `GET` to download the bytes the
//! service points at.

use std::time::Duration;

use async_trait::async_trait;
use genbatch_core::batch::ItemPayload;
use genbatch_core::generation::{GeneratedImage, GenerationError, ImageGenerator};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};

/// Content type assumed when the download response does not declare one.
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Generator backed by a single HTTP endpoint.
pub struct HttpImageGenerator {
    client: reqwest::Client,
    base_url: String,
}

/// Body of `POST /v1/images/generations`.
#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "no_references")]
    reference_images: &'a [String],
}

fn no_references(refs: &&[String]) -> bool {
    refs.is_empty()
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    data: Vec<GeneratedEntry>,
}

#[derive(Debug, Deserialize)]
struct GeneratedEntry {
    url: Option<String>,
}

impl HttpImageGenerator {
    /// * `base_url` - Service root, e.g. `https://images.example.com`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn request_image_url(
        &self,
        api_key: &str,
        payload: &ItemPayload,
    ) -> Result<String, GenerationError> {
        let body = GenerationRequest {
            prompt: &payload.prompt,
            negative_prompt: payload.negative_prompt.as_deref(),
            reference_images: &payload.reference_assets,
        };

        let response = self
            .client
            .post(format!("{}/v1/images/generations", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let response = ensure_success(response).await?;
        let text = response.text().await.map_err(map_transport_error)?;
        let url = parse_image_url(&text)?;
        Ok(self.resolve(&url))
    }

    async fn download(&self, api_key: &str, url: &str) -> Result<GeneratedImage, GenerationError> {
        let mut request = self.client.get(url);
        // Only send the key back to the service that issued the URL.
        if self.is_service_url(url) {
            request = request.bearer_auth(api_key);
        }
        let response = request.send().await.map_err(map_transport_error)?;
        let response = ensure_success(response).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let bytes = response.bytes().await.map_err(map_transport_error)?;
        if bytes.is_empty() {
            return Err(GenerationError::MalformedResponse(
                "image download returned no bytes".into(),
            ));
        }

        Ok(GeneratedImage::new(bytes.to_vec(), content_type))
    }

    /// Whether `url` has the same scheme, host and port as the service.
    fn is_service_url(&self, url: &str) -> bool {
        match (reqwest::Url::parse(&self.base_url), reqwest::Url::parse(url)) {
            (Ok(base), Ok(target)) => base.origin() == target.origin(),
            _ => false,
        }
    }

    /// Turn a service-relative URL into an absolute one.
    fn resolve(&self, url: &str) -> String {
        if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            url.to_string()
        }
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(
        &self,
        api_key: &str,
        payload: &ItemPayload,
    ) -> Result<GeneratedImage, GenerationError> {
        let url = self.request_image_url(api_key, payload).await?;
        tracing::debug!(url = %url, "Downloading generated image");
        self.download(api_key, &url).await
    }
}

// ---- private helpers ----

/// Return the response unchanged on a success status, otherwise map the
/// status and body to a [`GenerationError`].
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, chrono::Utc::now()));
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());

    Err(match GenerationError::from_status(status.as_u16(), body) {
        GenerationError::RateLimited { .. } => GenerationError::RateLimited { retry_after },
        other => other,
    })
}

/// Pull the first image URL out of a generation response body.
fn parse_image_url(body: &str) -> Result<String, GenerationError> {
    let parsed: GenerationResponse = serde_json::from_str(body)
        .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;

    parsed
        .data
        .into_iter()
        .find_map(|entry| entry.url.filter(|u| !u.is_empty()))
        .ok_or_else(|| GenerationError::MalformedResponse("response contains no image URL".into()))
}

/// Parse a `Retry-After` value, either delta-seconds or an HTTP date.
/// Dates in the past yield a zero delay.
fn parse_retry_after(value: &str, now: chrono::DateTime<chrono::Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

fn map_transport_error(e: reqwest::Error) -> GenerationError {
    if e.is_timeout() {
        GenerationError::Timeout(Duration::ZERO)
    } else if e.is_decode() {
        GenerationError::MalformedResponse(e.to_string())
    } else {
        GenerationError::Network(e.to_string())
    }
}
