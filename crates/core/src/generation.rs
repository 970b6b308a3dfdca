//! Contract between the worker pool and the external image generation
//! service.
//!
//! The engine only needs "payload in, image bytes out" plus enough error
//! detail to decide whether a retry makes sense.

use std::time::Duration;

use async_trait::async_trait;

use crate::batch::ItemPayload;
use crate::retry::{classify_http_status, ErrorClass};

/// Bytes produced by one successful generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl GeneratedImage {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }

    /// File extension for the stored blob, derived from the content type.
    pub fn extension(&self) -> &'static str {
        match self.content_type.split(';').next().map(str::trim) {
            Some("image/png") => "png",
            Some("image/jpeg") | Some("image/jpg") => "jpg",
            Some("image/webp") => "webp",
            Some("image/gif") => "gif",
            _ => "bin",
        }
    }
}

/// Errors from the external generation service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited by generation service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Generation service error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("Generation service rejected the API key: {0}")]
    Unauthorized(String),

    /// Content-policy or safety rejection of the prompt.
    #[error("Prompt rejected by generation service: {0}")]
    Rejected(String),

    #[error("Invalid generation request ({status}): {body}")]
    InvalidRequest { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed generation response: {0}")]
    MalformedResponse(String),
}

impl GenerationError {
    /// Map a non-success HTTP response to an error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(body),
            429 => Self::RateLimited { retry_after: None },
            _ => match classify_http_status(status) {
                ErrorClass::Transient => Self::Server { status, body },
                ErrorClass::Permanent => Self::InvalidRequest { status, body },
            },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_)
            | Self::RateLimited { .. }
            | Self::Server { .. }
            | Self::Network(_)
            | Self::MalformedResponse(_) => ErrorClass::Transient,
            Self::Unauthorized(_) | Self::Rejected(_) | Self::InvalidRequest { .. } => {
                ErrorClass::Permanent
            }
        }
    }

    /// Server-provided minimum wait before the next call, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// An external image generator.
///
/// Implementations must not log `api_key`.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(
        &self,
        api_key: &str,
        payload: &ItemPayload,
    ) -> Result<GeneratedImage, GenerationError>;
}
