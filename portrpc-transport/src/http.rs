// Request/response transport: one multipart/mixed POST per call.

use crate::multipart::{boundary_from_content_type, encode_multipart, parse_multipart};
use crate::{Frame, RequestTransport, TransportError};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

/// POSTs a call's frames as one multipart/mixed request and splits the
/// multipart reply back into frames.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RequestTransport for HttpTransport {
    async fn exchange(&self, frames: Vec<Frame>) -> Result<Vec<Frame>, TransportError> {
        let boundary = format!("portrpc-{}", Uuid::new_v4().simple());
        let body = encode_multipart(&frames, &boundary);
        debug!(
            "POST {} with {} frames ({} bytes)",
            self.url,
            frames.len(),
            body.len()
        );

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, format!("multipart/mixed; boundary={}", boundary))
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Http {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: Some(status.as_u16()),
                message,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await.map_err(|e| TransportError::Http {
            status: Some(status.as_u16()),
            message: e.to_string(),
        })?;
        trace!("HTTP reply: {} bytes, {}", body.len(), content_type);

        if let Some(boundary) = boundary_from_content_type(&content_type) {
            return parse_multipart(&body, &boundary);
        }
        if content_type.is_empty() || content_type.starts_with("application/json") {
            let text = String::from_utf8(body.to_vec())
                .map_err(|e| TransportError::Codec(format!("reply is not UTF-8: {}", e)))?;
            return Ok(if text.trim().is_empty() {
                Vec::new()
            } else {
                vec![Frame::Text(text)]
            });
        }
        Err(TransportError::Codec(format!(
            "unexpected reply content type {}",
            content_type
        )))
    }
}
