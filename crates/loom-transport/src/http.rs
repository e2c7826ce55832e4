use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use loom_core::errors::SourceError;
use loom_core::ids::ThreadId;
use loom_core::messages::ContentFilter;
use loom_core::source::{ElementRequest, ElementSource, ElementStream};

use crate::error::TransportError;
use crate::ndjson::NdjsonStream;

const NDJSON: &str = "application/x-ndjson";

#[derive(Serialize)]
struct AnswerRequestBody<'a> {
    thread_id: &'a ThreadId,
    question: &'a str,
    filters: &'a ContentFilter,
}

/// Element source backed by an HTTP endpoint that answers with NDJSON.
pub struct HttpElementSource {
    client: reqwest::Client,
    endpoint: reqwest::Url,
}

impl HttpElementSource {
    pub fn new(endpoint: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let endpoint = reqwest::Url::parse(endpoint)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(TransportError::InvalidEndpoint(format!(
                "{endpoint}: unsupported scheme"
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }
}

#[async_trait]
impl ElementSource for HttpElementSource {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip_all, fields(thread_id = %request.thread_id, endpoint = %self.endpoint))]
    async fn open(&self, request: &ElementRequest) -> Result<ElementStream, SourceError> {
        let body = AnswerRequestBody {
            thread_id: &request.thread_id,
            question: &request.question,
            filters: &request.filters,
        };

        let mut req = self
            .client
            .post(self.endpoint.clone())
            .header(ACCEPT, NDJSON)
            .json(&body);
        if let Some(token) = &request.auth_token {
            req = req.bearer_auth(token.expose_secret());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SourceError::Connect(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "element source rejected request");
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(status = status.as_u16(), "element stream opened");
        Ok(Box::pin(NdjsonStream::new(resp.bytes_stream())))
    }
}
