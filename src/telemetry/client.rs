use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    Client,
    header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use serde_json::Value;
use snap::raw::Encoder;
use uuid::Uuid;

use crate::error::ReportError;

/// Somewhere a named JSON report can be dropped off. No response contract
/// beyond success or failure.
#[async_trait]
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the sink wants the `started` marker as well as the final report.
    fn streams_progress(&self) -> bool {
        false
    }

    async fn submit(&self, channel: &str, id: Uuid, payload: &Value) -> Result<(), ReportError>;
}

/// Pushes reports to a telemetry collector.
///
/// The body is snappy-compressed JSON posted to `{endpoint}/{channel}/{id}`.
pub struct HttpSink {
    endpoint: String,
    client: Client,
}

impl HttpSink {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ReportError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("middlebox-probe/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpSink {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url(&self, channel: &str, id: Uuid) -> String {
        format!("{}/{}/{}", self.endpoint, channel, id)
    }
}

#[async_trait]
impl ReportSink for HttpSink {
    fn name(&self) -> &str {
        &self.endpoint
    }

    fn streams_progress(&self) -> bool {
        true
    }

    async fn submit(&self, channel: &str, id: Uuid, payload: &Value) -> Result<(), ReportError> {
        let body = serde_json::to_vec(payload)?;

        let mut encoder = Encoder::new();
        let compressed_data = encoder.compress_vec(&body)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("snappy"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let response = self
            .client
            .post(self.url(channel, id))
            .headers(headers)
            .body(compressed_data)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ReportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Writes the report as pretty JSON, replacing the file.
pub struct FileSink {
    path: PathBuf,
    name: String,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        FileSink { path, name }
    }
}

#[async_trait]
impl ReportSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, _channel: &str, _id: Uuid, payload: &Value) -> Result<(), ReportError> {
        let mut body = serde_json::to_vec_pretty(payload)?;
        body.push(b'\n');
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|source| ReportError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

/// Prints the report to stdout.
pub struct StdoutSink;

#[async_trait]
impl ReportSink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn submit(&self, _channel: &str, _id: Uuid, payload: &Value) -> Result<(), ReportError> {
        println!("{}", serde_json::to_string_pretty(payload)?);
        Ok(())
    }
}
