//! Client side of the external inference service.
//!
//! The service exposes two endpoints: `POST /chat` for plain text questions
//! and `POST /analyze-file` for file uploads. Both answer with
//! `{"response": ..., "processing_time": ...}`.

use async_trait::async_trait;
use bytes::Bytes;
use chat_api::{FileInfo, HistoryTurn};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Ceiling applied to every inference call unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The single failure condition of the relay: network error, timeout,
/// non-success status or an unreadable answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct InferenceFailure {
    pub timed_out: bool,
    pub message: String,
}

impl InferenceFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timed_out: false,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self {
            timed_out: true,
            message: "AI request timed out. Please try again.".into(),
        }
    }
}

/// Generated text plus how long the service spent producing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAnswer {
    pub text: String,
    pub latency_ms: u64,
}

/// A file handed to the relay. Only lives for the duration of the call.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub name: String,
    pub mime: String,
    pub bytes: Bytes,
}

impl FileUpload {
    /// Build an upload, guessing the MIME type from the file name.
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let name = name.into();
        let mime = mime_guess::from_path(&name)
            .first_or_octet_stream()
            .to_string();
        Self {
            name,
            mime,
            bytes: bytes.into(),
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = mime.into();
        self
    }

    /// Descriptor recorded on the chat turn in place of the content.
    pub fn info(&self) -> FileInfo {
        FileInfo {
            filename: self.name.clone(),
            original_name: Some(self.name.clone()),
            size: self.bytes.len() as u64,
            mimetype: self.mime.clone(),
        }
    }
}

/// Anything able to answer a question given the prior turns of a conversation.
#[async_trait]
pub trait AiRelay: Send + Sync {
    async fn ask(
        &self,
        message: &str,
        history: &[HistoryTurn],
    ) -> Result<RelayAnswer, InferenceFailure>;

    async fn ask_with_file(
        &self,
        file: FileUpload,
        history: &[HistoryTurn],
    ) -> Result<RelayAnswer, InferenceFailure>;
}

#[async_trait]
impl<T: AiRelay + ?Sized> AiRelay for Arc<T> {
    async fn ask(
        &self,
        message: &str,
        history: &[HistoryTurn],
    ) -> Result<RelayAnswer, InferenceFailure> {
        (**self).ask(message, history).await
    }

    async fn ask_with_file(
        &self,
        file: FileUpload,
        history: &[HistoryTurn],
    ) -> Result<RelayAnswer, InferenceFailure> {
        (**self).ask_with_file(file, history).await
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    history: &'a [HistoryTurn],
}

#[derive(Deserialize)]
struct RelayResponse {
    response: String,
    #[serde(default)]
    processing_time: Option<f64>,
}

/// [`AiRelay`] backed by the HTTP inference service.
#[derive(Clone, Debug)]
pub struct HttpRelay {
    client: reqwest::Client,
    base: Url,
}

impl HttpRelay {
    pub fn new(mut base: Url, timeout: Duration) -> reqwest::Result<Self> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, InferenceFailure> {
        self.base
            .join(path)
            .map_err(|e| InferenceFailure::new(format!("invalid AI service url: {e}")))
    }

    async fn finish(
        &self,
        started: Instant,
        sent: reqwest::Result<reqwest::Response>,
    ) -> Result<RelayAnswer, InferenceFailure> {
        let resp = sent.map_err(transport_failure)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, body = %body, "inference service rejected request");
            return Err(InferenceFailure::new(format!(
                "AI service responded with {status}"
            )));
        }
        let body: RelayResponse = resp.json().await.map_err(transport_failure)?;
        let latency_ms = body
            .processing_time
            .filter(|t| t.is_finite() && *t >= 0.0)
            .map(|t| t.round() as u64)
            .unwrap_or_else(|| started.elapsed().as_millis() as u64);
        debug!(latency_ms, "inference answer received");
        Ok(RelayAnswer {
            text: body.response,
            latency_ms,
        })
    }
}

fn transport_failure(e: reqwest::Error) -> InferenceFailure {
    if e.is_timeout() {
        warn!("inference request timed out");
        InferenceFailure::timeout()
    } else {
        warn!(error = %e, "inference request failed");
        InferenceFailure::new(format!("AI request failed: {e}"))
    }
}

#[async_trait]
impl AiRelay for HttpRelay {
    async fn ask(
        &self,
        message: &str,
        history: &[HistoryTurn],
    ) -> Result<RelayAnswer, InferenceFailure> {
        let url = self.endpoint("chat")?;
        let started = Instant::now();
        let sent = self
            .client
            .post(url)
            .json(&ChatRequest { message, history })
            .send()
            .await;
        self.finish(started, sent).await
    }

    async fn ask_with_file(
        &self,
        file: FileUpload,
        history: &[HistoryTurn],
    ) -> Result<RelayAnswer, InferenceFailure> {
        let url = self.endpoint("analyze-file")?;
        let history = serde_json::to_string(history)
            .map_err(|e| InferenceFailure::new(format!("could not encode history: {e}")))?;
        let part = Part::bytes(file.bytes.to_vec())
            .file_name(file.name)
            .mime_str(&file.mime)
            .map_err(|e| InferenceFailure::new(format!("invalid file type: {e}")))?;
        let form = Form::new().part("file", part).text("history", history);
        let started = Instant::now();
        let sent = self.client.post(url).multipart(form).send().await;
        self.finish(started, sent).await
    }
}
