use std::collections::VecDeque;

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{BackendConfig, ResponseMode};
use crate::error::BackendError;

/// File categories the backend distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Document,
    Audio,
    Video,
    Custom,
}

const DOCUMENT_MIMETYPES: &[&str] = &[
    "text/plain",
    "text/markdown",
    "application/pdf",
    "text/html",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/csv",
    "application/xml",
    "application/epub+zip",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "message/rfc822",
    "application/vnd.ms-outlook",
];

impl FileKind {
    pub fn from_mimetype(mimetype: &str) -> Option<Self> {
        let mimetype = mimetype.to_ascii_lowercase();
        if mimetype.starts_with("image/") {
            Some(FileKind::Image)
        } else if DOCUMENT_MIMETYPES.contains(&mimetype.as_str()) {
            Some(FileKind::Document)
        } else if mimetype.starts_with("audio/") {
            Some(FileKind::Audio)
        } else if mimetype.starts_with("video/") {
            Some(FileKind::Video)
        } else {
            None
        }
    }

    pub fn from_extension(name: &str) -> Self {
        let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" => FileKind::Image,
            "mp3" | "m4a" | "wav" | "webm" | "amr" => FileKind::Audio,
            "mp4" | "mov" | "mpeg" | "mpga" => FileKind::Video,
            "txt" | "md" | "markdown" | "pdf" | "html" | "xlsx" | "xls" | "docx" | "csv"
            | "eml" | "msg" | "pptx" | "ppt" | "xml" | "epub" => FileKind::Document,
            _ => FileKind::Custom,
        }
    }

    /// Mimetype first, file extension as the fallback
    pub fn detect(mimetype: &str, name: &str) -> Self {
        Self::from_mimetype(mimetype).unwrap_or_else(|| Self::from_extension(name))
    }
}

/// Best-effort content type for a multipart upload
fn content_type_for(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

/// An uploaded file referenced from a chat turn
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileInput {
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub transfer_method: &'static str,
    pub upload_file_id: String,
}

impl FileInput {
    pub fn local(uploaded: &UploadedFile) -> Self {
        Self {
            kind: uploaded.kind,
            transfer_method: "local_file",
            upload_file_id: uploaded.id.clone(),
        }
    }
}

/// One user turn sent to the backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatTurn {
    pub query: String,
    pub user: String,
    pub conversation_id: Option<String>,
    pub files: Vec<FileInput>,
}

/// A knowledge-base citation attached to an answer
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub dataset_name: Option<String>,
    #[serde(default)]
    pub document_name: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Answer {
    pub text: String,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub sources: Vec<Source>,
}

impl Answer {
    /// Answer text followed by up to three cited sources
    pub fn render(&self) -> String {
        let mut out = if self.text.trim().is_empty() {
            "No response received.".to_string()
        } else {
            self.text.clone()
        };

        if !self.sources.is_empty() {
            out.push_str("\n\n*Sources:*");
            for source in self.sources.iter().take(3) {
                out.push_str(&format!(
                    "\n• {} (from {}) - Score: {:.2}",
                    source.document_name.as_deref().unwrap_or("Unknown"),
                    source.dataset_name.as_deref().unwrap_or("Unknown"),
                    source.score.unwrap_or(0.0)
                ));
            }
        }
        out
    }
}

/// One event of an incrementally produced answer
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk {
        text: String,
        conversation_id: Option<String>,
        message_id: Option<String>,
    },
    End {
        conversation_id: Option<String>,
        sources: Vec<Source>,
    },
}

pub enum BackendReply {
    Complete(Answer),
    Streaming(BoxStream<'static, Result<StreamEvent, BackendError>>),
}

impl BackendReply {
    /// Fold the reply into one answer, concatenating chunks in delivery order.
    pub async fn collect(self) -> Result<Answer, BackendError> {
        let mut events = match self {
            BackendReply::Complete(answer) => return Ok(answer),
            BackendReply::Streaming(events) => events,
        };

        let mut answer = Answer::default();
        while let Some(event) = events.next().await {
            match event? {
                StreamEvent::Chunk {
                    text,
                    conversation_id,
                    message_id,
                } => {
                    answer.text.push_str(&text);
                    if answer.conversation_id.is_none() {
                        answer.conversation_id = conversation_id;
                    }
                    if answer.message_id.is_none() {
                        answer.message_id = message_id;
                    }
                }
                StreamEvent::End {
                    conversation_id,
                    sources,
                } => {
                    if answer.conversation_id.is_none() {
                        answer.conversation_id = conversation_id;
                    }
                    answer.sources = sources;
                    break;
                }
            }
        }
        Ok(answer)
    }
}

pub struct FileUpload {
    pub name: String,
    pub mimetype: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub id: String,
    pub kind: FileKind,
}

/// The conversational backend the relay forwards turns to
#[async_trait]
pub trait Backend: Send + Sync {
    async fn send(&self, turn: &ChatTurn, mode: ResponseMode) -> Result<BackendReply, BackendError>;

    async fn upload_file(&self, upload: FileUpload, user: &str)
        -> Result<UploadedFile, BackendError>;

    async fn suggested_questions(
        &self,
        _message_id: &str,
        _user: &str,
    ) -> Result<Vec<String>, BackendError> {
        Ok(Vec::new())
    }
}

// ── Dify wire format ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    query: &'a str,
    inputs: serde_json::Map<String, serde_json::Value>,
    response_mode: ResponseMode,
    user: &'a str,
    auto_generate_name: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    files: &'a [FileInput],
}

#[derive(Debug, Deserialize, Default)]
struct Metadata {
    #[serde(default)]
    retriever_resources: Vec<Source>,
}

#[derive(Debug, Deserialize)]
struct BlockingResponse {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    event: String,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SuggestedResponse {
    #[serde(default)]
    data: Vec<String>,
}

/// Parse one `data: {...}` line of the event stream. Lines that carry no
/// answer content (keep-alives, workflow progress) yield `None`.
fn parse_stream_line(line: &str) -> Option<Result<StreamEvent, BackendError>> {
    let data = line.strip_prefix("data:")?.trim();
    let parsed: StreamLine = match serde_json::from_str(data) {
        Ok(p) => p,
        Err(e) => {
            debug!("Skipping unparseable stream line: {}", e);
            return None;
        }
    };

    match parsed.event.as_str() {
        "message" | "agent_message" => Some(Ok(StreamEvent::Chunk {
            text: parsed.answer.unwrap_or_default(),
            conversation_id: parsed.conversation_id,
            message_id: parsed.message_id,
        })),
        "message_end" => Some(Ok(StreamEvent::End {
            conversation_id: parsed.conversation_id,
            sources: parsed
                .metadata
                .map(|m| m.retriever_resources)
                .unwrap_or_default(),
        })),
        "error" => Some(Err(BackendError::Rejected {
            status: parsed.status.unwrap_or(500),
            message: parsed
                .message
                .or(parsed.code)
                .unwrap_or_else(|| "stream error".to_string()),
        })),
        _ => None,
    }
}

struct EventStreamState<S> {
    inner: S,
    buffer: Vec<u8>,
    pending: VecDeque<Result<StreamEvent, BackendError>>,
    finished: bool,
}

impl<S> EventStreamState<S> {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = parse_stream_line(line.trim()) {
                self.pending.push_back(event);
            }
        }
    }
}

/// Turn a raw byte stream of server-sent events into answer events.
/// Chunks may split lines anywhere; lines are reassembled before parsing.
pub fn event_stream<S, B, E>(inner: S) -> BoxStream<'static, Result<StreamEvent, BackendError>>
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<BackendError> + Send + 'static,
{
    let state = EventStreamState {
        inner,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.finished {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(chunk.as_ref());
                    state.drain_lines();
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.pending.push_back(Err(e.into()));
                }
                None => {
                    state.finished = true;
                    state.buffer.push(b'\n');
                    state.drain_lines();
                }
            }
        }
    })
    .boxed()
}

/// Build a `Rejected` error from a non-success response, preferring the
/// backend's own `message` field.
async fn rejected(response: reqwest::Response) -> BackendError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(ErrorBody {
            message: Some(message),
            ..
        }) => message,
        Ok(ErrorBody { code: Some(code), .. }) => code,
        _ if body.trim().is_empty() => format!("HTTP {}", status),
        _ => body.chars().take(500).collect(),
    };
    BackendError::Rejected { status, message }
}

// ── Dify client ────────────────────────────────────────────────────────────────

pub struct DifyClient {
    client: reqwest::Client,
    config: BackendConfig,
}

impl DifyClient {
    pub fn new(config: BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build Dify HTTP client")?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path)
    }
}

#[async_trait]
impl Backend for DifyClient {
    async fn send(&self, turn: &ChatTurn, mode: ResponseMode) -> Result<BackendReply, BackendError> {
        let request = ChatRequest {
            query: &turn.query,
            inputs: serde_json::Map::new(),
            response_mode: mode,
            user: &turn.user,
            auto_generate_name: true,
            conversation_id: turn.conversation_id.as_deref(),
            files: &turn.files,
        };

        let url = self.url("chat-messages");
        debug!(
            "Sending {} request to Dify: {} (conversation: {:?}, files: {})",
            mode,
            url,
            turn.conversation_id,
            turn.files.len()
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        match mode {
            ResponseMode::Blocking => {
                let body: BlockingResponse = response.json().await?;
                Ok(BackendReply::Complete(Answer {
                    text: body.answer,
                    conversation_id: body.conversation_id,
                    message_id: body.message_id,
                    sources: body.metadata.retriever_resources,
                }))
            }
            ResponseMode::Streaming => Ok(BackendReply::Streaming(event_stream(
                response.bytes_stream().boxed(),
            ))),
        }
    }

    async fn upload_file(
        &self,
        upload: FileUpload,
        user: &str,
    ) -> Result<UploadedFile, BackendError> {
        let kind = FileKind::detect(&upload.mimetype, &upload.name);
        let mime = if upload.mimetype.contains('/') {
            upload.mimetype.clone()
        } else {
            content_type_for(&upload.name).to_string()
        };
        let size = upload.bytes.len();

        let part = reqwest::multipart::Part::bytes(upload.bytes)
            .file_name(upload.name.clone())
            .mime_str(&mime)
            .map_err(|e| BackendError::Rejected {
                status: 415,
                message: format!("invalid content type {}: {}", mime, e),
            })?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("user", user.to_string());

        debug!("Uploading {} ({} bytes, {}) to Dify", upload.name, size, mime);

        let response = self
            .client
            .post(self.url("files/upload"))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await?;

        match response.status().as_u16() {
            200 | 201 => {
                let body: UploadResponse = response.json().await?;
                info!("Uploaded {} as {} ({:?})", upload.name, body.id, kind);
                Ok(UploadedFile { id: body.id, kind })
            }
            413 => Err(BackendError::Rejected {
                status: 413,
                message: format!("{} is too large for the backend", upload.name),
            }),
            415 => Err(BackendError::Rejected {
                status: 415,
                message: format!("file type of {} is not supported by the backend", upload.name),
            }),
            _ => Err(rejected(response).await),
        }
    }

    async fn suggested_questions(
        &self,
        message_id: &str,
        user: &str,
    ) -> Result<Vec<String>, BackendError> {
        let response = self
            .client
            .get(self.url(&format!("messages/{}/suggested", message_id)))
            .bearer_auth(&self.config.api_key)
            .query(&[("user", user)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        let body: SuggestedResponse = response.json().await?;
        Ok(body.data)
    }
}
