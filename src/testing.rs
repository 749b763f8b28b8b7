//! Hand-written doubles for the backend and chat platform seams.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::StreamExt;
use tokio::sync::Notify;

use crate::backend::{
    Answer, Backend, BackendReply, ChatTurn, FileKind, FileUpload, StreamEvent, UploadedFile,
};
use crate::config::ResponseMode;
use crate::error::BackendError;
use crate::platform::{ChatPlatform, FileRef, OutboundReply};

pub enum MockReply {
    Answer { text: String, conversation_id: String },
    Chunks { chunks: Vec<String>, conversation_id: String },
    Error(BackendError),
    Hang,
}

impl MockReply {
    pub fn answer(text: &str, conversation_id: &str) -> Self {
        MockReply::Answer {
            text: text.to_string(),
            conversation_id: conversation_id.to_string(),
        }
    }
}

/// Replays queued replies in order; an empty queue answers "ok"
#[derive(Default)]
pub struct MockBackend {
    pub replies: Mutex<VecDeque<MockReply>>,
    pub turns: Mutex<Vec<(ChatTurn, ResponseMode)>>,
    pub uploads: Mutex<Vec<String>>,
    pub fail_uploads: bool,
    pub suggestions: Vec<String>,
}

impl MockBackend {
    pub fn with_replies(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn turns(&self) -> Vec<ChatTurn> {
        self.turns
            .lock()
            .unwrap()
            .iter()
            .map(|(turn, _)| turn.clone())
            .collect()
    }

    pub fn send_count(&self) -> usize {
        self.turns.lock().unwrap().len()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn send(&self, turn: &ChatTurn, mode: ResponseMode) -> Result<BackendReply, BackendError> {
        self.turns.lock().unwrap().push((turn.clone(), mode));
        let next = self.replies.lock().unwrap().pop_front();
        match next.unwrap_or_else(|| MockReply::answer("ok", "conv-default")) {
            MockReply::Answer {
                text,
                conversation_id,
            } => Ok(BackendReply::Complete(Answer {
                text,
                conversation_id: Some(conversation_id),
                message_id: Some("msg-1".to_string()),
                sources: Vec::new(),
            })),
            MockReply::Chunks {
                chunks,
                conversation_id,
            } => {
                let mut events: Vec<Result<StreamEvent, BackendError>> = chunks
                    .into_iter()
                    .map(|text| {
                        Ok(StreamEvent::Chunk {
                            text,
                            conversation_id: Some(conversation_id.clone()),
                            message_id: None,
                        })
                    })
                    .collect();
                events.push(Ok(StreamEvent::End {
                    conversation_id: Some(conversation_id),
                    sources: Vec::new(),
                }));
                Ok(BackendReply::Streaming(futures::stream::iter(events).boxed()))
            }
            MockReply::Error(e) => Err(e),
            MockReply::Hang => std::future::pending().await,
        }
    }

    async fn upload_file(
        &self,
        upload: FileUpload,
        _user: &str,
    ) -> Result<UploadedFile, BackendError> {
        if self.fail_uploads {
            return Err(BackendError::Rejected {
                status: 415,
                message: "unsupported".to_string(),
            });
        }
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push(upload.name.clone());
        Ok(UploadedFile {
            id: format!("upload-{}", uploads.len()),
            kind: FileKind::detect(&upload.mimetype, &upload.name),
        })
    }

    async fn suggested_questions(
        &self,
        _message_id: &str,
        _user: &str,
    ) -> Result<Vec<String>, BackendError> {
        Ok(self.suggestions.clone())
    }
}

/// Ephemeral notice as `(channel, user, text)`
pub type Ephemeral = (String, String, String);

/// Records every reply and signals each post
#[derive(Default)]
pub struct RecordingPlatform {
    pub posted: Mutex<Vec<OutboundReply>>,
    pub ephemerals: Mutex<Vec<Ephemeral>>,
    pub fail_ephemerals: bool,
    pub post_signal: Notify,
}

impl RecordingPlatform {
    pub fn posted(&self) -> Vec<OutboundReply> {
        self.posted.lock().unwrap().clone()
    }

    pub fn ephemerals(&self) -> Vec<Ephemeral> {
        self.ephemerals.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatPlatform for RecordingPlatform {
    async fn post_reply(&self, reply: &OutboundReply) -> Result<()> {
        self.posted.lock().unwrap().push(reply.clone());
        self.post_signal.notify_one();
        Ok(())
    }

    async fn post_ephemeral(&self, channel: &str, user: &str, text: &str) -> Result<()> {
        if self.fail_ephemerals {
            anyhow::bail!("Slack chat.postEphemeral failed: user_not_in_channel");
        }
        self.ephemerals
            .lock()
            .unwrap()
            .push((channel.to_string(), user.to_string(), text.to_string()));
        Ok(())
    }

    async fn download_file(&self, file: &FileRef) -> Result<Vec<u8>> {
        match &file.url_private {
            Some(_) => Ok(format!("contents of {}", file.name).into_bytes()),
            None => anyhow::bail!("File {} has no private URL", file.name),
        }
    }
}
