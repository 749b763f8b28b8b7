use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::backend::{Answer, Backend, ChatTurn, FileInput, FileUpload};
use crate::config::{FileConfig, ResponseMode};
use crate::error::BackendError;
use crate::memory::ConversationStore;
use crate::platform::slack::{strip_mentions, truncate_text, MAX_MESSAGE_CHARS};
use crate::platform::{ChatPlatform, InboundEvent, Message, OutboundReply};

const NEED_INPUT: &str = "I need some text or files to work with!";
const NO_USABLE_FILES: &str = "None of the uploaded files could be processed. \
     They may be in an unsupported format or too large. \
     Please try PDF, TXT, DOC, XLS or image files.";
const FILES_ONLY_PROMPT: &str = "Please take a look at the attached file(s).";
const THINKING: &str = "Thinking...";

/// User-facing text for a backend failure. Never includes error detail.
pub fn apology(err: &BackendError) -> &'static str {
    match err {
        BackendError::Unavailable(_) => {
            "I'm having trouble connecting to the AI service. Please try again later."
        }
        BackendError::Timeout => {
            "The request took too long to process. Please try again with a simpler question."
        }
        BackendError::Rejected { status: 429, .. } => {
            "I'm receiving too many requests right now. Please wait a moment and try again."
        }
        BackendError::Rejected { status: 400, .. } => {
            "I couldn't understand that input. Please try rephrasing your question."
        }
        BackendError::Rejected { .. } => "Something went wrong on my end. Please try again later.",
    }
}

pub struct RelaySettings {
    pub response_mode: ResponseMode,
    pub request_timeout: Duration,
    pub suggested_questions: bool,
    pub files: FileConfig,
    /// The bot's own user id, when the platform could tell us
    pub bot_user_id: Option<String>,
}

#[derive(Default)]
struct PreparedFiles {
    inputs: Vec<FileInput>,
    skipped: Vec<String>,
}

/// Turns inbound messages into backend turns and posts one reply per message.
/// This is the only place backend failures become user-visible text.
pub struct Relay {
    backend: Arc<dyn Backend>,
    platform: Arc<dyn ChatPlatform>,
    conversations: Arc<dyn ConversationStore>,
    settings: RelaySettings,
}

impl Relay {
    pub fn new(
        backend: Arc<dyn Backend>,
        platform: Arc<dyn ChatPlatform>,
        conversations: Arc<dyn ConversationStore>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            backend,
            platform,
            conversations,
            settings,
        }
    }

    pub fn bot_user_id(&self) -> Option<&str> {
        self.settings.bot_user_id.as_deref()
    }

    /// Answer a classified event. Unsupported events are a no-op.
    pub async fn handle(&self, event: InboundEvent) -> Result<Option<OutboundReply>> {
        let message = match event {
            InboundEvent::Mention(m) | InboundEvent::DirectMessage(m) => m,
            InboundEvent::Unsupported(reason) => {
                debug!("Ignoring event: {:?}", reason);
                return Ok(None);
            }
        };

        info!(
            "Message from {} in {}: {}",
            message.sender,
            message.thread_key(),
            message.text
        );

        let reply = self.respond(&message).await;
        self.platform
            .post_reply(&reply)
            .await
            .with_context(|| format!("Failed to post reply to {}", message.thread_key()))?;
        Ok(Some(reply))
    }

    /// Build the reply for a message. Backend failures become apology text.
    pub async fn respond(&self, message: &Message) -> OutboundReply {
        let text = self.compose(message).await;
        OutboundReply {
            channel: message.channel.clone(),
            thread: message.thread.clone(),
            text: truncate_text(&text, MAX_MESSAGE_CHARS),
        }
    }

    async fn compose(&self, message: &Message) -> String {
        let query = strip_mentions(&message.text, self.bot_user_id());
        if query.is_empty() && message.files.is_empty() {
            return NEED_INPUT.to_string();
        }

        // A blocking answer can take a while with nothing visible in the thread
        if self.settings.response_mode == ResponseMode::Blocking {
            if let Err(e) = self
                .platform
                .post_ephemeral(&message.channel, &message.sender, THINKING)
                .await
            {
                warn!("Failed to post progress notice in {}: {:#}", message.channel, e);
            }
        }

        let thread = message.thread_key();
        let prior = match self.conversations.get(&thread).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Conversation lookup for {} failed: {:#}", thread, e);
                None
            }
        };

        // Uploads finish before the text request so a failure here never
        // leaves a half-answered turn behind.
        let prepared = match self.prepare_files(message).await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("File upload for {} failed: {}", thread, e);
                return apology(&e).to_string();
            }
        };
        if !message.files.is_empty() && prepared.inputs.is_empty() {
            return NO_USABLE_FILES.to_string();
        }

        let turn = ChatTurn {
            query: if query.is_empty() {
                FILES_ONLY_PROMPT.to_string()
            } else {
                query
            },
            user: message.sender.clone(),
            conversation_id: prior,
            files: prepared.inputs,
        };

        let answer = match self.ask(&turn).await {
            Ok(answer) => answer,
            Err(e) => {
                error!("Backend request for {} failed: {}", thread, e);
                return apology(&e).to_string();
            }
        };

        if let Some(id) = &answer.conversation_id {
            if let Err(e) = self.conversations.set(&thread, id).await {
                warn!("Failed to remember conversation for {}: {:#}", thread, e);
            }
        }

        let mut text = answer.render();
        if let Some(suggestions) = self.suggestions(&answer, &turn.user).await {
            text.push_str("\n\n");
            text.push_str(&suggestions);
        }
        if !prepared.skipped.is_empty() {
            text = format!(
                "Some files couldn't be processed: {}\n\n{}",
                prepared.skipped.join(", "),
                text
            );
        }
        text
    }

    /// Send a turn, starting a fresh conversation if the stored one is gone.
    async fn ask(&self, turn: &ChatTurn) -> Result<Answer, BackendError> {
        match self.ask_once(turn).await {
            Err(BackendError::Rejected {
                status: 404,
                message,
            }) if turn.conversation_id.is_some() => {
                warn!(
                    "Conversation {:?} rejected ({}), starting a new one",
                    turn.conversation_id, message
                );
                let fresh = ChatTurn {
                    conversation_id: None,
                    ..turn.clone()
                };
                self.ask_once(&fresh).await
            }
            other => other,
        }
    }

    async fn ask_once(&self, turn: &ChatTurn) -> Result<Answer, BackendError> {
        let exchange = async {
            self.backend
                .send(turn, self.settings.response_mode)
                .await?
                .collect()
                .await
        };
        tokio::time::timeout(self.settings.request_timeout, exchange)
            .await
            .map_err(|_| BackendError::Timeout)?
    }

    async fn prepare_files(&self, message: &Message) -> Result<PreparedFiles, BackendError> {
        let mut prepared = PreparedFiles::default();
        let limits = &self.settings.files;

        for file in &message.files {
            if !limits.is_supported(&file.mimetype) {
                warn!("Unsupported file type: {} ({})", file.name, file.mimetype);
                prepared.skipped.push(file.name.clone());
                continue;
            }
            if file.size > limits.max_file_size {
                warn!("File too large: {} ({} bytes)", file.name, file.size);
                prepared.skipped.push(file.name.clone());
                continue;
            }

            let bytes = match self.platform.download_file(file).await {
                Ok(bytes) if bytes.len() as u64 > limits.max_file_size => {
                    warn!("File too large after download: {} ({} bytes)", file.name, bytes.len());
                    prepared.skipped.push(file.name.clone());
                    continue;
                }
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to download {}: {:#}", file.name, e);
                    prepared.skipped.push(file.name.clone());
                    continue;
                }
            };

            let upload = FileUpload {
                name: file.name.clone(),
                mimetype: file.mimetype.clone(),
                bytes,
            };
            let uploaded = tokio::time::timeout(
                self.settings.request_timeout,
                self.backend.upload_file(upload, &message.sender),
            )
            .await
            .map_err(|_| BackendError::Timeout)??;

            info!("File ready: {} -> {}", file.name, uploaded.id);
            prepared.inputs.push(FileInput::local(&uploaded));
        }

        Ok(prepared)
    }

    async fn suggestions(&self, answer: &Answer, user: &str) -> Option<String> {
        if !self.settings.suggested_questions
            || self.settings.response_mode != ResponseMode::Blocking
        {
            return None;
        }
        let message_id = answer.message_id.as_deref()?;

        match self.backend.suggested_questions(message_id, user).await {
            Ok(questions) if !questions.is_empty() => {
                let mut out = String::from("*Suggested follow-up questions:*");
                for (i, q) in questions.iter().take(3).enumerate() {
                    out.push_str(&format!("\n{}. {}", i + 1, q));
                }
                Some(out)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to fetch suggested questions: {}", e);
                None
            }
        }
    }
}
