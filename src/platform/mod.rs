pub mod slack;

use anyhow::Result;
use async_trait::async_trait;

/// A file attached to an inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct FileRef {
    pub id: String,
    pub name: String,
    pub mimetype: String,
    /// Size in bytes as reported by the platform
    pub size: u64,
    /// Authenticated download URL
    pub url_private: Option<String>,
}

/// A human-authored message the bot should answer
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub channel: String,
    /// Thread root timestamp; a top-level message starts its own thread
    pub thread: String,
    pub sender: String,
    pub text: String,
    pub files: Vec<FileRef>,
}

impl Message {
    pub fn thread_key(&self) -> ThreadKey {
        ThreadKey {
            channel: self.channel.clone(),
            thread: self.thread.clone(),
        }
    }
}

/// Why an event was acknowledged without a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedReason {
    /// Posted by this bot
    SelfAuthored,
    /// Posted by some other bot or integration
    BotMessage,
    Edited,
    Subtype(String),
    /// Channel message that mentions the bot; the app_mention twin handles it
    MentionInMessage,
    /// Channel message without a mention
    NotDirect,
    MissingField(&'static str),
    UnknownKind(String),
}

/// Inbound events, classified once at the edge
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Mention(Message),
    DirectMessage(Message),
    Unsupported(UnsupportedReason),
}

/// Identifies a conversation thread across deliveries
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadKey {
    pub channel: String,
    pub thread: String,
}

impl std::fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel, self.thread)
    }
}

/// A reply addressed to the thread that triggered it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReply {
    pub channel: String,
    pub thread: String,
    pub text: String,
}

/// Outbound side of the chat platform
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn post_reply(&self, reply: &OutboundReply) -> Result<()>;

    /// Show `text` to `user` alone, as a progress notice
    async fn post_ephemeral(&self, channel: &str, user: &str, text: &str) -> Result<()>;

    async fn download_file(&self, file: &FileRef) -> Result<Vec<u8>>;
}
