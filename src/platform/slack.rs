use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::platform::{
    ChatPlatform, FileRef, InboundEvent, Message, OutboundReply, UnsupportedReason,
};

/// Slack renders at most this many characters comfortably in one message
pub const MAX_MESSAGE_CHARS: usize = 3000;

const API_BASE: &str = "https://slack.com/api";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

// ── Events API payloads ────────────────────────────────────────────────────────

/// Top-level body of a POST to the events endpoint
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    UrlVerification {
        challenge: String,
    },
    EventCallback {
        event: SlackEvent,
        #[serde(default)]
        event_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// The inner `event` object; loose so unknown kinds still parse
#[derive(Debug, Deserialize, Default)]
pub struct SlackEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channel_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub edited: Option<serde_json::Value>,
    #[serde(default)]
    pub files: Vec<SlackFile>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SlackFile {
    #[serde(default)]
    pub id: String,
    #[serde(default = "unknown")]
    pub name: String,
    #[serde(default = "unknown")]
    pub mimetype: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub url_private: Option<String>,
}

fn unknown() -> String {
    "unknown".to_string()
}

impl From<SlackFile> for FileRef {
    fn from(f: SlackFile) -> Self {
        FileRef {
            id: f.id,
            name: f.name,
            mimetype: f.mimetype,
            size: f.size,
            url_private: f.url_private,
        }
    }
}

/// Classify a raw Slack event into something the relay can act on.
///
/// Mentions are answered anywhere. Plain messages are only answered in DMs,
/// and only when they do not also mention the bot, since Slack delivers an
/// `app_mention` for those as well.
pub fn classify(event: SlackEvent, bot_user_id: Option<&str>) -> InboundEvent {
    let is_self = |event: &SlackEvent| {
        matches!((bot_user_id, event.user.as_deref()), (Some(bot), Some(user)) if bot == user)
    };

    match event.kind.as_str() {
        "app_mention" => {
            if is_self(&event) {
                return InboundEvent::Unsupported(UnsupportedReason::SelfAuthored);
            }
            if event.bot_id.is_some() {
                return InboundEvent::Unsupported(UnsupportedReason::BotMessage);
            }
            match into_message(event) {
                Ok(message) => InboundEvent::Mention(message),
                Err(reason) => InboundEvent::Unsupported(reason),
            }
        }
        "message" => {
            if is_self(&event) {
                return InboundEvent::Unsupported(UnsupportedReason::SelfAuthored);
            }
            if event.bot_id.is_some() {
                return InboundEvent::Unsupported(UnsupportedReason::BotMessage);
            }
            if event.edited.is_some() {
                return InboundEvent::Unsupported(UnsupportedReason::Edited);
            }
            // file_share is an ordinary user message carrying attachments
            if let Some(subtype) = event.subtype.as_deref() {
                if subtype != "file_share" {
                    return InboundEvent::Unsupported(UnsupportedReason::Subtype(
                        subtype.to_string(),
                    ));
                }
            }
            if mentions(event.text.as_deref().unwrap_or(""), bot_user_id) {
                return InboundEvent::Unsupported(UnsupportedReason::MentionInMessage);
            }
            if event.channel_type.as_deref() != Some("im") {
                return InboundEvent::Unsupported(UnsupportedReason::NotDirect);
            }
            match into_message(event) {
                Ok(message) => InboundEvent::DirectMessage(message),
                Err(reason) => InboundEvent::Unsupported(reason),
            }
        }
        other => InboundEvent::Unsupported(UnsupportedReason::UnknownKind(other.to_string())),
    }
}

fn into_message(event: SlackEvent) -> std::result::Result<Message, UnsupportedReason> {
    let channel = event
        .channel
        .ok_or(UnsupportedReason::MissingField("channel"))?;
    let sender = event.user.ok_or(UnsupportedReason::MissingField("user"))?;
    let thread = event
        .thread_ts
        .or(event.ts)
        .ok_or(UnsupportedReason::MissingField("ts"))?;

    Ok(Message {
        channel,
        thread,
        sender,
        text: event.text.unwrap_or_default(),
        files: event.files.into_iter().map(FileRef::from).collect(),
    })
}

fn mentions(text: &str, bot_user_id: Option<&str>) -> bool {
    match bot_user_id {
        Some(bot) => mention_tokens(text).any(|(_, id)| id == bot),
        None => false,
    }
}

/// Yields `(byte range, user id)` for every `<@U123>` or `<@U123|name>` token
fn mention_tokens(text: &str) -> impl Iterator<Item = (std::ops::Range<usize>, &str)> {
    let mut cursor = 0;
    std::iter::from_fn(move || {
        while let Some(rel) = text[cursor..].find("<@") {
            let start = cursor + rel;
            let Some(len) = text[start..].find('>') else {
                cursor = text.len();
                return None;
            };
            let end = start + len + 1;
            let inner = &text[start + 2..end - 1];
            let id = inner.split('|').next().unwrap_or(inner);
            if !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric()) {
                cursor = end;
                return Some((start..end, id));
            }
            // Not a mention; a real one may start inside it
            cursor = start + 2;
        }
        None
    })
}

/// Remove the bot's own mention tokens and normalise whitespace.
///
/// Without a known bot id every mention token is removed.
pub fn strip_mentions(text: &str, bot_user_id: Option<&str>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (range, id) in mention_tokens(text) {
        if bot_user_id.map_or(true, |bot| bot == id) {
            out.push_str(&text[last..range.start]);
            out.push(' ');
            last = range.end;
        }
    }
    out.push_str(&text[last..]);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut text to Slack's practical message size, marking the cut.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}

// ── Web API client ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    channel: &'a str,
    thread_ts: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct PostEphemeralRequest<'a> {
    channel: &'a str,
    user: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

pub struct SlackClient {
    client: reqwest::Client,
    token: String,
    api_base: String,
}

impl SlackClient {
    pub fn new(token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build Slack HTTP client")?;
        Ok(Self {
            client,
            token: token.to_string(),
            api_base: API_BASE.to_string(),
        })
    }

    /// Resolve the bot's own user id, used to recognise its own messages.
    pub async fn auth_test(&self) -> Result<String> {
        let response = self.call("auth.test", &serde_json::json!({})).await?;
        response
            .user_id
            .context("auth.test response did not include user_id")
    }

    async fn call<T: Serialize + ?Sized>(&self, method: &str, body: &T) -> Result<ApiResponse> {
        let url = format!("{}/{}", self.api_base, method);
        debug!("Calling Slack API: {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to call Slack {}", method))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Slack {} HTTP error ({}): {}", method, status, error_body);
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to parse Slack {} response", method))?;

        if !parsed.ok {
            anyhow::bail!(
                "Slack {} failed: {}",
                method,
                parsed.error.as_deref().unwrap_or("unknown_error")
            );
        }
        Ok(parsed)
    }
}

#[async_trait]
impl ChatPlatform for SlackClient {
    async fn post_reply(&self, reply: &OutboundReply) -> Result<()> {
        let request = PostMessageRequest {
            channel: &reply.channel,
            thread_ts: &reply.thread,
            text: &reply.text,
        };
        self.call("chat.postMessage", &request).await?;
        info!("Posted reply to {}/{}", reply.channel, reply.thread);
        Ok(())
    }

    async fn post_ephemeral(&self, channel: &str, user: &str, text: &str) -> Result<()> {
        let request = PostEphemeralRequest {
            channel,
            user,
            text,
        };
        self.call("chat.postEphemeral", &request).await?;
        debug!("Posted ephemeral notice to {} in {}", user, channel);
        Ok(())
    }

    async fn download_file(&self, file: &FileRef) -> Result<Vec<u8>> {
        let url = file
            .url_private
            .as_deref()
            .with_context(|| format!("File {} has no private URL", file.name))?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("Failed to download {}", file.name))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Download of {} failed ({})", file.name, status);
        }

        // Without files:read Slack answers with its HTML sign-in page
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/html"));
        if is_html && file.mimetype != "text/html" {
            anyhow::bail!(
                "Download of {} returned an HTML page; check the files:read scope",
                file.name
            );
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of {}", file.name))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    const BOT: &str = "U0BOT";

    fn event(json: serde_json::Value) -> SlackEvent {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_url_verification_payload() {
        let payload: EventPayload = serde_json::from_str(
            r#"{"token":"t","challenge":"3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P","type":"url_verification"}"#,
        )
        .unwrap();
        match payload {
            EventPayload::UrlVerification { challenge } => {
                assert_eq!(challenge, "3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P")
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_payload_type_parses_as_other() {
        let payload: EventPayload =
            serde_json::from_str(r#"{"type":"app_rate_limited","minute_rate_limited":1}"#).unwrap();
        assert!(matches!(payload, EventPayload::Other));
    }

    #[test]
    fn test_mention_classified() {
        let payload: EventPayload = serde_json::from_value(serde_json::json!({
            "type": "event_callback",
            "event_id": "Ev1",
            "event": {
                "type": "app_mention",
                "user": "U1",
                "text": "<@U0BOT> hello",
                "ts": "1700000000.000100",
                "channel": "C1"
            }
        }))
        .unwrap();
        let EventPayload::EventCallback { event, event_id } = payload else {
            panic!("expected event callback");
        };
        assert_eq!(event_id.as_deref(), Some("Ev1"));

        match classify(event, Some(BOT)) {
            InboundEvent::Mention(m) => {
                assert_eq!(m.channel, "C1");
                assert_eq!(m.thread, "1700000000.000100");
                assert_eq!(m.sender, "U1");
                assert_eq!(m.text, "<@U0BOT> hello");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_reply_in_thread_uses_thread_root() {
        let e = event(serde_json::json!({
            "type": "app_mention", "user": "U1", "text": "<@U0BOT> more",
            "ts": "2.0", "thread_ts": "1.0", "channel": "C1"
        }));
        let InboundEvent::Mention(m) = classify(e, Some(BOT)) else {
            panic!("expected mention");
        };
        assert_eq!(m.thread, "1.0");
        assert_eq!(m.thread_key().to_string(), "C1/1.0");
    }

    #[test]
    fn test_self_authored_events_ignored() {
        let e = event(serde_json::json!({
            "type": "message", "user": BOT, "text": "hi there",
            "ts": "1.0", "channel": "D1", "channel_type": "im"
        }));
        assert_eq!(
            classify(e, Some(BOT)),
            InboundEvent::Unsupported(UnsupportedReason::SelfAuthored)
        );

        let e = event(serde_json::json!({
            "type": "message", "subtype": "bot_message", "bot_id": "B1",
            "text": "hi", "ts": "1.0", "channel": "D1", "channel_type": "im"
        }));
        assert_eq!(
            classify(e, Some(BOT)),
            InboundEvent::Unsupported(UnsupportedReason::BotMessage)
        );
    }

    #[test]
    fn test_direct_message_classified() {
        let e = event(serde_json::json!({
            "type": "message", "user": "U1", "text": "what's up",
            "ts": "1.0", "channel": "D1", "channel_type": "im"
        }));
        assert!(matches!(classify(e, Some(BOT)), InboundEvent::DirectMessage(_)));
    }

    #[test]
    fn test_channel_messages_ignored() {
        let e = event(serde_json::json!({
            "type": "message", "user": "U1", "text": "chatter",
            "ts": "1.0", "channel": "C1", "channel_type": "channel"
        }));
        assert_eq!(
            classify(e, Some(BOT)),
            InboundEvent::Unsupported(UnsupportedReason::NotDirect)
        );

        let e = event(serde_json::json!({
            "type": "message", "user": "U1", "text": "<@U0BOT> hi",
            "ts": "1.0", "channel": "D1", "channel_type": "im"
        }));
        assert_eq!(
            classify(e, Some(BOT)),
            InboundEvent::Unsupported(UnsupportedReason::MentionInMessage)
        );
    }

    #[test]
    fn test_edits_and_subtypes_ignored() {
        let e = event(serde_json::json!({
            "type": "message", "user": "U1", "text": "fixed typo", "edited": {"ts": "2.0"},
            "ts": "1.0", "channel": "D1", "channel_type": "im"
        }));
        assert_eq!(
            classify(e, Some(BOT)),
            InboundEvent::Unsupported(UnsupportedReason::Edited)
        );

        let e = event(serde_json::json!({
            "type": "message", "subtype": "message_changed",
            "ts": "1.0", "channel": "D1", "channel_type": "im"
        }));
        assert_eq!(
            classify(e, Some(BOT)),
            InboundEvent::Unsupported(UnsupportedReason::Subtype("message_changed".into()))
        );
    }

    #[test]
    fn test_file_share_message_carries_files() {
        let e = event(serde_json::json!({
            "type": "message", "subtype": "file_share", "user": "U1", "text": "see attached",
            "ts": "1.0", "channel": "D1", "channel_type": "im",
            "files": [{
                "id": "F1", "name": "report.pdf", "mimetype": "application/pdf",
                "size": 2048, "url_private": "https://files.slack.com/F1/report.pdf"
            }]
        }));
        let InboundEvent::DirectMessage(m) = classify(e, Some(BOT)) else {
            panic!("expected direct message");
        };
        assert_eq!(m.files.len(), 1);
        assert_eq!(m.files[0].name, "report.pdf");
        assert_eq!(m.files[0].size, 2048);
    }

    #[test]
    fn test_unknown_kind_and_missing_fields() {
        let e = event(serde_json::json!({"type": "reaction_added", "user": "U1"}));
        assert_eq!(
            classify(e, Some(BOT)),
            InboundEvent::Unsupported(UnsupportedReason::UnknownKind("reaction_added".into()))
        );

        let e = event(serde_json::json!({"type": "app_mention", "user": "U1", "ts": "1.0"}));
        assert_eq!(
            classify(e, Some(BOT)),
            InboundEvent::Unsupported(UnsupportedReason::MissingField("channel"))
        );
    }

    #[test]
    fn test_strip_bot_mention() {
        assert_eq!(strip_mentions("<@U0BOT> hello", Some(BOT)), "hello");
        assert_eq!(
            strip_mentions("hey <@U0BOT|relay>   ask <@U2> about  this", Some(BOT)),
            "hey ask <@U2> about this"
        );
        assert_eq!(strip_mentions("<@U0BOT>", Some(BOT)), "");
    }

    #[test]
    fn test_strip_all_mentions_without_bot_id() {
        assert_eq!(strip_mentions("<@U0BOT> ping <@U2>", None), "ping");
        assert_eq!(strip_mentions("a <@ broken", None), "a <@ broken");
    }

    #[test]
    fn test_stray_token_before_mention() {
        assert_eq!(strip_mentions("<@ <@U0BOT> hi", Some(BOT)), "<@ hi");
        assert_eq!(strip_mentions("<@x y> <@U0BOT> hi", Some(BOT)), "<@x y> hi");

        let e = event(serde_json::json!({
            "type": "message", "user": "U1", "text": "<@ <@U0BOT> hi",
            "ts": "1.0", "channel": "D1", "channel_type": "im"
        }));
        assert_eq!(
            classify(e, Some(BOT)),
            InboundEvent::Unsupported(UnsupportedReason::MentionInMessage)
        );
    }

    async fn fake_slack(ok: bool) -> (String, Arc<Mutex<Vec<(String, serde_json::Value)>>>) {
        let calls: Arc<Mutex<Vec<(String, serde_json::Value)>>> = Arc::default();
        let recorded = calls.clone();
        let router = Router::new().route(
            "/api/{method}",
            post(
                move |Path(method): Path<String>, Json(body): Json<serde_json::Value>| {
                    let recorded = recorded.clone();
                    async move {
                        recorded.lock().unwrap().push((method, body));
                        if ok {
                            Json(serde_json::json!({"ok": true}))
                        } else {
                            Json(serde_json::json!({"ok": false, "error": "user_not_in_channel"}))
                        }
                    }
                },
            ),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}/api", addr), calls)
    }

    fn client(api_base: String) -> SlackClient {
        SlackClient {
            api_base,
            ..SlackClient::new("xoxb-test").unwrap()
        }
    }

    #[tokio::test]
    async fn test_post_ephemeral_targets_user() {
        let (base, calls) = fake_slack(true).await;

        client(base)
            .post_ephemeral("C1", "U1", "Thinking...")
            .await
            .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "chat.postEphemeral");
        assert_eq!(
            calls[0].1,
            serde_json::json!({"channel": "C1", "user": "U1", "text": "Thinking..."})
        );
    }

    #[tokio::test]
    async fn test_slack_error_surfaces() {
        let (base, _calls) = fake_slack(false).await;
        let err = client(base)
            .post_ephemeral("C1", "U1", "Thinking...")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("user_not_in_channel"));
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("abcdefghijkl", 10), "abcdefg...");
        let long = "é".repeat(20);
        assert_eq!(truncate_text(&long, 10).chars().count(), 10);
    }
}
