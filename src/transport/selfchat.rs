//! Self-chat adapter: consumes an externally-observed message stream (a
//! user talking to themselves in their own chat) and, on a recognized
//! trigger, routes it the same way any other transport would.
//!
//! The observer and the outbound sender are both realized here as a local
//! JSON-lines stream, in the spirit of a log-tailing watcher: this module
//! owns only the consumption/gating/de-duplication logic, never the
//! proprietary transport the observer itself runs on.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::router::{Router, RouterOutput, RouterOwner};
use crate::transport::{BoundedSet, TransportError};

/// Maximum length of an outbound self-chat payload before hard truncation.
const MAX_SELFCHAT_CHARS: usize = 2000;

/// How often the event stream is polled for new lines.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// Capacity of each de-duplication ring.
const DEDUP_CAPACITY: usize = 100;

/// Literal prefix required to trigger the agent from self-chat.
const TRIGGER_PREFIX: &str = "Bo ";

/// One event surfaced by the external observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfChatEvent {
    /// Unique id for this message, stable across repeated observations.
    pub guid: String,
    /// Raw message text.
    pub text: String,
    /// Canonical or raw sender identifier, e.g. a phone number.
    pub sender: String,
    /// The chat this message arrived in.
    #[serde(rename = "chatId")]
    pub chat_id: String,
    /// Whether this message was sent by the system itself.
    #[serde(rename = "isFromMe")]
    pub is_from_me: bool,
    /// Whether this is a reaction/tapback rather than a real message.
    #[serde(rename = "isReaction")]
    pub is_reaction: bool,
    /// When the observer saw this message.
    pub date: DateTime<Utc>,
}

/// Pulls new events from the external observer. Implementations are
/// expected to be resilient to transient read failures; a poll that can't
/// make progress should return an empty batch rather than erroring.
#[async_trait::async_trait]
pub trait SelfChatSource: Send + Sync {
    /// Fetch whatever events have arrived since the last poll.
    async fn poll(&mut self) -> Vec<SelfChatEvent>;
}

/// Delivers an outbound self-chat message, returning the guid the
/// observer will eventually report back for it (so it can be pre-seeded
/// into the de-dup set and never re-trigger the agent).
#[async_trait::async_trait]
pub trait SelfChatSink: Send + Sync {
    /// Send `text` addressed to `phone`.
    async fn send(&self, phone: &str, text: &str) -> Result<String, TransportError>;
}

/// Tails a JSON-lines file the external observer appends to, following
/// the same offset-tracking, file-rotation-aware approach used to watch
/// rotated log files: resume from the last read offset, and reset to the
/// start if the file has shrunk (rotated) since the last poll.
pub struct JsonlEventSource {
    path: PathBuf,
    offset: u64,
}

impl JsonlEventSource {
    /// Watch `path` for newly-appended JSON lines, starting at its
    /// current length (so pre-existing lines are not replayed on start).
    pub async fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let offset = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        Self { path, offset }
    }
}

#[async_trait::async_trait]
impl SelfChatSource for JsonlEventSource {
    async fn poll(&mut self) -> Vec<SelfChatEvent> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(_) => return Vec::new(),
        };

        if metadata.len() < self.offset {
            // The file shrank underneath us; treat it as rotated and
            // restart from the top rather than seeking past the end.
            self.offset = 0;
        }
        if metadata.len() == self.offset {
            return Vec::new();
        }

        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(err) => {
                warn!(error = %err, path = %self.path.display(), "failed to read self-chat event stream");
                return Vec::new();
            }
        };

        let new_bytes = &contents[self.offset as usize..];
        self.offset = contents.len() as u64;

        String::from_utf8_lossy(new_bytes)
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() {
                    return None;
                }
                match serde_json::from_str::<SelfChatEvent>(line) {
                    Ok(event) => Some(event),
                    Err(err) => {
                        warn!(error = %err, "skipping unparseable self-chat event");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Appends outbound messages as JSON lines for the external sender to
/// pick up and actually deliver.
pub struct JsonlEventSink {
    path: PathBuf,
}

impl JsonlEventSink {
    /// Write outbound self-chat messages to `path`, appending.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl SelfChatSink for JsonlEventSink {
    async fn send(&self, phone: &str, text: &str) -> Result<String, TransportError> {
        let guid = uuid::Uuid::new_v4().to_string();
        let line = serde_json::json!({ "guid": guid, "to": phone, "text": text });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| TransportError::Api(err.to_string()))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|err| TransportError::Api(err.to_string()))?;
        Ok(guid)
    }
}

/// De-duplication state, bounded so a long-running process never grows
/// these sets without limit.
struct DedupState {
    guids: BoundedSet<String>,
    sender_text: BoundedSet<String>,
    recent_bodies: BoundedSet<String>,
    recent_replies: BoundedSet<String>,
}

impl DedupState {
    fn new() -> Self {
        Self {
            guids: BoundedSet::new(DEDUP_CAPACITY),
            sender_text: BoundedSet::new(DEDUP_CAPACITY),
            recent_bodies: BoundedSet::new(DEDUP_CAPACITY),
            recent_replies: BoundedSet::new(DEDUP_CAPACITY),
        }
    }
}

/// Runs the self-chat ingress/egress loop: poll for events, gate and
/// route qualifying ones, and deliver the router's output back out.
pub struct SelfChatTransport {
    router: Arc<Router>,
    agent_numbers: Vec<String>,
    sink: Arc<dyn SelfChatSink>,
    dedup: Mutex<DedupState>,
    poll_interval: Duration,
}

impl SelfChatTransport {
    /// Build a transport over `router`, gating non-self-chat senders to
    /// `agent_numbers` (canonical phones allowed to trigger the agent).
    pub fn new(router: Arc<Router>, agent_numbers: Vec<String>, sink: Arc<dyn SelfChatSink>) -> Self {
        Self {
            router,
            agent_numbers,
            sink,
            dedup: Mutex::new(DedupState::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Poll `source` until `shutdown` signals true or closes.
    pub async fn run(&self, mut source: Box<dyn SelfChatSource>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        info!("self-chat transport started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for event in source.poll().await {
                        self.handle_event(&event).await;
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("self-chat transport stopped");
    }

    /// Apply the admission gate and de-duplication to a single event,
    /// routing it and delivering the reply if it qualifies.
    async fn handle_event(&self, event: &SelfChatEvent) {
        if event.is_from_me || event.is_reaction {
            return;
        }

        let Some(stripped) = event.text.strip_prefix(TRIGGER_PREFIX) else {
            return;
        };
        if stripped.is_empty() {
            return;
        }

        let canonical_sender = crate::identity::canonicalize(&event.sender);
        let is_self_chat = event.chat_id == event.sender;
        let is_agent_trigger = self.agent_numbers.iter().any(|n| n == &canonical_sender);
        if !is_self_chat && !is_agent_trigger {
            return;
        }

        {
            let mut dedup = self.dedup.lock().await;
            if !dedup.guids.insert(event.guid.clone()) {
                return;
            }
            let sender_text_key = format!("{canonical_sender}:{stripped}");
            if !dedup.sender_text.insert(sender_text_key) {
                return;
            }
            if !dedup.recent_bodies.insert(stripped.to_owned()) {
                return;
            }
        }

        let owner = RouterOwner::Phone {
            raw: canonical_sender.clone(),
            display_name: canonical_sender.clone(),
        };
        let request_id = format!("selfchat-{}", event.guid);
        let output = self.router.route(&request_id, &owner, stripped).await;
        self.deliver(&canonical_sender, output).await;
    }

    /// Send the router's output back out through the self-chat sink,
    /// remembering our own outbound guid so the observer's echo of it
    /// never re-triggers the agent.
    async fn deliver(&self, default_recipient: &str, output: RouterOutput) {
        let (recipient, body) = match output {
            RouterOutput::Reply(text) => (default_recipient.to_owned(), text),
            RouterOutput::Dispatch(envelope) => (envelope.send_to, envelope.send_body),
        };

        let truncated = truncate_selfchat(&body);

        {
            let mut dedup = self.dedup.lock().await;
            if !dedup.recent_replies.insert(truncated.clone()) {
                return;
            }
        }

        match self.sink.send(&recipient, &truncated).await {
            Ok(guid) => {
                let mut dedup = self.dedup.lock().await;
                dedup.guids.insert(guid);
            }
            Err(err) => warn!(error = %err, recipient = %recipient, "failed to send self-chat message"),
        }
    }
}

/// Truncate a reply to [`MAX_SELFCHAT_CHARS`], appending `...` if truncated.
fn truncate_selfchat(reply: &str) -> String {
    if reply.chars().count() <= MAX_SELFCHAT_CHARS {
        return reply.to_owned();
    }
    let truncated: String = reply.chars().take(MAX_SELFCHAT_CHARS - 3).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::llm::Gateway;
    use crate::skills::executor::SubprocessExecutor;

    struct RecordingSink {
        sent: StdMutex<Vec<(String, String)>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { sent: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait::async_trait]
    impl SelfChatSink for RecordingSink {
        async fn send(&self, phone: &str, text: &str) -> Result<String, TransportError> {
            self.sent.lock().unwrap().push((phone.to_owned(), text.to_owned()));
            Ok(format!("outbound-{}", self.sent.lock().unwrap().len()))
        }
    }

    fn event(guid: &str, text: &str, sender: &str) -> SelfChatEvent {
        SelfChatEvent {
            guid: guid.to_owned(),
            text: text.to_owned(),
            sender: sender.to_owned(),
            chat_id: sender.to_owned(),
            is_from_me: false,
            is_reaction: false,
            date: Utc::now(),
        }
    }

    async fn transport_with_mock(mock_path: &std::path::Path, agent_numbers: Vec<String>) -> (SelfChatTransport, Arc<RecordingSink>) {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let gateway = Gateway::new(pool.clone(), crate::config::ModelsConfig::default(), None, Some(mock_path.to_owned()), None);
        let executor: Arc<dyn crate::skills::executor::SkillExecutor> = Arc::new(SubprocessExecutor::new());
        let router = Arc::new(Router::new(pool, gateway, executor, 20));
        let sink = Arc::new(RecordingSink::new());
        (SelfChatTransport::new(router, agent_numbers, sink.clone()), sink)
    }

    #[tokio::test]
    async fn message_without_bo_prefix_is_ignored() {
        let mock_path = std::env::temp_dir().join(format!("bo-selfchat-noprefix-{}", std::process::id()));
        tokio::fs::write(&mock_path, r#"{}"#).await.unwrap();
        let (transport, sink) = transport_with_mock(&mock_path, Vec::new()).await;

        transport.handle_event(&event("g1", "hello there", "5551234567")).await;

        assert!(sink.sent.lock().unwrap().is_empty());
        tokio::fs::remove_file(&mock_path).await.ok();
    }

    #[tokio::test]
    async fn reaction_is_ignored_even_with_bo_prefix() {
        let mock_path = std::env::temp_dir().join(format!("bo-selfchat-reaction-{}", std::process::id()));
        tokio::fs::write(&mock_path, r#"{}"#).await.unwrap();
        let (transport, sink) = transport_with_mock(&mock_path, Vec::new()).await;

        let mut ev = event("g1", "Bo hi", "5551234567");
        ev.is_reaction = true;
        transport.handle_event(&ev).await;

        assert!(sink.sent.lock().unwrap().is_empty());
        tokio::fs::remove_file(&mock_path).await.ok();
    }

    #[tokio::test]
    async fn bare_bo_prefix_with_no_remainder_is_rejected() {
        let mock_path = std::env::temp_dir().join(format!("bo-selfchat-bare-{}", std::process::id()));
        tokio::fs::write(&mock_path, r#"{}"#).await.unwrap();
        let (transport, sink) = transport_with_mock(&mock_path, Vec::new()).await;

        transport.handle_event(&event("g1", "Bo ", "5551234567")).await;

        assert!(sink.sent.lock().unwrap().is_empty());
        tokio::fs::remove_file(&mock_path).await.ok();
    }

    #[tokio::test]
    async fn non_self_chat_sender_outside_agent_numbers_is_ignored() {
        let mock_path = std::env::temp_dir().join(format!("bo-selfchat-stranger-{}", std::process::id()));
        tokio::fs::write(&mock_path, r#"{}"#).await.unwrap();
        let (transport, sink) = transport_with_mock(&mock_path, Vec::new()).await;

        let mut ev = event("g1", "Bo hi", "5551234567");
        ev.chat_id = "some-other-chat".to_owned();
        transport.handle_event(&ev).await;

        assert!(sink.sent.lock().unwrap().is_empty());
        tokio::fs::remove_file(&mock_path).await.ok();
    }

    #[tokio::test]
    async fn self_chat_message_with_bo_prefix_is_routed_and_replied() {
        let mock_path = std::env::temp_dir().join(format!("bo-selfchat-ok-{}", std::process::id()));
        tokio::fs::write(
            &mock_path,
            r#"{"fact_finding": "[]", "what_to_do": "{\"skill\":\"create_a_response\"}", "create_response": "Hi there!", "summary": "said hi"}"#,
        )
        .await
        .unwrap();
        let (transport, sink) = transport_with_mock(&mock_path, Vec::new()).await;

        transport.handle_event(&event("g1", "Bo hi", "5551234567")).await;

        {
            let sent = sink.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].1, "Hi there!");
        }
        tokio::fs::remove_file(&mock_path).await.ok();
    }

    #[tokio::test]
    async fn agent_trigger_number_outside_self_chat_is_allowed() {
        let mock_path = std::env::temp_dir().join(format!("bo-selfchat-trigger-{}", std::process::id()));
        tokio::fs::write(
            &mock_path,
            r#"{"fact_finding": "[]", "what_to_do": "{\"skill\":\"create_a_response\"}", "create_response": "Hi there!", "summary": "said hi"}"#,
        )
        .await
        .unwrap();
        let (transport, sink) = transport_with_mock(&mock_path, vec!["5551234567".to_owned()]).await;

        let mut ev = event("g1", "Bo hi", "5551234567");
        ev.chat_id = "group-chat".to_owned();
        transport.handle_event(&ev).await;

        assert_eq!(sink.sent.lock().unwrap().len(), 1);
        tokio::fs::remove_file(&mock_path).await.ok();
    }

    #[tokio::test]
    async fn duplicate_guid_is_not_routed_twice() {
        let mock_path = std::env::temp_dir().join(format!("bo-selfchat-dup-{}", std::process::id()));
        tokio::fs::write(
            &mock_path,
            r#"{"fact_finding": "[]", "what_to_do": "{\"skill\":\"create_a_response\"}", "create_response": "Hi there!", "summary": "said hi"}"#,
        )
        .await
        .unwrap();
        let (transport, sink) = transport_with_mock(&mock_path, Vec::new()).await;

        let ev = event("g1", "Bo hi", "5551234567");
        transport.handle_event(&ev).await;
        transport.handle_event(&ev).await;

        assert_eq!(sink.sent.lock().unwrap().len(), 1);
        tokio::fs::remove_file(&mock_path).await.ok();
    }

    #[tokio::test]
    async fn jsonl_event_source_reads_only_newly_appended_lines() {
        let path = std::env::temp_dir().join(format!("bo-selfchat-source-{}", std::process::id()));
        tokio::fs::write(&path, "").await.unwrap();
        let mut source = JsonlEventSource::new(&path).await;

        assert!(source.poll().await.is_empty());

        let line = serde_json::to_string(&event("g1", "Bo hi", "5551234567")).unwrap();
        tokio::fs::write(&path, format!("{line}\n")).await.unwrap();
        let events = source.poll().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].guid, "g1");

        assert!(source.poll().await.is_empty());
        tokio::fs::remove_file(&path).await.ok();
    }

    #[test]
    fn reply_over_selfchat_limit_is_truncated() {
        let reply = "a".repeat(MAX_SELFCHAT_CHARS + 1);
        let truncated = truncate_selfchat(&reply);
        assert_eq!(truncated.chars().count(), MAX_SELFCHAT_CHARS);
        assert!(truncated.ends_with("..."));
    }

}
