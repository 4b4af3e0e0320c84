//! Telegram adapter: teloxide-based ingress/egress, following the
//! dptree dispatcher pattern used elsewhere in this codebase — a
//! `SharedState` injected into handlers via `dptree::deps!`, one branch
//! per update kind, and a separate outbound-sender task draining a
//! channel of replies back to Telegram.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::router::{Router, RouterOutput, RouterOwner};
use crate::transport::selfchat::SelfChatSink;

/// Hard cap on a Telegram outbound payload; longer replies are truncated.
const MAX_TELEGRAM_CHARS: usize = 4000;

/// Requests allowed from an unrecognized Telegram id within the window
/// before further messages from it are silently dropped.
const UNKNOWN_SENDER_LIMIT: u32 = 20;

/// Window over which the unknown-sender limit is enforced.
const UNKNOWN_SENDER_WINDOW: Duration = Duration::from_secs(60);

/// Minimum spacing enforced between two outbound sends to the same chat,
/// to coalesce bursts of near-simultaneous router output.
const REPLY_RATE_LIMIT: Duration = Duration::from_millis(3000);

/// An outbound Telegram send, queued for the dedicated sender task.
pub struct TelegramOutbound {
    /// Destination chat id (positive = user DM, negative = group).
    pub chat_id: i64,
    /// Message body to send.
    pub text: String,
}

/// Tracks recent-request timestamps for a single not-yet-known sender.
struct UnknownSenderWindow {
    timestamps: VecDeque<Instant>,
}

impl UnknownSenderWindow {
    fn new() -> Self {
        Self { timestamps: VecDeque::new() }
    }

    /// Record a request at `now`, returning whether it's within the
    /// allowance after evicting timestamps that have aged out.
    fn record_and_check(&mut self, now: Instant) -> bool {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) > UNKNOWN_SENDER_WINDOW {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        if self.timestamps.len() as u32 >= UNKNOWN_SENDER_LIMIT {
            return false;
        }
        self.timestamps.push_back(now);
        true
    }
}

/// Shared dependencies injected into teloxide handlers via `dptree::deps!`.
#[derive(Clone)]
struct SharedState {
    router: Arc<Router>,
    unknown_senders: Arc<Mutex<HashMap<i64, UnknownSenderWindow>>>,
    last_reply_at: Arc<Mutex<HashMap<i64, Instant>>>,
    self_chat: Arc<dyn SelfChatSink>,
    outbound_tx: mpsc::Sender<TelegramOutbound>,
}

/// Build the channel used to queue outbound Telegram sends. Shared with
/// the scheduler so reminder deliveries land on the same outbound path
/// as live replies.
pub fn outbound_channel(capacity: usize) -> (mpsc::Sender<TelegramOutbound>, mpsc::Receiver<TelegramOutbound>) {
    mpsc::channel(capacity)
}

/// Run the Telegram bot adapter: an outbound sender task plus the
/// teloxide dispatcher, until ctrl-c or the dispatcher otherwise exits.
pub async fn run_telegram(
    bot_token: &str,
    router: Arc<Router>,
    self_chat: Arc<dyn SelfChatSink>,
    outbound_tx: mpsc::Sender<TelegramOutbound>,
    mut outbound_rx: mpsc::Receiver<TelegramOutbound>,
) -> anyhow::Result<()> {
    let bot = Bot::new(bot_token);

    let outbound_bot = bot.clone();
    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let text = truncate_telegram(&msg.text);
            if let Err(err) = outbound_bot.send_message(ChatId(msg.chat_id), text).await {
                warn!(error = %err, chat_id = msg.chat_id, "failed to send telegram message");
            }
        }
    });

    let shared = SharedState {
        router,
        unknown_senders: Arc::new(Mutex::new(HashMap::new())),
        last_reply_at: Arc::new(Mutex::new(HashMap::new())),
        self_chat,
        outbound_tx,
    };

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));

    info!("telegram dispatcher starting");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![shared])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

/// Handle an incoming Telegram message: admission gating, meta-commands,
/// and routing through the shared pipeline.
async fn handle_message(msg: Message, state: SharedState) -> ResponseResult<()> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    let telegram_id = i64::try_from(from.id.0).unwrap_or(0);
    let display_name = from.first_name.clone();

    let Some(text) = msg.text() else {
        return Ok(());
    };

    if !state.router.telegram_sender_known(telegram_id).await {
        let now = Instant::now();
        let mut windows = state.unknown_senders.lock().await;
        let window = windows.entry(telegram_id).or_insert_with(UnknownSenderWindow::new);
        if !window.record_and_check(now) {
            warn!(telegram_id, "unknown-sender rate limit exceeded; dropping message");
            return Ok(());
        }
    }

    match text.trim() {
        "/start" | "/myid" | "/id" => {
            send(&state, msg.chat.id.0, telegram_id, format!("Your Telegram id is {telegram_id}.")).await;
            return Ok(());
        }
        _ => {}
    }

    let owner = RouterOwner::Telegram { id: telegram_id, display_name };
    let request_id = format!("telegram-{}-{}", telegram_id, msg.id.0);
    let output = state.router.route(&request_id, &owner, text).await;

    deliver(&state, telegram_id, msg.chat.id.0, output).await;
    Ok(())
}

/// Deliver a routing outcome: a dispatch envelope prefers the
/// recipient's Telegram id when present, otherwise falls through to the
/// self-chat adapter; a plain reply always goes back to the sender.
async fn deliver(state: &SharedState, sender_telegram_id: i64, sender_chat_id: i64, output: RouterOutput) {
    match output {
        RouterOutput::Reply(text) => {
            send(state, sender_chat_id, sender_telegram_id, text).await;
        }
        RouterOutput::Dispatch(envelope) => {
            send(state, sender_chat_id, sender_telegram_id, envelope.reply_to_sender).await;

            if let Some(telegram_id) = envelope.send_to_telegram_id.as_deref().and_then(|id| id.parse::<i64>().ok()) {
                send(state, telegram_id, telegram_id, envelope.send_body).await;
            } else if let Err(err) = state.self_chat.send(&envelope.send_to, &envelope.send_body).await {
                warn!(error = %err, recipient = %envelope.send_to, "failed to hand dispatch off to self-chat");
            }
        }
    }
}

/// Queue `text` for delivery to `chat_id`, enforcing the global minimum
/// inter-reply spacing for `telegram_id` to coalesce bursts.
async fn send(state: &SharedState, chat_id: i64, telegram_id: i64, text: String) {
    {
        let mut last_reply_at = state.last_reply_at.lock().await;
        if let Some(last) = last_reply_at.get(&telegram_id) {
            let elapsed = last.elapsed();
            if elapsed < REPLY_RATE_LIMIT {
                tokio::time::sleep(REPLY_RATE_LIMIT - elapsed).await;
            }
        }
        last_reply_at.insert(telegram_id, Instant::now());
    }

    if state.outbound_tx.send(TelegramOutbound { chat_id, text }).await.is_err() {
        warn!("telegram outbound channel closed; dropping message");
    }
}

/// Truncate a reply to [`MAX_TELEGRAM_CHARS`], appending `...` if truncated.
fn truncate_telegram(reply: &str) -> String {
    if reply.chars().count() <= MAX_TELEGRAM_CHARS {
        return reply.to_owned();
    }
    let truncated: String = reply.chars().take(MAX_TELEGRAM_CHARS - 3).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_over_telegram_limit_is_truncated() {
        let reply = "a".repeat(MAX_TELEGRAM_CHARS + 1);
        let truncated = truncate_telegram(&reply);
        assert_eq!(truncated.chars().count(), MAX_TELEGRAM_CHARS);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn reply_exactly_at_telegram_limit_is_unmodified() {
        let reply = "a".repeat(MAX_TELEGRAM_CHARS);
        assert_eq!(truncate_telegram(&reply), reply);
    }

    #[test]
    fn unknown_sender_window_allows_up_to_the_limit() {
        let mut window = UnknownSenderWindow::new();
        let now = Instant::now();
        for _ in 0..UNKNOWN_SENDER_LIMIT {
            assert!(window.record_and_check(now));
        }
        assert!(!window.record_and_check(now));
    }

    #[test]
    fn unknown_sender_window_recovers_after_the_window_elapses() {
        let mut window = UnknownSenderWindow::new();
        let now = Instant::now();
        for _ in 0..UNKNOWN_SENDER_LIMIT {
            assert!(window.record_and_check(now));
        }
        let later = now + UNKNOWN_SENDER_WINDOW + Duration::from_secs(1);
        assert!(window.record_and_check(later));
    }
}
