//! A multi-tenant conversational assistant: transport adapters, a
//! multi-stage LLM router pipeline, a pluggable skills subsystem, and the
//! scheduler/rate-limiter/moderation machinery around them.

pub mod config;
pub mod contacts;
pub mod db;
pub mod excuses;
pub mod identity;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod moderation;
pub mod ratelimit;
pub mod router;
pub mod scheduler;
pub mod skills;
pub mod tenant;
pub mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use transport::selfchat::{self, SelfChatSink};
use transport::telegram;

/// Default interval between scheduler sweeps for due reminders.
const SCHEDULER_TICK: std::time::Duration = std::time::Duration::from_secs(30);

/// Delivers scheduler-triggered router output (reminders) to whichever
/// transport owns the recipient, the same way a live reply would be.
struct CombinedOutboundSink {
    telegram_tx: tokio::sync::mpsc::Sender<telegram::TelegramOutbound>,
    self_chat: Arc<dyn SelfChatSink>,
}

#[async_trait::async_trait]
impl scheduler::OutboundSink for CombinedOutboundSink {
    async fn deliver(&self, recipient: &router::RouterOwner, output: router::RouterOutput) {
        let body = match output {
            router::RouterOutput::Reply(text) => text,
            router::RouterOutput::Dispatch(envelope) => envelope.send_body,
        };

        match recipient {
            router::RouterOwner::Telegram { id, .. } => {
                let outbound = telegram::TelegramOutbound { chat_id: *id, text: body };
                if self.telegram_tx.send(outbound).await.is_err() {
                    tracing::warn!("telegram outbound channel closed; dropping reminder delivery");
                }
            }
            router::RouterOwner::Phone { raw, .. } => {
                if let Err(err) = self.self_chat.send(raw, &body).await {
                    tracing::warn!(error = %err, recipient = %raw, "failed to deliver reminder via self-chat");
                }
            }
        }
    }
}

/// Wire up the persistence pool, transports, scheduler, and router
/// pipeline, then run until shut down.
///
/// # Errors
///
/// Returns an error if the persistence pool cannot be opened.
pub async fn run(config: config::Config) -> anyhow::Result<()> {
    let pool = db::connect(&config.database_url).await?;
    tracing::info!(database_url = %config.database_url, "persistence layer ready");

    let gateway = llm::Gateway::new(
        pool.clone(),
        config.models.clone(),
        config.anthropic_api_key.clone(),
        config.llm_mock_path.clone(),
        config.request_log.clone(),
    );
    let executor: Arc<dyn skills::executor::SkillExecutor> = Arc::new(skills::executor::SubprocessExecutor::new());
    let router = Arc::new(router::Router::new(pool.clone(), gateway, executor, config.conversation_messages));

    let selfchat_outbound_path = config.logs_dir.join("selfchat-outbound.jsonl");
    let self_chat_sink: Arc<dyn SelfChatSink> = Arc::new(selfchat::JsonlEventSink::new(selfchat_outbound_path));

    let (telegram_tx, telegram_rx) = telegram::outbound_channel(256);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let sink = Arc::new(CombinedOutboundSink { telegram_tx: telegram_tx.clone(), self_chat: self_chat_sink.clone() });
    let scheduler = scheduler::Scheduler::new(pool.clone(), router.clone(), sink, SCHEDULER_TICK);
    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

    let selfchat_transport = Arc::new(selfchat::SelfChatTransport::new(
        router.clone(),
        config.agent_numbers.clone(),
        self_chat_sink.clone(),
    ));
    let selfchat_inbound_path: PathBuf = config.logs_dir.join("selfchat-inbound.jsonl");
    let selfchat_source = selfchat::JsonlEventSource::new(selfchat_inbound_path).await;
    let selfchat_shutdown = shutdown_rx.clone();
    let selfchat_handle = tokio::spawn(async move {
        selfchat_transport.run(Box::new(selfchat_source), selfchat_shutdown).await;
    });

    let telegram_handle = if let Some(bot_token) = config.telegram_bot_token.clone() {
        let router = router.clone();
        let self_chat_sink = self_chat_sink.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = telegram::run_telegram(&bot_token, router, self_chat_sink, telegram_tx, telegram_rx).await {
                tracing::error!(error = %err, "telegram transport stopped");
            }
        }))
    } else {
        tracing::warn!("no telegram bot token configured; telegram transport disabled");
        None
    };

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = scheduler_handle.await;
    let _ = selfchat_handle.await;
    if let Some(handle) = telegram_handle {
        handle.abort();
    }

    Ok(())
}
