//! The Router: the central state machine that turns one inbound message
//! into one outbound reply or dispatch, running tenancy resolution, rate
//! limiting, moderation, fact extraction, skill selection/execution, and
//! response composition in sequence for a single request.

use std::sync::Arc;

use regex::Regex;
use sqlx::SqlitePool;

use crate::contacts;
use crate::db::family;
use crate::db::moderation::ModerationAction;
use crate::db::reminder::ReminderKind;
use crate::db::user;
use crate::excuses;
use crate::llm::{Gateway, LlmCall, TaskType};
use crate::memory;
use crate::moderation::{self as modgate, OutputClassifier, Severity};
use crate::ratelimit::{Decision, RateLimiter};
use crate::skills::executor::{SkillExecutor, SkillRequest};
use crate::skills::{Registry, SyntheticSkill};
use crate::tenant::{self, Tenant};

/// Keys that must never be persisted as facts, regardless of what the
/// fact-extraction stage returns.
const RESERVED_FACT_KEYS: &[&str] = &["id", "user_id", "family_id", "primary_user_id"];

/// Maximum length of an outbound reply before hard truncation.
const MAX_REPLY_CHARS: usize = 2000;

/// How many prior conversation turns are fed into response composition.
const COMPOSE_HISTORY_TURNS: u32 = 10;

/// How the triggering principal identified itself to a transport.
#[derive(Debug, Clone)]
pub enum RouterOwner {
    /// A Telegram user, identified by their numeric id.
    Telegram { id: i64, display_name: String },
    /// A phone-addressed principal (self-chat or SMS-style transport).
    Phone { raw: String, display_name: String },
}

impl RouterOwner {
    /// The canonical owner token used for ACL checks and audit records.
    fn token(&self) -> String {
        match self {
            Self::Telegram { id, .. } => format!("telegram:{id}"),
            Self::Phone { raw, .. } => crate::identity::canonicalize(raw),
        }
    }
}

/// A dispatch to forward a message to another family member or group,
/// issued instead of a plain reply to the sender.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEnvelope {
    /// Canonical phone of the recipient.
    pub send_to: String,
    /// Body to deliver to the recipient.
    pub send_body: String,
    /// Acknowledgment text shown back to the sender.
    pub reply_to_sender: String,
    /// Recipient's Telegram id, preferred over phone when present.
    pub send_to_telegram_id: Option<String>,
    /// Recipient group identifier, if this is a group dispatch.
    pub send_to_group: Option<String>,
}

/// What a completed routing pass produces.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterOutput {
    /// A plain-text reply to the originating chat.
    Reply(String),
    /// A forward to another family member or group.
    Dispatch(DispatchEnvelope),
}

/// A classifier that never flags anything, used when no real moderation
/// backend is configured. Combined with [`modgate::filter_output`]'s
/// fail-open behavior, an absent classifier is indistinguishable from one
/// that always agrees the response is fine.
pub struct NoopClassifier;

impl OutputClassifier for NoopClassifier {
    fn is_flagged(&self, _response: &str) -> Result<bool, anyhow::Error> {
        Ok(false)
    }
}

/// The router's dependencies, wired once at startup and shared across all
/// per-owner worker tasks.
pub struct Router {
    pool: SqlitePool,
    gateway: Gateway,
    rate_limiter: RateLimiter,
    executor: Arc<dyn SkillExecutor>,
    classifier: Arc<dyn OutputClassifier>,
    conversation_cap: u32,
}

impl Router {
    /// Build a router from its dependencies.
    pub fn new(pool: SqlitePool, gateway: Gateway, executor: Arc<dyn SkillExecutor>, conversation_cap: u32) -> Self {
        Self {
            pool,
            gateway,
            rate_limiter: RateLimiter::new(),
            executor,
            classifier: Arc::new(NoopClassifier),
            conversation_cap,
        }
    }

    /// Whether `family_id` is currently resting in a rate-limit cooldown,
    /// without itself counting as a message toward the window.
    pub async fn family_in_cooldown(&self, family_id: i64) -> bool {
        self.rate_limiter.is_in_cooldown(family_id).await
    }

    /// Whether `telegram_id` has already been seen by the persistence
    /// layer. Used by the Telegram transport to decide whether its
    /// unknown-sender rate limit applies to a given message.
    pub async fn telegram_sender_known(&self, telegram_id: i64) -> bool {
        matches!(
            user::get_user_by_telegram_id(&self.pool, telegram_id).await,
            Ok(Some(_))
        )
    }

    /// Route a single inbound message to completion.
    pub async fn route(&self, request_id: &str, owner: &RouterOwner, user_message: &str) -> RouterOutput {
        let owner_token = owner.token();

        let tenant = match self.resolve_tenant(owner).await {
            Ok(tenant) => tenant,
            Err(err) => {
                tracing::warn!(error = %err, owner = %owner_token, "tenancy resolution failed");
                return RouterOutput::Reply(excuses::random().to_owned());
            }
        };

        if tenant.user.last_active_family != Some(tenant.family.id) {
            if let Err(err) = user::set_last_active_family(&self.pool, tenant.user.id, tenant.family.id).await {
                tracing::warn!(error = %err, user_id = tenant.user.id, "failed to update last-active family");
            }
        }

        let member_count = family::list_members(&self.pool, tenant.family.id)
            .await
            .map(|m| m.len() as i64)
            .unwrap_or(1);

        match self
            .rate_limiter
            .check(&self.pool, tenant.family.id, Some(tenant.user.id), member_count)
            .await
        {
            Ok(Decision::Allowed) => {}
            Ok(Decision::InCooldown { cooldown_until, level }) => {
                return RouterOutput::Reply(format!(
                    "Whoa, let's slow down a little — I'm resting until {} (cooldown level {level}).",
                    cooldown_until.to_rfc3339()
                ));
            }
            Err(err) => {
                tracing::warn!(error = %err, "rate limit check failed; allowing request through");
            }
        }

        let red_flag = modgate::scan(user_message);
        if red_flag.severity == Severity::Critical {
            tracing::error!(target: "bo::admin_alert", owner = %owner_token, flags = ?red_flag.flags, "critical red flag detected");
            let _ = crate::db::moderation::record_flag(
                &self.pool,
                tenant.user.id,
                tenant.family.id,
                user_message,
                None,
                Some(modgate::CRISIS_RESPONSE),
                &red_flag.flags,
                ModerationAction::Flagged,
            )
            .await;
            return RouterOutput::Reply(modgate::CRISIS_RESPONSE.to_owned());
        }
        if red_flag.severity == Severity::High {
            tracing::warn!(owner = %owner_token, flags = ?red_flag.flags, "high-severity red flag; continuing");
        }

        let (reminder_triggered, message_body) = match user_message.strip_prefix("[scheduled: reminder] ") {
            Some(rest) => (true, rest.to_owned()),
            None => (false, user_message.to_owned()),
        };

        if let Some(dispatch) = self.try_weather_shortcut(&tenant, &message_body).await {
            return dispatch;
        }

        self.extract_facts(request_id, &owner_token, &tenant, &message_body).await;

        let selection = match self.select_skill(request_id, &owner_token, &tenant, &message_body, reminder_triggered).await {
            Some(selection) => selection,
            None => return self.finish(&tenant, &message_body, excuses::random()).await,
        };

        if let Some(instruction) = &selection.personality_instruction {
            let _ = memory::append_personality(&self.pool, tenant.user.id, tenant.family.id, instruction).await;
        }

        let effective_skill = if reminder_triggered
            && matches!(selection.skill.as_str(), "todo" | "friend_mode" | "reminder")
        {
            SyntheticSkill::CreateAResponse.id().to_owned()
        } else {
            selection.skill.clone()
        };

        let stage = self
            .run_skill_stage(request_id, &owner_token, &tenant, &selection, &effective_skill)
            .await;

        let (skill_output, hints, extra_context) = match stage {
            SkillStageResult::Continue { output, hints, extra_context } => (output, hints, extra_context),
            SkillStageResult::Terminate(text) => return self.finish(&tenant, &message_body, &text).await,
            SkillStageResult::Dispatch(envelope) => return RouterOutput::Dispatch(envelope),
        };

        let reply = self
            .compose_reply(request_id, &owner_token, &tenant, &message_body, &skill_output, &hints, &extra_context)
            .await;

        self.finish(&tenant, &message_body, &reply).await
    }

    async fn resolve_tenant(&self, owner: &RouterOwner) -> Result<Tenant, crate::db::PersistenceError> {
        match owner {
            RouterOwner::Telegram { id, display_name } => {
                tenant::resolve_telegram(&self.pool, *id, display_name).await
            }
            RouterOwner::Phone { raw, display_name } => {
                tenant::resolve_phone(&self.pool, raw, display_name).await
            }
        }
    }

    /// Short-circuit: `"send <contact> the weather/forecast ..."` bypasses
    /// the LLM entirely and invokes the `weather` skill directly.
    async fn try_weather_shortcut(&self, tenant: &Tenant, message_body: &str) -> Option<RouterOutput> {
        let lower = message_body.to_lowercase();
        let rest = lower.strip_prefix("send ")?;
        let words: Vec<&str> = rest.split_whitespace().collect();
        if words.is_empty() {
            return None;
        }

        let max_name_words = words.len().saturating_sub(1).min(2).max(1);
        for name_words in (1..=max_name_words).rev() {
            if words.len() <= name_words {
                continue;
            }
            let name = words[..name_words].join(" ");
            let tail = words[name_words..].join(" ");
            if !(tail.contains("weather") || tail.contains("forecast")) {
                continue;
            }

            let Ok(Some(phone)) = contacts::resolve_contact_to_number(&self.pool, tenant.family.id, &name).await
            else {
                continue;
            };

            let registry = Registry::load(&self.pool).await.ok()?;
            let weather_skill = registry.get("weather")?;

            let day = extract_day_token(&tail);
            let request = SkillRequest {
                request_id: format!("weather-shortcut-{}", tenant.user.id),
                from: tenant.user.phone.clone().unwrap_or_else(|| tenant.user.id.to_string()),
                params: serde_json::json!({ "day": day }),
            };

            let outcome = self.executor.execute(&weather_skill.entrypoint, &request).await.ok()?;

            let recipient = user::get_user_by_phone(&self.pool, &phone).await.ok().flatten();
            let send_to_telegram_id = recipient.as_ref().and_then(|u| u.telegram_id).map(|id| id.to_string());
            let first_name = recipient
                .as_ref()
                .map(|u| u.display_name.clone())
                .unwrap_or_else(|| name.clone())
                .split_whitespace()
                .next()
                .unwrap_or(&name)
                .to_owned();

            return Some(RouterOutput::Dispatch(DispatchEnvelope {
                send_to: phone,
                send_body: outcome.response,
                reply_to_sender: format!("Okay, sent the weather to {first_name}."),
                send_to_telegram_id,
                send_to_group: None,
            }));
        }

        None
    }

    /// Stage 1: fact extraction. Best-effort; failures are swallowed.
    async fn extract_facts(&self, request_id: &str, owner_token: &str, tenant: &Tenant, message_body: &str) {
        let response = self
            .gateway
            .call(LlmCall {
                request_id,
                owner: owner_token,
                user_id: Some(tenant.user.id),
                family_id: Some(tenant.family.id),
                step: "fact_finding",
                system_text: "Extract stable attributes about the sender as a JSON array of {key, value, scope?, tags?}. Do not include transient request content.",
                user_text: message_body,
                temperature: 0.0,
                task_type: TaskType::Simple,
            })
            .await;

        let Ok(raw) = response else { return };
        let Ok(entries) = serde_json::from_str::<Vec<serde_json::Value>>(&raw) else {
            return;
        };

        for entry in entries {
            let Some(key) = entry.get("key").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(value) = entry.get("value").and_then(|v| v.as_str()) else {
                continue;
            };

            if RESERVED_FACT_KEYS.contains(&key) {
                continue;
            }
            if key == "personality_instruction" {
                let _ = memory::append_personality(&self.pool, tenant.user.id, tenant.family.id, value).await;
                continue;
            }

            let scope = match entry.get("scope").and_then(|v| v.as_str()) {
                Some("global") | Some("family") => crate::db::fact::FactScope::Family,
                _ => crate::db::fact::FactScope::Personal,
            };
            let tags: Vec<String> = entry
                .get("tags")
                .and_then(|v| v.as_array())
                .map(|tags| tags.iter().filter_map(|t| t.as_str().map(str::to_owned)).collect())
                .unwrap_or_default();

            let _ = memory::remember(&self.pool, tenant.user.id, tenant.family.id, key, value, scope, &tags).await;
        }
    }

    /// Stage 2: skill selection. Returns `None` on parse failure.
    async fn select_skill(
        &self,
        request_id: &str,
        owner_token: &str,
        tenant: &Tenant,
        message_body: &str,
        reminder_triggered: bool,
    ) -> Option<SkillSelection> {
        let registry = Registry::load(&self.pool).await.ok()?;
        let mut catalog: Vec<&str> = registry.skills().iter().map(|s| s.name.as_str()).collect();
        if reminder_triggered {
            catalog.retain(|name| *name != "todo");
        }

        let system_text = format!(
            "Choose exactly one skill to handle this message. Available skills: {}. \
             Respond with a single JSON object {{skill, ...params, personality_instruction?}}.",
            catalog.join(", ")
        );

        let response = self
            .gateway
            .call(LlmCall {
                request_id,
                owner: owner_token,
                user_id: Some(tenant.user.id),
                family_id: Some(tenant.family.id),
                step: "what_to_do",
                system_text: &system_text,
                user_text: message_body,
                temperature: 0.2,
                task_type: TaskType::Standard,
            })
            .await
            .ok()?;

        let value: serde_json::Value = serde_json::from_str(&response).ok()?;
        let skill = value.get("skill")?.as_str()?.to_owned();
        let personality_instruction = value
            .get("personality_instruction")
            .and_then(|v| v.as_str())
            .map(str::to_owned);

        Some(SkillSelection { skill, value, personality_instruction })
    }

    async fn run_skill_stage(
        &self,
        request_id: &str,
        owner_token: &str,
        tenant: &Tenant,
        selection: &SkillSelection,
        effective_skill: &str,
    ) -> SkillStageResult {
        if effective_skill == SyntheticSkill::CreateAResponse.id() {
            return SkillStageResult::Continue {
                output: String::new(),
                hints: serde_json::Value::Null,
                extra_context: String::new(),
            };
        }

        if effective_skill == SyntheticSkill::FriendMode.id() {
            let person = selection
                .value
                .get("person")
                .and_then(|v| v.as_str())
                .unwrap_or(tenant.user.display_name.as_str());
            let extra_context = format!(
                "You're in friend mode: a warm, supportive, no-agenda conversation with {person}."
            );
            return SkillStageResult::Continue {
                output: String::new(),
                hints: serde_json::Value::Null,
                extra_context,
            };
        }

        if effective_skill == SyntheticSkill::SendToContact.id() {
            return self.run_send_to_contact(request_id, owner_token, tenant, selection).await;
        }

        let registry = match Registry::load(&self.pool).await {
            Ok(r) => r,
            Err(_) => return SkillStageResult::Terminate(excuses::random().to_owned()),
        };

        let allowed = registry
            .is_allowed(&self.pool, owner_token, effective_skill)
            .await
            .unwrap_or(false);
        if !allowed {
            return SkillStageResult::Terminate(
                "I don't have that capability for this chat—sorry!".to_owned(),
            );
        }

        let Some(skill) = registry.get(effective_skill) else {
            return SkillStageResult::Terminate(excuses::random().to_owned());
        };

        let request = SkillRequest {
            request_id: request_id.to_owned(),
            from: owner_token.to_owned(),
            params: selection.value.clone(),
        };

        match self.executor.execute(&skill.entrypoint, &request).await {
            Ok(outcome) => SkillStageResult::Continue {
                output: outcome.response,
                hints: outcome.hints,
                extra_context: String::new(),
            },
            Err(err) => {
                tracing::warn!(error = %err, skill = effective_skill, "skill execution failed");
                SkillStageResult::Terminate(excuses::random().to_owned())
            }
        }
    }

    async fn run_send_to_contact(
        &self,
        request_id: &str,
        owner_token: &str,
        tenant: &Tenant,
        selection: &SkillSelection,
    ) -> SkillStageResult {
        let Some(to) = selection.value.get("to").and_then(|v| v.as_str()) else {
            return SkillStageResult::Terminate(excuses::random().to_owned());
        };
        let Some(ai_prompt) = selection.value.get("ai_prompt").and_then(|v| v.as_str()) else {
            return SkillStageResult::Terminate(excuses::random().to_owned());
        };

        let resolved = contacts::resolve_contact_to_number(&self.pool, tenant.family.id, to).await.ok().flatten();
        let phone = match resolved {
            Some(phone) => phone,
            None => {
                let known = contacts::member_known(&self.pool, tenant.family.id, to).await.unwrap_or(false);
                let message = if known {
                    format!("I have {to} in contacts but no valid phone number.")
                } else {
                    format!("I don't know who {to} is.")
                };
                return SkillStageResult::Terminate(message);
            }
        };

        let recipient = user::get_user_by_phone(&self.pool, &phone).await.ok().flatten();

        let recipient_message = self
            .gateway
            .call(LlmCall {
                request_id,
                owner: owner_token,
                user_id: Some(tenant.user.id),
                family_id: Some(tenant.family.id),
                step: "send_to_contact_recipient",
                system_text: "Compose the message to deliver to the recipient.",
                user_text: ai_prompt,
                temperature: 0.5,
                task_type: TaskType::Standard,
            })
            .await
            .unwrap_or_else(|_| ai_prompt.to_owned());

        let sender_ack = self
            .gateway
            .call(LlmCall {
                request_id,
                owner: owner_token,
                user_id: Some(tenant.user.id),
                family_id: Some(tenant.family.id),
                step: "send_to_contact_sender",
                system_text: "Acknowledge to the sender that their message was sent.",
                user_text: ai_prompt,
                temperature: 0.5,
                task_type: TaskType::Standard,
            })
            .await
            .unwrap_or_else(|_| format!("Okay, sent to {to}."));

        let send_to_telegram_id = recipient.and_then(|u| u.telegram_id).map(|id| id.to_string());

        SkillStageResult::Dispatch(DispatchEnvelope {
            send_to: phone,
            send_body: recipient_message,
            reply_to_sender: sender_ack,
            send_to_telegram_id,
            send_to_group: None,
        })
    }

    /// Stage 4: response composition.
    #[allow(clippy::too_many_arguments)]
    async fn compose_reply(
        &self,
        request_id: &str,
        owner_token: &str,
        tenant: &Tenant,
        message_body: &str,
        skill_output: &str,
        hints: &serde_json::Value,
        extra_context: &str,
    ) -> String {
        let personality = memory::personality_text(&self.pool, tenant.user.id, tenant.family.id)
            .await
            .unwrap_or_default();
        let summary = memory::summary_text(&self.pool, tenant.user.id, tenant.family.id)
            .await
            .unwrap_or_default();
        let facts = memory::search_facts(&self.pool, tenant.user.id, tenant.family.id, message_body, memory::DEFAULT_FACT_LIMIT)
            .await
            .unwrap_or_default();
        let history = memory::recent_conversation(&self.pool, tenant.user.id, tenant.family.id, COMPOSE_HISTORY_TURNS)
            .await
            .unwrap_or_default();

        let facts_text = facts
            .iter()
            .map(|f| format!("{}={}", f.key, f.value))
            .collect::<Vec<_>>()
            .join("; ");
        let history_text = history
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let system_text = format!(
            "Personality: {personality}\nSummary: {summary}\nFacts: {facts_text}\nSkill output: {skill_output}\nHints: {hints}\nExtra context: {extra_context}\nRecent conversation:\n{history_text}"
        );

        self.gateway
            .call(LlmCall {
                request_id,
                owner: owner_token,
                user_id: Some(tenant.user.id),
                family_id: Some(tenant.family.id),
                step: "create_response",
                system_text: &system_text,
                user_text: message_body,
                temperature: 0.7,
                task_type: TaskType::Standard,
            })
            .await
            .unwrap_or_else(|_| excuses::random().to_owned())
    }

    /// Post-composition side effects, stage 5, and post-output moderation.
    async fn finish(&self, tenant: &Tenant, message_body: &str, reply: &str) -> RouterOutput {
        let truncated = truncate_reply(reply);
        let sanitized = sanitize_bo_prefix(&truncated);

        let _ = memory::append_exchange(
            &self.pool,
            tenant.user.id,
            tenant.family.id,
            message_body,
            &sanitized,
            self.conversation_cap,
        )
        .await;

        self.update_summary(tenant, message_body, &sanitized).await;

        let filtered = modgate::filter_output(&sanitized, excuses::random(), self.classifier.as_ref());
        if filtered.action == ModerationAction::Replaced {
            let _ = crate::db::moderation::record_flag(
                &self.pool,
                tenant.user.id,
                tenant.family.id,
                message_body,
                Some(&sanitized),
                Some(&filtered.response),
                &[],
                ModerationAction::Replaced,
            )
            .await;
        }

        RouterOutput::Reply(filtered.response)
    }

    /// Stage 5: summary update. Best-effort; failures are silently ignored.
    async fn update_summary(&self, tenant: &Tenant, message_body: &str, reply: &str) {
        let summary = memory::summary_text(&self.pool, tenant.user.id, tenant.family.id)
            .await
            .unwrap_or_default();
        let system_text = format!("Current summary: {summary}\nLatest exchange: {message_body} -> {reply}");

        if let Ok(updated) = self
            .gateway
            .call(LlmCall {
                request_id: "summary-update",
                owner: &tenant.user.id.to_string(),
                user_id: Some(tenant.user.id),
                family_id: Some(tenant.family.id),
                step: "summary",
                system_text: &system_text,
                user_text: "Summarize what's new in one sentence.",
                temperature: 0.0,
                task_type: TaskType::Simple,
            })
            .await
        {
            let _ = memory::append_summary(&self.pool, tenant.user.id, tenant.family.id, updated.trim()).await;
        }
    }
}

/// Result of stage 3 (skill execution).
enum SkillStageResult {
    /// Proceed to stage 4 with this skill output, hints, and extra context.
    Continue {
        output: String,
        hints: serde_json::Value,
        extra_context: String,
    },
    /// Terminate the pipeline with this reply text (still post-processed).
    Terminate(String),
    /// Terminate with a dispatch to another recipient.
    Dispatch(DispatchEnvelope),
}

/// The LLM's parsed skill-selection response.
struct SkillSelection {
    skill: String,
    value: serde_json::Value,
    personality_instruction: Option<String>,
}

/// Truncate a reply to [`MAX_REPLY_CHARS`], appending `...` if truncated.
fn truncate_reply(reply: &str) -> String {
    if reply.chars().count() <= MAX_REPLY_CHARS {
        return reply.to_owned();
    }
    let truncated: String = reply.chars().take(MAX_REPLY_CHARS - 3).collect();
    format!("{truncated}...")
}

/// Prefix a reply with `"→ "` if it starts with the literal token "Bo"
/// (case-insensitively), so the self-chat observer doesn't re-trigger on
/// our own output.
fn sanitize_bo_prefix(reply: &str) -> String {
    let starts_with_bo = reply
        .split_whitespace()
        .next()
        .map(|first| first.eq_ignore_ascii_case("bo") || first.to_lowercase().starts_with("bo"))
        .unwrap_or(false);
    if starts_with_bo {
        format!("→ {reply}")
    } else {
        reply.to_owned()
    }
}

/// Extract a day token (`today`, `tomorrow`, or a weekday name) from free
/// text, defaulting to `today`.
fn extract_day_token(text: &str) -> String {
    const WEEKDAYS: &[&str] = &["monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday"];
    if text.contains("tomorrow") {
        return "tomorrow".to_owned();
    }
    for day in WEEKDAYS {
        if text.contains(day) {
            return (*day).to_owned();
        }
    }
    "today".to_owned()
}

/// Compiled once; validates a `"<frequency> <HH:MM>"` recurrence string
/// at reminder-creation time, shared with the scheduler.
pub fn recurrence_pattern() -> Regex {
    Regex::new(r"^(?i)(daily|weekdays|weekly:(mon|tue|wed|thu|fri|sat|sun))\s+([01]\d|2[0-3]):([0-5]\d)$")
        .expect("recurrence pattern is a valid regex")
}

/// Whether `kind` and `recurrence` describe a well-formed reminder.
pub fn validate_recurrence(kind: ReminderKind, recurrence: Option<&str>) -> bool {
    match kind {
        ReminderKind::OneOff => true,
        ReminderKind::Recurring => recurrence.is_some_and(|r| recurrence_pattern().is_match(r)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_exactly_at_limit_is_unmodified() {
        let reply = "a".repeat(MAX_REPLY_CHARS);
        assert_eq!(truncate_reply(&reply).chars().count(), MAX_REPLY_CHARS);
        assert_eq!(truncate_reply(&reply), reply);
    }

    #[test]
    fn reply_over_limit_is_truncated_with_ellipsis() {
        let reply = "a".repeat(MAX_REPLY_CHARS + 1);
        let truncated = truncate_reply(&reply);
        assert_eq!(truncated.chars().count(), MAX_REPLY_CHARS);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn bo_prefixed_reply_is_sanitized() {
        assert_eq!(sanitize_bo_prefix("Bo is here"), "→ Bo is here");
        assert_eq!(sanitize_bo_prefix("bo says hi"), "→ bo says hi");
    }

    #[test]
    fn non_bo_reply_is_unmodified() {
        assert_eq!(sanitize_bo_prefix("Hey there"), "Hey there");
    }

    #[test]
    fn empty_bo_prefix_is_not_routed_elsewhere() {
        // Exercises the boundary directly relevant to self-chat ingress:
        // "Bo " with nothing after it should never be treated as a command.
        let stripped = "Bo ".strip_prefix("Bo ").unwrap();
        assert!(stripped.is_empty());
    }

    #[test]
    fn valid_recurrence_strings_are_accepted() {
        assert!(validate_recurrence(ReminderKind::Recurring, Some("daily 08:30")));
        assert!(validate_recurrence(ReminderKind::Recurring, Some("weekdays 17:00")));
        assert!(validate_recurrence(ReminderKind::Recurring, Some("weekly:mon 09:00")));
    }

    #[test]
    fn malformed_recurrence_strings_are_rejected() {
        assert!(!validate_recurrence(ReminderKind::Recurring, Some("whenever 08:30")));
        assert!(!validate_recurrence(ReminderKind::Recurring, Some("daily 25:00")));
        assert!(!validate_recurrence(ReminderKind::Recurring, None));
    }

    #[test]
    fn day_token_extraction_prefers_explicit_mentions() {
        assert_eq!(extract_day_token("the forecast for tomorrow"), "tomorrow");
        assert_eq!(extract_day_token("weather on friday"), "friday");
        assert_eq!(extract_day_token("just the weather"), "today");
    }

    async fn mock_router(mock_path: &std::path::Path) -> Router {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let gateway = Gateway::new(
            pool.clone(),
            crate::config::ModelsConfig::default(),
            None,
            Some(mock_path.to_owned()),
            None,
        );
        let executor: Arc<dyn SkillExecutor> = Arc::new(crate::skills::executor::SubprocessExecutor::new());
        Router::new(pool, gateway, executor, 20)
    }

    #[tokio::test]
    async fn basic_chat_scenario_produces_a_reply() {
        let mock_path = std::env::temp_dir().join(format!("bo-router-basic-{}", std::process::id()));
        tokio::fs::write(
            &mock_path,
            r#"{"fact_finding": "[]", "what_to_do": "{\"skill\":\"create_a_response\"}", "create_response": "Hey!", "summary": "said hi"}"#,
        )
        .await
        .unwrap();

        let router = mock_router(&mock_path).await;
        let owner = RouterOwner::Telegram { id: 123, display_name: "Ada".to_owned() };
        let output = router.route("req-1", &owner, "hi").await;

        assert_eq!(output, RouterOutput::Reply("Hey!".to_owned()));
        tokio::fs::remove_file(&mock_path).await.ok();
    }

    #[tokio::test]
    async fn scheduled_reminder_override_suppresses_todo_creation() {
        let mock_path = std::env::temp_dir().join(format!("bo-router-reminder-{}", std::process::id()));
        tokio::fs::write(
            &mock_path,
            r#"{"fact_finding": "[]", "what_to_do": "{\"skill\":\"todo\",\"action\":\"add\",\"text\":\"trash\"}", "create_response": "Don't forget to take out the trash!", "summary": "reminded about trash"}"#,
        )
        .await
        .unwrap();

        let router = mock_router(&mock_path).await;
        let owner = RouterOwner::Telegram { id: 7, display_name: "Jon".to_owned() };
        let output = router
            .route("req-2", &owner, "[scheduled: reminder] take out the trash")
            .await;

        assert_eq!(
            output,
            RouterOutput::Reply("Don't forget to take out the trash!".to_owned())
        );
        tokio::fs::remove_file(&mock_path).await.ok();
    }

    #[tokio::test]
    async fn critical_red_flag_short_circuits_with_crisis_response() {
        let mock_path = std::env::temp_dir().join(format!("bo-router-crisis-{}", std::process::id()));
        tokio::fs::write(&mock_path, r#"{}"#).await.unwrap();

        let router = mock_router(&mock_path).await;
        let owner = RouterOwner::Telegram { id: 77, display_name: "Sam".to_owned() };
        let output = router.route("req-3", &owner, "i want to kill myself").await;

        match output {
            RouterOutput::Reply(text) => assert!(text.contains("988")),
            other => panic!("expected crisis reply, got {other:?}"),
        }

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM moderation_flags WHERE action = 'flagged'")
                .fetch_one(&router.pool)
                .await
                .unwrap();
        assert_eq!(count, 1, "critical red flag must persist action = flagged");

        tokio::fs::remove_file(&mock_path).await.ok();
    }

    #[tokio::test]
    async fn skill_not_allowed_replies_verbatim() {
        let mock_path = std::env::temp_dir().join(format!("bo-router-acl-{}", std::process::id()));
        tokio::fs::write(
            &mock_path,
            r#"{"fact_finding": "[]", "what_to_do": "{\"skill\":\"google\",\"query\":\"rust\"}", "summary": "asked to search"}"#,
        )
        .await
        .unwrap();

        let router = mock_router(&mock_path).await;

        let skill = crate::db::skill::Skill {
            id: "google".to_owned(),
            name: "Google Search".to_owned(),
            description: "web search".to_owned(),
            entrypoint: "skills/google.sh".to_owned(),
            input_schema: serde_json::json!({"type": "object"}),
        };
        crate::db::skill::register_skill(&router.pool, &skill).await.unwrap();
        crate::db::skill::grant_access(&router.pool, "someone-else", "google").await.unwrap();

        let owner = RouterOwner::Telegram { id: 5, display_name: "Nora".to_owned() };
        let output = router.route("req-4", &owner, "search the web for rust").await;

        assert_eq!(
            output,
            RouterOutput::Reply("I don't have that capability for this chat—sorry!".to_owned())
        );
        tokio::fs::remove_file(&mock_path).await.ok();
    }
}
