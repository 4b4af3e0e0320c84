//! Rate Limiter: a per-family rolling window over inbound messages, with
//! an escalating cooldown that persists across restarts via the
//! rate-limit log and decays after 24 hours of quiet.
//!
//! The sliding window itself is in-process state, matching the
//! single-process deployment model; only the cooldown level needs to
//! survive a restart, which is why it's the one piece backed by the
//! persistence layer.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::db::ratelimit_log;
use crate::db::PersistenceError;

/// Rolling window width.
const WINDOW: Duration = Duration::from_secs(15 * 60);

/// Messages allowed per member per window.
const PER_MEMBER_ALLOWANCE: i64 = 60;

/// Escalating cooldown durations, in seconds, indexed by level - 1.
/// A violation at the highest level stays at the highest level.
const COOLDOWN_LEVELS_SECS: &[u64] = &[30, 60, 120, 240, 600, 1800, 3600];

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The message may proceed.
    Allowed,
    /// The family is in cooldown; the message must be rejected.
    InCooldown {
        /// When the cooldown lifts.
        cooldown_until: chrono::DateTime<Utc>,
        /// Current escalation level, 0-indexed into the cooldown table.
        level: i64,
    },
}

/// Per-family sliding window of recent message timestamps, plus the
/// escalation state needed to decide whether a fresh violation advances
/// the cooldown level.
struct FamilyWindow {
    timestamps: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

/// In-process rate limiter, keyed by family id.
pub struct RateLimiter {
    windows: Mutex<HashMap<i64, FamilyWindow>>,
}

impl RateLimiter {
    /// Build an empty limiter.
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check and record an inbound message against `family_id`'s window.
    ///
    /// On a limit violation, persists the evaluation (for 24h cooldown
    /// decay tracking) and advances the escalation level read back from
    /// the persistence layer, so a process restart doesn't reset a
    /// family mid-cooldown to level zero.
    pub async fn check(
        &self,
        pool: &SqlitePool,
        family_id: i64,
        user_id: Option<i64>,
        member_count: i64,
    ) -> Result<Decision, PersistenceError> {
        let now = Instant::now();
        let limit = member_count.max(1) * PER_MEMBER_ALLOWANCE;

        let mut windows = self.windows.lock().await;
        let window = windows.entry(family_id).or_insert_with(|| FamilyWindow {
            timestamps: VecDeque::new(),
            cooldown_until: None,
        });

        if let Some(until) = window.cooldown_until {
            if now < until {
                let persisted_level = ratelimit_log::current_level(pool, family_id, Utc::now())
                    .await?
                    .unwrap_or(0);
                let remaining = until.saturating_duration_since(now);
                let cooldown_until = Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_default();
                return Ok(Decision::InCooldown {
                    cooldown_until,
                    level: persisted_level,
                });
            }
            window.cooldown_until = None;
        }

        window.timestamps.push_back(now);
        while let Some(&front) = window.timestamps.front() {
            if now.duration_since(front) > WINDOW {
                window.timestamps.pop_front();
            } else {
                break;
            }
        }

        let count = window.timestamps.len() as i64;
        if count <= limit {
            return Ok(Decision::Allowed);
        }

        let previous_level = ratelimit_log::current_level(pool, family_id, Utc::now()).await?;
        let next_level = match previous_level {
            None => 0,
            Some(level) => (level + 1).min(COOLDOWN_LEVELS_SECS.len() as i64 - 1),
        };
        let cooldown_secs = COOLDOWN_LEVELS_SECS[next_level as usize];
        window.cooldown_until = Some(now + Duration::from_secs(cooldown_secs));

        let window_start = Utc::now() - chrono::Duration::from_std(WINDOW).unwrap_or_default();
        let window_end = Utc::now();
        let cooldown_until = window_end + chrono::Duration::seconds(cooldown_secs as i64);

        ratelimit_log::record_event(
            pool,
            family_id,
            user_id,
            count,
            window_start,
            window_end,
            Some(cooldown_until),
            next_level,
        )
        .await?;

        Ok(Decision::InCooldown {
            cooldown_until,
            level: next_level,
        })
    }

    /// Whether `family_id` is currently within an active cooldown, without
    /// recording a violation. Used by the scheduler to decide whether a
    /// due reminder should stay quiet rather than waking a resting family.
    pub async fn is_in_cooldown(&self, family_id: i64) -> bool {
        let windows = self.windows.lock().await;
        windows
            .get(&family_id)
            .and_then(|w| w.cooldown_until)
            .is_some_and(|until| Instant::now() < until)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_under_the_limit_are_allowed() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let user = crate::db::user::create_user(&pool, "Ada", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(&pool, "Lovelaces", user.id)
            .await
            .unwrap();
        let limiter = RateLimiter::new();

        for _ in 0..10 {
            let decision = limiter
                .check(&pool, family.id, Some(user.id), 1)
                .await
                .unwrap();
            assert_eq!(decision, Decision::Allowed);
        }
    }

    #[tokio::test]
    async fn exceeding_the_limit_triggers_cooldown() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let user = crate::db::user::create_user(&pool, "Ada", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(&pool, "Lovelaces", user.id)
            .await
            .unwrap();
        let limiter = RateLimiter::new();

        // member_count = 1 => limit = 60; send 61 messages.
        let mut last = Decision::Allowed;
        for _ in 0..61 {
            last = limiter.check(&pool, family.id, Some(user.id), 1).await.unwrap();
        }
        assert!(matches!(last, Decision::InCooldown { level: 0, .. }));
    }

    #[tokio::test]
    async fn while_in_cooldown_subsequent_messages_are_rejected() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let user = crate::db::user::create_user(&pool, "Ada", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(&pool, "Lovelaces", user.id)
            .await
            .unwrap();
        let limiter = RateLimiter::new();

        for _ in 0..61 {
            limiter.check(&pool, family.id, Some(user.id), 1).await.unwrap();
        }
        let next = limiter.check(&pool, family.id, Some(user.id), 1).await.unwrap();
        assert!(matches!(next, Decision::InCooldown { .. }));
    }

    #[tokio::test]
    async fn repeat_violation_escalates_the_persisted_level() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let user = crate::db::user::create_user(&pool, "Ada", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(&pool, "Lovelaces", user.id)
            .await
            .unwrap();

        // Simulate a prior violation already on record at level 0.
        let now = Utc::now();
        ratelimit_log::record_event(&pool, family.id, Some(user.id), 61, now, now, None, 0)
            .await
            .unwrap();

        let limiter = RateLimiter::new();
        let mut last = Decision::Allowed;
        for _ in 0..61 {
            last = limiter.check(&pool, family.id, Some(user.id), 1).await.unwrap();
        }
        assert!(matches!(last, Decision::InCooldown { level: 1, .. }));
    }
}
