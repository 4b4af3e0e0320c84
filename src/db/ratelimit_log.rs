//! Durable record of rate-limit windows and escalating cooldowns, so a
//! family's cooldown level survives a process restart and decays after
//! 24 hours of quiet rather than resetting to zero immediately.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::PersistenceError;

/// One logged rate-limit window evaluation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RateLimitEvent {
    /// Primary key.
    pub id: i64,
    /// Owning family.
    pub family_id: i64,
    /// The sender who triggered this evaluation, if known.
    pub user_id: Option<i64>,
    /// Messages counted in the evaluated window.
    pub message_count: i64,
    /// Window start.
    pub window_start: DateTime<Utc>,
    /// Window end.
    pub window_end: DateTime<Utc>,
    /// Cooldown expiry, if this evaluation triggered one.
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Escalation level at the time of this evaluation (0 = no cooldown).
    pub cooldown_level: i64,
    /// When this event was logged.
    pub created_at: DateTime<Utc>,
}

/// Log a rate-limit window evaluation.
pub async fn record_event(
    pool: &SqlitePool,
    family_id: i64,
    user_id: Option<i64>,
    message_count: i64,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    cooldown_until: Option<DateTime<Utc>>,
    cooldown_level: i64,
) -> Result<(), PersistenceError> {
    sqlx::query(
        "INSERT INTO rate_limit_log
            (family_id, user_id, message_count, window_start, window_end, cooldown_until, cooldown_level, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(family_id)
    .bind(user_id)
    .bind(message_count)
    .bind(window_start)
    .bind(window_end)
    .bind(cooldown_until)
    .bind(cooldown_level)
    .bind(window_end)
    .execute(pool)
    .await?;
    Ok(())
}

/// The most recent cooldown level recorded for a family within the last
/// 24 hours, or `None` if the family has no recent event — which is how a
/// long-quiet family's escalation decays back to a clean baseline rather
/// than resuming mid-escalation.
pub async fn current_level(
    pool: &SqlitePool,
    family_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<i64>, PersistenceError> {
    let cutoff = now - chrono::Duration::hours(24);
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT cooldown_level FROM rate_limit_log
         WHERE family_id = ? AND created_at >= ?
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(family_id)
    .bind(cutoff)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(level,)| level))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn level_decays_after_24_hours_of_quiet() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let user = crate::db::user::create_user(&pool, "Ada", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(&pool, "Lovelaces", user.id)
            .await
            .unwrap();

        let stale = Utc::now() - Duration::hours(25);
        record_event(&pool, family.id, Some(user.id), 50, stale, stale, None, 3)
            .await
            .unwrap();

        assert_eq!(current_level(&pool, family.id, Utc::now()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn recent_level_is_returned() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let user = crate::db::user::create_user(&pool, "Ada", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(&pool, "Lovelaces", user.id)
            .await
            .unwrap();

        let now = Utc::now();
        record_event(&pool, family.id, Some(user.id), 50, now, now, None, 2)
            .await
            .unwrap();

        assert_eq!(current_level(&pool, family.id, now).await.unwrap(), Some(2));
    }
}
