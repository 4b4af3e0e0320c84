//! Moderation flag log: a write-only audit trail of red-flagged inputs and
//! filtered outputs. Nothing in the hot path reads this table back — it
//! exists for later human review, not for runtime decisions.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::PersistenceError;

/// What the moderation layer did in response to a flagged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ModerationAction {
    /// The message was allowed through unchanged.
    Allowed,
    /// The response was replaced with a safe fallback.
    Replaced,
    /// The message was blocked outright.
    Blocked,
    /// The message was flagged (e.g. a critical red-flag match) and the
    /// pipeline short-circuited with a fixed response, without otherwise
    /// blocking the sender.
    Flagged,
}

impl ModerationAction {
    /// Render as the string stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Replaced => "replaced",
            Self::Blocked => "blocked",
            Self::Flagged => "flagged",
        }
    }

    /// Parse the stored string back into an action.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidEnum`] for anything other than
    /// `"allowed"`, `"replaced"`, `"blocked"`, or `"flagged"`.
    pub fn parse(value: &str) -> Result<Self, PersistenceError> {
        match value {
            "allowed" => Ok(Self::Allowed),
            "replaced" => Ok(Self::Replaced),
            "blocked" => Ok(Self::Blocked),
            "flagged" => Ok(Self::Flagged),
            other => Err(PersistenceError::InvalidEnum {
                field: "moderation_flags.action",
                value: other.to_owned(),
            }),
        }
    }
}

/// A logged moderation decision.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModerationFlag {
    /// Primary key.
    pub id: i64,
    /// Sender.
    pub user_id: i64,
    /// Owning family.
    pub family_id: i64,
    /// The triggering message.
    pub message: String,
    /// The response that was produced before moderation acted, if any.
    pub original_response: Option<String>,
    /// The response actually delivered, if it was replaced.
    pub replacement_response: Option<String>,
    /// Matched flag labels, e.g. `["self_harm"]`.
    pub flags: Vec<String>,
    /// What action moderation took.
    pub action: ModerationAction,
    /// Whether a human has reviewed this entry.
    pub reviewed: bool,
    /// When the flag was recorded.
    pub created_at: DateTime<Utc>,
}

/// Record a moderation decision. This is insert-only: there is no update
/// or delete path, by design — the log is the record.
pub async fn record_flag(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
    message: &str,
    original_response: Option<&str>,
    replacement_response: Option<&str>,
    flags: &[String],
    action: ModerationAction,
) -> Result<i64, PersistenceError> {
    let flags_json = serde_json::to_string(flags).unwrap_or_else(|_| "[]".to_owned());
    let id = sqlx::query(
        "INSERT INTO moderation_flags
            (user_id, family_id, message, original_response, replacement_response, flags, action)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(family_id)
    .bind(message)
    .bind(original_response)
    .bind(replacement_response)
    .bind(flags_json)
    .bind(action.as_str())
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Count unreviewed flags, for an admin-facing health check.
pub async fn count_unreviewed(pool: &SqlitePool) -> Result<i64, PersistenceError> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM moderation_flags WHERE reviewed = 0")
            .fetch_one(pool)
            .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorded_flag_counts_as_unreviewed() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let user = crate::db::user::create_user(&pool, "Ada", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(&pool, "Lovelaces", user.id)
            .await
            .unwrap();

        record_flag(
            &pool,
            user.id,
            family.id,
            "concerning message",
            Some("original"),
            Some("replacement"),
            &["self_harm".to_owned()],
            ModerationAction::Replaced,
        )
        .await
        .unwrap();

        assert_eq!(count_unreviewed(&pool).await.unwrap(), 1);
    }
}
