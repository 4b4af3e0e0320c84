//! Conversation log: the rolling window of recent turns kept per
//! `(user, family)` tenant, used as short-term context for the router.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::PersistenceError;

/// Who authored a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    /// The human principal.
    User,
    /// The assistant.
    Assistant,
    /// A system-injected note (e.g. a delivered reminder).
    System,
}

impl Role {
    /// Render as the string stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    /// Parse the stored string back into a role.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidEnum`] for anything other than
    /// `"user"`, `"assistant"`, or `"system"`.
    pub fn parse(value: &str) -> Result<Self, PersistenceError> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(PersistenceError::InvalidEnum {
                field: "conversation_messages.role",
                value: other.to_owned(),
            }),
        }
    }
}

/// A single logged turn.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConversationMessage {
    /// Primary key.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Owning family.
    pub family_id: i64,
    /// Monotonic sequence number within the tenant.
    pub seq: i64,
    /// Turn author.
    pub role: Role,
    /// Turn text.
    pub content: String,
    /// When the turn was logged.
    pub created_at: DateTime<Utc>,
}

type MessageRow = (i64, i64, i64, i64, String, String, DateTime<Utc>);

fn message_from_row(row: MessageRow) -> Result<ConversationMessage, PersistenceError> {
    let (id, user_id, family_id, seq, role, content, created_at) = row;
    Ok(ConversationMessage {
        id,
        user_id,
        family_id,
        seq,
        role: Role::parse(&role)?,
        content,
        created_at,
    })
}

/// Append a turn to a tenant's conversation log, then trim the log back to
/// `cap` entries if appending pushed it over. Both steps run in one
/// transaction so a crash between them can never leave the log over
/// `cap` nor lose the just-appended turn.
///
/// # Errors
///
/// Returns [`PersistenceError::Database`] on any driver failure; the
/// transaction is rolled back automatically if it isn't committed.
pub async fn append_and_trim(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
    role: Role,
    content: &str,
    cap: u32,
) -> Result<ConversationMessage, PersistenceError> {
    let mut tx = pool.begin().await?;

    let (next_seq,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM conversation_messages
         WHERE user_id = ? AND family_id = ?",
    )
    .bind(user_id)
    .bind(family_id)
    .fetch_one(&mut *tx)
    .await?;

    let id = sqlx::query(
        "INSERT INTO conversation_messages (user_id, family_id, seq, role, content)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(family_id)
    .bind(next_seq)
    .bind(role.as_str())
    .bind(content)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    sqlx::query(
        "DELETE FROM conversation_messages WHERE user_id = ? AND family_id = ? AND seq <= (
            SELECT MAX(seq) - ? FROM conversation_messages WHERE user_id = ? AND family_id = ?
         )",
    )
    .bind(user_id)
    .bind(family_id)
    .bind(i64::from(cap))
    .bind(user_id)
    .bind(family_id)
    .execute(&mut *tx)
    .await?;

    let row: MessageRow = sqlx::query_as(
        "SELECT id, user_id, family_id, seq, role, content, created_at
         FROM conversation_messages WHERE id = ?",
    )
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    message_from_row(row)
}

/// Fetch the most recent `cap` turns for a tenant, oldest first.
pub async fn recent(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
    cap: u32,
) -> Result<Vec<ConversationMessage>, PersistenceError> {
    let rows: Vec<MessageRow> = sqlx::query_as(
        "SELECT id, user_id, family_id, seq, role, content, created_at
         FROM conversation_messages WHERE user_id = ? AND family_id = ?
         ORDER BY seq DESC LIMIT ?",
    )
    .bind(user_id)
    .bind(family_id)
    .bind(i64::from(cap))
    .fetch_all(pool)
    .await?;

    let mut messages: Vec<ConversationMessage> = rows
        .into_iter()
        .map(message_from_row)
        .collect::<Result<_, _>>()?;
    messages.reverse();
    Ok(messages)
}
