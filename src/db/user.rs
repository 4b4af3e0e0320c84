//! Users: the people (or Telegram principals) the assistant talks to.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::PersistenceError;

/// A person known to the system, identified by phone, Telegram id, or both.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct User {
    /// Primary key.
    pub id: i64,
    /// Display name used in prompts and addressed replies.
    pub display_name: String,
    /// Canonical 10-digit phone owner token, if known.
    pub phone: Option<String>,
    /// Telegram user id, if the user has a linked Telegram account.
    pub telegram_id: Option<i64>,
    /// IANA timezone used for date-relative reasoning and reminder delivery.
    pub timezone: String,
    /// Whether this user has administrative privileges.
    pub is_admin: bool,
    /// Whether messages from this user can trigger the agent outside self-chat.
    pub is_agent_trigger: bool,
    /// The family this user last interacted in, used to default tenancy
    /// resolution when a message doesn't otherwise disambiguate it.
    pub last_active_family: Option<i64>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

type UserRow = (
    i64,
    String,
    Option<String>,
    Option<i64>,
    String,
    i64,
    i64,
    Option<i64>,
    DateTime<Utc>,
);

fn user_from_row(row: UserRow) -> User {
    let (
        id,
        display_name,
        phone,
        telegram_id,
        timezone,
        is_admin,
        is_agent_trigger,
        last_active_family,
        created_at,
    ) = row;
    User {
        id,
        display_name,
        phone,
        telegram_id,
        timezone,
        is_admin: is_admin != 0,
        is_agent_trigger: is_agent_trigger != 0,
        last_active_family,
        created_at,
    }
}

const SELECT_USER: &str = "SELECT id, display_name, phone, telegram_id, timezone, is_admin, \
     is_agent_trigger, last_active_family, created_at FROM users";

/// Create a user. Either `phone` or `telegram_id` (or both) should be given.
pub async fn create_user(
    pool: &SqlitePool,
    display_name: &str,
    phone: Option<&str>,
    telegram_id: Option<i64>,
) -> Result<User, PersistenceError> {
    let id = sqlx::query("INSERT INTO users (display_name, phone, telegram_id) VALUES (?, ?, ?)")
        .bind(display_name)
        .bind(phone)
        .bind(telegram_id)
        .execute(pool)
        .await?
        .last_insert_rowid();

    get_user(pool, id).await
}

/// Fetch a user by id.
pub async fn get_user(pool: &SqlitePool, user_id: i64) -> Result<User, PersistenceError> {
    let row: UserRow = sqlx::query_as(&format!("{SELECT_USER} WHERE id = ?"))
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| PersistenceError::NotFound(format!("user {user_id}")))?;
    Ok(user_from_row(row))
}

/// Look up a user by canonical phone owner token.
pub async fn get_user_by_phone(
    pool: &SqlitePool,
    phone: &str,
) -> Result<Option<User>, PersistenceError> {
    let row: Option<UserRow> = sqlx::query_as(&format!("{SELECT_USER} WHERE phone = ?"))
        .bind(phone)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(user_from_row))
}

/// Look up a user by Telegram id.
pub async fn get_user_by_telegram_id(
    pool: &SqlitePool,
    telegram_id: i64,
) -> Result<Option<User>, PersistenceError> {
    let row: Option<UserRow> = sqlx::query_as(&format!("{SELECT_USER} WHERE telegram_id = ?"))
        .bind(telegram_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(user_from_row))
}

/// Update the family a user last interacted in.
pub async fn set_last_active_family(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
) -> Result<(), PersistenceError> {
    sqlx::query("UPDATE users SET last_active_family = ? WHERE id = ?")
        .bind(family_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Update a user's timezone.
pub async fn set_timezone(
    pool: &SqlitePool,
    user_id: i64,
    timezone: &str,
) -> Result<(), PersistenceError> {
    sqlx::query("UPDATE users SET timezone = ? WHERE id = ?")
        .bind(timezone)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}
