//! Persistence layer: connection pooling, migrations, and typed operations
//! for every entity in the data model.
//!
//! Reads go directly through the shared [`sqlx::SqlitePool`]. Multi-statement
//! writes that must be atomic (notably conversation append+trim) run inside
//! an explicit `sqlx` transaction rather than through a single-writer actor —
//! SQLite's WAL mode tolerates concurrent writers across these low-frequency
//! tables, and a transaction gives us the atomicity the append+trim operation
//! needs without serializing unrelated writes behind one task.

pub mod audit;
pub mod conversation;
pub mod fact;
pub mod family;
pub mod group_chat;
pub mod moderation;
pub mod ratelimit_log;
pub mod reminder;
pub mod skill;
pub mod summary;
pub mod todo;
pub mod user;

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Errors from persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Underlying database driver error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row referenced an enum value this binary doesn't recognize.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which column held the bad value.
        field: &'static str,
        /// The unexpected raw value.
        value: String,
    },

    /// A write would violate an invariant (e.g. removing the last owner).
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Default bound on concurrent pooled connections.
const DEFAULT_MAX_CONNECTIONS: u32 = 20;

/// Open the SQLite connection pool and apply embedded migrations.
///
/// # Errors
///
/// Returns [`PersistenceError::Database`] if the database cannot be opened
/// or migrations fail to apply.
pub async fn connect(database_url: &str) -> Result<SqlitePool, PersistenceError> {
    let options: SqliteConnectOptions = database_url
        .parse::<SqliteConnectOptions>()
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(DEFAULT_MAX_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .connect_with(options)
        .await?;

    apply_migrations(&pool).await?;

    Ok(pool)
}

/// Apply the embedded schema. Every statement is idempotent
/// (`CREATE TABLE IF NOT EXISTS`) so re-running at startup is safe.
async fn apply_migrations(pool: &SqlitePool) -> Result<(), PersistenceError> {
    sqlx::query(MIGRATIONS).execute(pool).await?;
    Ok(())
}

const MIGRATIONS: &str = r"
CREATE TABLE IF NOT EXISTS families (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);

CREATE TABLE IF NOT EXISTS users (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    display_name        TEXT NOT NULL,
    phone               TEXT,
    telegram_id         INTEGER,
    timezone            TEXT NOT NULL DEFAULT 'America/New_York',
    is_admin            INTEGER NOT NULL DEFAULT 0,
    is_agent_trigger    INTEGER NOT NULL DEFAULT 0,
    last_active_family  INTEGER REFERENCES families(id),
    created_at          TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_users_phone ON users(phone) WHERE phone IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_users_telegram ON users(telegram_id) WHERE telegram_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS memberships (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     INTEGER NOT NULL REFERENCES users(id),
    family_id   INTEGER NOT NULL REFERENCES families(id),
    role        TEXT NOT NULL,
    joined_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    UNIQUE(user_id, family_id)
);
CREATE INDEX IF NOT EXISTS idx_memberships_user ON memberships(user_id);
CREATE INDEX IF NOT EXISTS idx_memberships_family ON memberships(family_id);

CREATE TABLE IF NOT EXISTS facts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     INTEGER NOT NULL REFERENCES users(id),
    family_id   INTEGER NOT NULL REFERENCES families(id),
    key         TEXT NOT NULL,
    value       TEXT NOT NULL,
    scope       TEXT NOT NULL,
    tags        TEXT NOT NULL DEFAULT '[]',
    updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    UNIQUE(user_id, family_id, key, scope)
);

CREATE TABLE IF NOT EXISTS conversation_messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     INTEGER NOT NULL REFERENCES users(id),
    family_id   INTEGER NOT NULL REFERENCES families(id),
    seq         INTEGER NOT NULL,
    role        TEXT NOT NULL,
    content     TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);
CREATE INDEX IF NOT EXISTS idx_conv_tenant ON conversation_messages(user_id, family_id, seq);

CREATE TABLE IF NOT EXISTS summaries (
    user_id     INTEGER NOT NULL REFERENCES users(id),
    family_id   INTEGER NOT NULL REFERENCES families(id),
    sentences   TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (user_id, family_id)
);

CREATE TABLE IF NOT EXISTS personality_instructions (
    user_id       INTEGER NOT NULL REFERENCES users(id),
    family_id     INTEGER NOT NULL REFERENCES families(id),
    instructions  TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (user_id, family_id)
);

CREATE TABLE IF NOT EXISTS todos (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    assignee_id INTEGER NOT NULL REFERENCES users(id),
    family_id   INTEGER NOT NULL REFERENCES families(id),
    creator_id  INTEGER NOT NULL REFERENCES users(id),
    text        TEXT NOT NULL,
    due_at      TEXT,
    done        INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);
CREATE INDEX IF NOT EXISTS idx_todos_assignee ON todos(assignee_id, family_id);

CREATE TABLE IF NOT EXISTS reminders (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    creator_id        INTEGER NOT NULL REFERENCES users(id),
    recipient_id      INTEGER NOT NULL REFERENCES users(id),
    family_id         INTEGER NOT NULL REFERENCES families(id),
    text              TEXT NOT NULL,
    kind              TEXT NOT NULL,
    fire_at_utc       TEXT,
    recurrence        TEXT,
    next_fire_at_utc  TEXT,
    sent_at           TEXT,
    last_fired_at     TEXT,
    created_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);
CREATE INDEX IF NOT EXISTS idx_reminders_due ON reminders(kind, sent_at, fire_at_utc, next_fire_at_utc);

CREATE TABLE IF NOT EXISTS skills (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    description   TEXT NOT NULL,
    entrypoint    TEXT NOT NULL,
    input_schema  TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS skill_acl (
    principal   TEXT NOT NULL,
    skill_id    TEXT NOT NULL,
    PRIMARY KEY (principal, skill_id)
);

CREATE TABLE IF NOT EXISTS moderation_flags (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id               INTEGER NOT NULL REFERENCES users(id),
    family_id             INTEGER NOT NULL REFERENCES families(id),
    message               TEXT NOT NULL,
    original_response     TEXT,
    replacement_response  TEXT,
    flags                 TEXT NOT NULL DEFAULT '[]',
    action                TEXT NOT NULL,
    reviewed              INTEGER NOT NULL DEFAULT 0,
    created_at            TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);

CREATE TABLE IF NOT EXISTS rate_limit_log (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    family_id        INTEGER NOT NULL REFERENCES families(id),
    user_id          INTEGER REFERENCES users(id),
    message_count    INTEGER NOT NULL,
    window_start     TEXT NOT NULL,
    window_end       TEXT NOT NULL,
    cooldown_until   TEXT,
    cooldown_level   INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);

CREATE TABLE IF NOT EXISTS llm_log (
    request_id     TEXT NOT NULL,
    user_id        INTEGER REFERENCES users(id),
    family_id      INTEGER REFERENCES families(id),
    owner          TEXT NOT NULL,
    step           TEXT NOT NULL,
    request_doc    TEXT NOT NULL,
    response_text  TEXT NOT NULL,
    created_at     TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    PRIMARY KEY (request_id, step)
);

CREATE TABLE IF NOT EXISTS group_chats (
    chat_id     TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    type        TEXT NOT NULL,
    family_id   INTEGER NOT NULL REFERENCES families(id)
);
";
