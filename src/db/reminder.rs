//! Reminders: one-off and recurring nudges scheduled for future delivery.
//!
//! Due reminders are claimed with a single atomic `UPDATE ... RETURNING`
//! gated on `sent_at IS NULL` (one-off) or `next_fire_at_utc <= now`
//! (recurring), so two concurrent scheduler sweeps can never both decide
//! they're the one to deliver the same reminder.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::PersistenceError;

/// Whether a reminder fires once or on a recurring schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReminderKind {
    /// Fires once at `fire_at_utc`, then is considered delivered forever.
    OneOff,
    /// Fires repeatedly per its recurrence rule.
    Recurring,
}

impl ReminderKind {
    /// Render as the string stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneOff => "one_off",
            Self::Recurring => "recurring",
        }
    }

    /// Parse the stored string back into a kind.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidEnum`] for anything other than
    /// `"one_off"` or `"recurring"`.
    pub fn parse(value: &str) -> Result<Self, PersistenceError> {
        match value {
            "one_off" => Ok(Self::OneOff),
            "recurring" => Ok(Self::Recurring),
            other => Err(PersistenceError::InvalidEnum {
                field: "reminders.kind",
                value: other.to_owned(),
            }),
        }
    }
}

/// A scheduled reminder.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Reminder {
    /// Primary key.
    pub id: i64,
    /// Who created the reminder.
    pub creator_id: i64,
    /// Who the reminder is delivered to.
    pub recipient_id: i64,
    /// Owning family.
    pub family_id: i64,
    /// Reminder text.
    pub text: String,
    /// One-off or recurring.
    pub kind: ReminderKind,
    /// Fire time for one-off reminders.
    pub fire_at_utc: Option<DateTime<Utc>>,
    /// Raw recurrence rule for recurring reminders (e.g. `"daily 08:00"`).
    pub recurrence: Option<String>,
    /// Next scheduled fire time for recurring reminders.
    pub next_fire_at_utc: Option<DateTime<Utc>>,
    /// When a one-off reminder was delivered. `None` until delivery.
    pub sent_at: Option<DateTime<Utc>>,
    /// When a recurring reminder last fired.
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

type ReminderRow = (
    i64,
    i64,
    i64,
    i64,
    String,
    String,
    Option<DateTime<Utc>>,
    Option<String>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
);

fn reminder_from_row(row: ReminderRow) -> Result<Reminder, PersistenceError> {
    let (
        id,
        creator_id,
        recipient_id,
        family_id,
        text,
        kind,
        fire_at_utc,
        recurrence,
        next_fire_at_utc,
        sent_at,
        last_fired_at,
        created_at,
    ) = row;
    Ok(Reminder {
        id,
        creator_id,
        recipient_id,
        family_id,
        text,
        kind: ReminderKind::parse(&kind)?,
        fire_at_utc,
        recurrence,
        next_fire_at_utc,
        sent_at,
        last_fired_at,
        created_at,
    })
}

const SELECT_REMINDER: &str = "SELECT id, creator_id, recipient_id, family_id, text, kind, \
     fire_at_utc, recurrence, next_fire_at_utc, sent_at, last_fired_at, created_at FROM reminders";

/// Create a one-off reminder.
pub async fn create_one_off(
    pool: &SqlitePool,
    creator_id: i64,
    recipient_id: i64,
    family_id: i64,
    text: &str,
    fire_at_utc: DateTime<Utc>,
) -> Result<Reminder, PersistenceError> {
    let id = sqlx::query(
        "INSERT INTO reminders (creator_id, recipient_id, family_id, text, kind, fire_at_utc)
         VALUES (?, ?, ?, ?, 'one_off', ?)",
    )
    .bind(creator_id)
    .bind(recipient_id)
    .bind(family_id)
    .bind(text)
    .bind(fire_at_utc)
    .execute(pool)
    .await?
    .last_insert_rowid();

    get_reminder(pool, id).await
}

/// Create a recurring reminder, pre-seeded with its first fire time.
pub async fn create_recurring(
    pool: &SqlitePool,
    creator_id: i64,
    recipient_id: i64,
    family_id: i64,
    text: &str,
    recurrence: &str,
    first_fire_at_utc: DateTime<Utc>,
) -> Result<Reminder, PersistenceError> {
    let id = sqlx::query(
        "INSERT INTO reminders
            (creator_id, recipient_id, family_id, text, kind, recurrence, next_fire_at_utc)
         VALUES (?, ?, ?, ?, 'recurring', ?, ?)",
    )
    .bind(creator_id)
    .bind(recipient_id)
    .bind(family_id)
    .bind(text)
    .bind(recurrence)
    .bind(first_fire_at_utc)
    .execute(pool)
    .await?
    .last_insert_rowid();

    get_reminder(pool, id).await
}

/// Fetch a reminder by id.
pub async fn get_reminder(pool: &SqlitePool, reminder_id: i64) -> Result<Reminder, PersistenceError> {
    let row: ReminderRow = sqlx::query_as(&format!("{SELECT_REMINDER} WHERE id = ?"))
        .bind(reminder_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| PersistenceError::NotFound(format!("reminder {reminder_id}")))?;
    reminder_from_row(row)
}

/// Atomically claim every one-off reminder due at or before `now`, marking
/// each delivered in the same statement. Safe to call from more than one
/// scheduler loop at once.
pub async fn claim_due_one_off(
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<Vec<Reminder>, PersistenceError> {
    let rows: Vec<ReminderRow> = sqlx::query_as(&format!(
        "UPDATE reminders SET sent_at = ?
         WHERE kind = 'one_off' AND sent_at IS NULL AND fire_at_utc <= ?
         RETURNING {cols}",
        cols = "id, creator_id, recipient_id, family_id, text, kind, fire_at_utc, recurrence, \
                next_fire_at_utc, sent_at, last_fired_at, created_at",
    ))
    .bind(now)
    .bind(now)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(reminder_from_row).collect()
}

/// Atomically claim every recurring reminder due at or before `now`,
/// advancing each to `next_fire_at_utc` in the same statement. `next_fire_at`
/// is handed the recurrence rule and the recipient's IANA timezone, and is
/// responsible for computing the next occurrence.
pub async fn claim_due_recurring(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    next_fire_at: impl Fn(&str, &str, DateTime<Utc>) -> Option<DateTime<Utc>>,
) -> Result<Vec<Reminder>, PersistenceError> {
    type DueRow = (
        i64,
        i64,
        i64,
        i64,
        String,
        String,
        Option<DateTime<Utc>>,
        Option<String>,
        Option<DateTime<Utc>>,
        Option<DateTime<Utc>>,
        Option<DateTime<Utc>>,
        DateTime<Utc>,
        String,
    );

    let due: Vec<DueRow> = sqlx::query_as(&format!(
        "SELECT {cols}, u.timezone FROM reminders r JOIN users u ON u.id = r.recipient_id \
         WHERE r.kind = 'recurring' AND r.next_fire_at_utc <= ?",
        cols = "r.id, r.creator_id, r.recipient_id, r.family_id, r.text, r.kind, r.fire_at_utc, \
                r.recurrence, r.next_fire_at_utc, r.sent_at, r.last_fired_at, r.created_at",
    ))
    .bind(now)
    .fetch_all(pool)
    .await?;

    let mut claimed = Vec::with_capacity(due.len());
    for (id, creator_id, recipient_id, family_id, text, kind, fire_at_utc, recurrence, next_fire_at_utc, sent_at, last_fired_at, created_at, timezone) in due {
        let reminder = reminder_from_row((
            id,
            creator_id,
            recipient_id,
            family_id,
            text,
            kind,
            fire_at_utc,
            recurrence,
            next_fire_at_utc,
            sent_at,
            last_fired_at,
            created_at,
        ))?;
        let Some(recurrence) = reminder.recurrence.as_deref() else {
            continue;
        };
        let next = next_fire_at(recurrence, &timezone, now);

        // Re-check `next_fire_at_utc <= now` at update time, same as the
        // one-off path's single-statement claim: a concurrent sweep that
        // already advanced this row past `now` loses the race here instead
        // of firing it twice.
        let result = sqlx::query(
            "UPDATE reminders SET last_fired_at = ?, next_fire_at_utc = ?
             WHERE id = ? AND next_fire_at_utc <= ?",
        )
        .bind(now)
        .bind(next)
        .bind(reminder.id)
        .bind(now)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            claimed.push(reminder);
        }
    }

    Ok(claimed)
}
