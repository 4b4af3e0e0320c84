//! Scheduler: a periodic sweep that turns due reminders into synthetic
//! router requests, so a delivered reminder is personality-consistent and
//! lands in the recipient's own conversation log exactly as if they'd
//! triggered it themselves.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::db::reminder::{self, Reminder};
use crate::db::user;
use crate::db::PersistenceError;
use crate::router::{self, Router, RouterOutput, RouterOwner};

/// Default interval between sweeps.
pub const DEFAULT_TICK: Duration = Duration::from_secs(30);

/// Delivers a routing outcome produced by a scheduler-triggered request to
/// whichever transport owns the recipient. A real deployment wires this to
/// the Telegram/self-chat senders; kept as a trait so the sweep logic
/// doesn't need to know which transport a recipient lives on.
#[async_trait::async_trait]
pub trait OutboundSink: Send + Sync {
    /// Deliver `output`, addressed to `recipient`.
    async fn deliver(&self, recipient: &RouterOwner, output: RouterOutput);
}

/// Periodic sweep over due reminders.
pub struct Scheduler {
    pool: SqlitePool,
    router: Arc<Router>,
    sink: Arc<dyn OutboundSink>,
    tick: Duration,
}

impl Scheduler {
    /// Build a scheduler over `router`, delivering outcomes via `sink`.
    pub fn new(pool: SqlitePool, router: Arc<Router>, sink: Arc<dyn OutboundSink>, tick: Duration) -> Self {
        Self { pool, router, sink, tick }
    }

    /// Run the sweep loop until `shutdown` signals true or closes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        info!(tick_secs = self.tick.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep(Utc::now()).await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("scheduler stopped");
    }

    /// Run a single sweep at `now`. Exposed directly for tests so the
    /// sweep logic can be exercised without waiting on a real ticker.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        if let Err(err) = self.sweep_one_off(now).await {
            warn!(error = %err, "one-off reminder sweep failed");
        }
        if let Err(err) = self.sweep_recurring(now).await {
            warn!(error = %err, "recurring reminder sweep failed");
        }
    }

    async fn sweep_one_off(&self, now: DateTime<Utc>) -> Result<(), PersistenceError> {
        let due = reminder::claim_due_one_off(&self.pool, now).await?;
        for item in due {
            self.fire(&item).await;
        }
        Ok(())
    }

    async fn sweep_recurring(&self, now: DateTime<Utc>) -> Result<(), PersistenceError> {
        let due = reminder::claim_due_recurring(&self.pool, now, |recurrence, timezone, after| {
            next_fire_after(recurrence, timezone, after)
        })
        .await?;
        for item in due {
            self.fire(&item).await;
        }
        Ok(())
    }

    /// Deliver a single due reminder, unless its family is currently
    /// resting in a rate-limit cooldown.
    async fn fire(&self, due: &Reminder) {
        if self.router.family_in_cooldown(due.family_id).await {
            info!(reminder_id = due.id, family_id = due.family_id, "family in cooldown; suppressing reminder");
            return;
        }

        let recipient = match user::get_user(&self.pool, due.recipient_id).await {
            Ok(user) => user,
            Err(err) => {
                warn!(error = %err, reminder_id = due.id, "could not resolve reminder recipient");
                return;
            }
        };

        let owner = match (recipient.telegram_id, recipient.phone.as_deref()) {
            (Some(telegram_id), _) => RouterOwner::Telegram { id: telegram_id, display_name: recipient.display_name.clone() },
            (None, Some(phone)) => RouterOwner::Phone { raw: phone.to_owned(), display_name: recipient.display_name.clone() },
            (None, None) => {
                warn!(reminder_id = due.id, "reminder recipient has neither telegram id nor phone");
                return;
            }
        };

        let message = format!("[scheduled: reminder] {}", due.text);
        let request_id = format!("reminder-{}", due.id);
        let output = self.router.route(&request_id, &owner, &message).await;
        self.sink.deliver(&owner, output).await;
    }
}

/// Compute the next UTC occurrence of `recurrence` strictly after `after`,
/// interpreted in `timezone`. Returns `None` for an unparseable recurrence
/// string or timezone — callers treat that as "never fires again" rather
/// than panicking a sweep over one malformed row.
fn next_fire_after(recurrence: &str, timezone: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let captures = router::recurrence_pattern().captures(recurrence)?;
    let frequency = captures.get(1)?.as_str().to_lowercase();
    let hour: u32 = captures.get(3)?.as_str().parse().ok()?;
    let minute: u32 = captures.get(4)?.as_str().parse().ok()?;
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;

    let tz: Tz = timezone.parse().ok()?;
    let local_after = after.with_timezone(&tz);

    let target_weekday = frequency.strip_prefix("weekly:").and_then(parse_weekday);

    let mut candidate_date = local_after.date_naive();
    for _ in 0..400 {
        let matches_frequency = match frequency.as_str() {
            "daily" => true,
            "weekdays" => !matches!(candidate_date.weekday(), Weekday::Sat | Weekday::Sun),
            _ => Some(candidate_date.weekday()) == target_weekday,
        };

        if matches_frequency {
            let candidate_naive = candidate_date.and_time(time);
            if let Some(candidate_local) = tz
                .from_local_datetime(&candidate_naive)
                .single()
                .or_else(|| tz.from_local_datetime(&candidate_naive).earliest())
            {
                if candidate_local > local_after {
                    return Some(candidate_local.with_timezone(&Utc));
                }
            }
        }

        candidate_date = candidate_date.succ_opt()?;
    }

    None
}

fn parse_weekday(token: &str) -> Option<Weekday> {
    match token {
        "mon" => Some(Weekday::Mon),
        "tue" => Some(Weekday::Tue),
        "wed" => Some(Weekday::Wed),
        "thu" => Some(Weekday::Thu),
        "fri" => Some(Weekday::Fri),
        "sat" => Some(Weekday::Sat),
        "sun" => Some(Weekday::Sun),
        _ => None,
    }
}
