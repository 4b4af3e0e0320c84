//! LLM call audit log: every request/response pair that crosses the
//! gateway choke point, keyed by request id and pipeline step so a single
//! router invocation's full trace can be reconstructed later.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::PersistenceError;

/// One logged LLM call.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LlmAuditEntry {
    /// Correlates every step of a single pipeline invocation.
    pub request_id: String,
    /// Sender, if the call was made on behalf of one.
    pub user_id: Option<i64>,
    /// Owning family, if applicable.
    pub family_id: Option<i64>,
    /// Canonical owner token the call was made on behalf of.
    pub owner: String,
    /// Which pipeline stage issued the call, e.g. `"fact_extract"`.
    pub step: String,
    /// The serialized request document sent to the provider.
    pub request_doc: String,
    /// The raw response text received back.
    pub response_text: String,
    /// When the call was logged.
    pub created_at: DateTime<Utc>,
}

/// Append an audit entry. Insert-only: the audit log is never mutated or
/// pruned by the application, only grown.
pub async fn record(
    pool: &SqlitePool,
    request_id: &str,
    user_id: Option<i64>,
    family_id: Option<i64>,
    owner: &str,
    step: &str,
    request_doc: &str,
    response_text: &str,
) -> Result<(), PersistenceError> {
    sqlx::query(
        "INSERT INTO llm_log (request_id, user_id, family_id, owner, step, request_doc, response_text)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(request_id)
    .bind(user_id)
    .bind(family_id)
    .bind(owner)
    .bind(step)
    .bind(request_doc)
    .bind(response_text)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch every logged step for a single request id, in insertion order.
pub async fn trace(
    pool: &SqlitePool,
    request_id: &str,
) -> Result<Vec<LlmAuditEntry>, PersistenceError> {
    let rows: Vec<(String, Option<i64>, Option<i64>, String, String, String, String, DateTime<Utc>)> =
        sqlx::query_as(
            "SELECT request_id, user_id, family_id, owner, step, request_doc, response_text, created_at
             FROM llm_log WHERE request_id = ? ORDER BY created_at, rowid",
        )
        .bind(request_id)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(
            |(request_id, user_id, family_id, owner, step, request_doc, response_text, created_at)| {
                LlmAuditEntry {
                    request_id,
                    user_id,
                    family_id,
                    owner,
                    step,
                    request_doc,
                    response_text,
                    created_at,
                }
            },
        )
        .collect())
}
