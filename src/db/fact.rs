//! Durable facts about a user or family: the substrate the memory store
//! layers scoring and boosting on top of.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::PersistenceError;

/// Whether a fact belongs to one person or is shared across the family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FactScope {
    /// Visible only when reasoning about the owning user.
    Personal,
    /// Visible to every member of the family.
    Family,
}

impl FactScope {
    /// Render as the string stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Family => "family",
        }
    }

    /// Parse the stored string back into a scope.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidEnum`] for anything other than
    /// `"personal"` or `"family"`.
    pub fn parse(value: &str) -> Result<Self, PersistenceError> {
        match value {
            "personal" => Ok(Self::Personal),
            "family" => Ok(Self::Family),
            other => Err(PersistenceError::InvalidEnum {
                field: "facts.scope",
                value: other.to_owned(),
            }),
        }
    }
}

/// A single fact: a key/value pair scoped to a user or family, with
/// freeform tags for later filtering.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Fact {
    /// Primary key.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Owning family.
    pub family_id: i64,
    /// Fact key, e.g. `"name"`, `"home_zip"`.
    pub key: String,
    /// Fact value.
    pub value: String,
    /// Visibility scope.
    pub scope: FactScope,
    /// Freeform tags.
    pub tags: Vec<String>,
    /// Last write timestamp.
    pub updated_at: DateTime<Utc>,
}

type FactRow = (i64, i64, i64, String, String, String, String, DateTime<Utc>);

fn fact_from_row(row: FactRow) -> Result<Fact, PersistenceError> {
    let (id, user_id, family_id, key, value, scope, tags, updated_at) = row;
    let tags: Vec<String> = serde_json::from_str(&tags).unwrap_or_default();
    Ok(Fact {
        id,
        user_id,
        family_id,
        key,
        value,
        scope: FactScope::parse(&scope)?,
        tags,
        updated_at,
    })
}

const SELECT_FACT: &str =
    "SELECT id, user_id, family_id, key, value, scope, tags, updated_at FROM facts";

/// Insert a fact, or overwrite the value/scope/tags of an existing one with
/// the same `(user, family, key, scope)`.
pub async fn upsert_fact(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
    key: &str,
    value: &str,
    scope: FactScope,
    tags: &[String],
) -> Result<Fact, PersistenceError> {
    let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_owned());

    sqlx::query(
        "INSERT INTO facts (user_id, family_id, key, value, scope, tags, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
         ON CONFLICT(user_id, family_id, key, scope) DO UPDATE SET
            value = excluded.value, tags = excluded.tags,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')",
    )
    .bind(user_id)
    .bind(family_id)
    .bind(key)
    .bind(value)
    .bind(scope.as_str())
    .bind(&tags_json)
    .execute(pool)
    .await?;

    let row: FactRow = sqlx::query_as(&format!(
        "{SELECT_FACT} WHERE user_id = ? AND family_id = ? AND key = ? AND scope = ?"
    ))
    .bind(user_id)
    .bind(family_id)
    .bind(key)
    .bind(scope.as_str())
    .fetch_one(pool)
    .await?;

    fact_from_row(row)
}

/// List every fact visible to `user_id` within `family_id`: their personal
/// facts plus every family-scoped fact.
pub async fn list_facts(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
) -> Result<Vec<Fact>, PersistenceError> {
    let rows: Vec<FactRow> = sqlx::query_as(&format!(
        "{SELECT_FACT} WHERE family_id = ? AND (scope = 'family' OR user_id = ?)
         ORDER BY updated_at DESC"
    ))
    .bind(family_id)
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(fact_from_row).collect()
}

/// Delete a fact by id.
pub async fn delete_fact(pool: &SqlitePool, fact_id: i64) -> Result<(), PersistenceError> {
    sqlx::query("DELETE FROM facts WHERE id = ?")
        .bind(fact_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_overwrites_same_key_and_scope() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let user = crate::db::user::create_user(&pool, "Ada", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(&pool, "Lovelaces", user.id)
            .await
            .unwrap();

        upsert_fact(
            &pool,
            user.id,
            family.id,
            "home_zip",
            "10001",
            FactScope::Personal,
            &[],
        )
        .await
        .unwrap();
        upsert_fact(
            &pool,
            user.id,
            family.id,
            "home_zip",
            "10002",
            FactScope::Personal,
            &[],
        )
        .await
        .unwrap();

        let facts = list_facts(&pool, user.id, family.id).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, "10002");
    }

    #[tokio::test]
    async fn family_scoped_facts_visible_to_other_member() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let owner = crate::db::user::create_user(&pool, "Ada", None, None)
            .await
            .unwrap();
        let member = crate::db::user::create_user(&pool, "Grace", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(&pool, "Lovelaces", owner.id)
            .await
            .unwrap();

        upsert_fact(
            &pool,
            owner.id,
            family.id,
            "wifi_password",
            "hunter2",
            FactScope::Family,
            &[],
        )
        .await
        .unwrap();

        let facts = list_facts(&pool, member.id, family.id).await.unwrap();
        assert_eq!(facts.len(), 1);
    }
}
