//! Skill registry: the catalog of executable capabilities and which
//! principals are allowed to invoke each one.

use sqlx::SqlitePool;

use super::PersistenceError;

/// A registered skill.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Skill {
    /// Stable identifier, e.g. `"send_to_contact"`.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// One-line description surfaced to the selection stage.
    pub description: String,
    /// Executable entrypoint (a path for subprocess skills, or a sentinel
    /// for in-process synthetic skills).
    pub entrypoint: String,
    /// JSON schema describing the skill's expected input.
    pub input_schema: serde_json::Value,
}

type SkillRow = (String, String, String, String, String);

fn skill_from_row(row: SkillRow) -> Skill {
    let (id, name, description, entrypoint, input_schema) = row;
    Skill {
        id,
        name,
        description,
        entrypoint,
        input_schema: serde_json::from_str(&input_schema).unwrap_or(serde_json::Value::Null),
    }
}

const SELECT_SKILL: &str = "SELECT id, name, description, entrypoint, input_schema FROM skills";

/// Register a skill, overwriting any existing registration with the same id.
pub async fn register_skill(pool: &SqlitePool, skill: &Skill) -> Result<(), PersistenceError> {
    let schema_json =
        serde_json::to_string(&skill.input_schema).unwrap_or_else(|_| "{}".to_owned());
    sqlx::query(
        "INSERT INTO skills (id, name, description, entrypoint, input_schema) VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name, description = excluded.description,
            entrypoint = excluded.entrypoint, input_schema = excluded.input_schema",
    )
    .bind(&skill.id)
    .bind(&skill.name)
    .bind(&skill.description)
    .bind(&skill.entrypoint)
    .bind(schema_json)
    .execute(pool)
    .await?;
    Ok(())
}

/// List every registered skill.
pub async fn list_skills(pool: &SqlitePool) -> Result<Vec<Skill>, PersistenceError> {
    let rows: Vec<SkillRow> = sqlx::query_as(SELECT_SKILL).fetch_all(pool).await?;
    Ok(rows.into_iter().map(skill_from_row).collect())
}

/// Fetch a skill by id.
pub async fn get_skill(pool: &SqlitePool, skill_id: &str) -> Result<Option<Skill>, PersistenceError> {
    let row: Option<SkillRow> = sqlx::query_as(&format!("{SELECT_SKILL} WHERE id = ?"))
        .bind(skill_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(skill_from_row))
}

/// Grant a principal (an owner token, or `"*"` for everyone) access to a skill.
pub async fn grant_access(
    pool: &SqlitePool,
    principal: &str,
    skill_id: &str,
) -> Result<(), PersistenceError> {
    sqlx::query("INSERT OR IGNORE INTO skill_acl (principal, skill_id) VALUES (?, ?)")
        .bind(principal)
        .bind(skill_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Whether `principal` may invoke `skill_id`.
///
/// Null-coalescing, not unioned: if `principal` holds any grant rows of its
/// own, those rows are the *entire* allow-list for that principal — the
/// wildcard `"*"` default is only consulted when `principal` has no grants
/// at all. A principal explicitly restricted to `todo` must not also pass
/// because `"*"` happens to be granted `weather`.
pub async fn is_allowed(
    pool: &SqlitePool,
    principal: &str,
    skill_id: &str,
) -> Result<bool, PersistenceError> {
    let (has_own_grants,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM skill_acl WHERE principal = ?")
            .bind(principal)
            .fetch_one(pool)
            .await?;

    let owning_principal = if has_own_grants > 0 { principal } else { "*" };
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM skill_acl WHERE principal = ? AND skill_id = ?")
            .bind(owning_principal)
            .bind(skill_id)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_skill(id: &str) -> Skill {
        Skill {
            id: id.to_owned(),
            name: "Weather".to_owned(),
            description: "Fetch the forecast".to_owned(),
            entrypoint: "skills/weather.sh".to_owned(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn wildcard_grant_allows_every_principal() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        register_skill(&pool, &sample_skill("weather")).await.unwrap();
        grant_access(&pool, "*", "weather").await.unwrap();

        assert!(is_allowed(&pool, "5551234567", "weather").await.unwrap());
        assert!(!is_allowed(&pool, "5551234567", "admin_only").await.unwrap());
    }

    #[tokio::test]
    async fn specific_grant_does_not_leak_to_other_principals() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        register_skill(&pool, &sample_skill("admin_only")).await.unwrap();
        grant_access(&pool, "5551234567", "admin_only").await.unwrap();

        assert!(is_allowed(&pool, "5551234567", "admin_only").await.unwrap());
        assert!(!is_allowed(&pool, "5559999999", "admin_only").await.unwrap());
    }

    #[tokio::test]
    async fn own_grant_replaces_the_default_instead_of_unioning_with_it() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        register_skill(&pool, &sample_skill("weather")).await.unwrap();
        register_skill(&pool, &sample_skill("todo")).await.unwrap();
        grant_access(&pool, "*", "weather").await.unwrap();
        grant_access(&pool, "5551234567", "todo").await.unwrap();

        assert!(is_allowed(&pool, "5551234567", "todo").await.unwrap());
        assert!(
            !is_allowed(&pool, "5551234567", "weather").await.unwrap(),
            "a principal's own grant list must replace the default, not union with it"
        );
        assert!(is_allowed(&pool, "5559999999", "weather").await.unwrap());
    }
}
