//! Rolling conversation summaries and accumulated personality instructions,
//! each capped to a fixed number of entries per tenant.

use sqlx::SqlitePool;

use super::PersistenceError;

/// Maximum sentences retained in a tenant's rolling summary.
pub const MAX_SUMMARY_SENTENCES: usize = 50;
/// Maximum instructions retained in a tenant's personality profile.
pub const MAX_PERSONALITY_INSTRUCTIONS: usize = 20;

async fn load_list(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    user_id: i64,
    family_id: i64,
) -> Result<Vec<String>, PersistenceError> {
    let row: Option<(String,)> = sqlx::query_as(&format!(
        "SELECT {column} FROM {table} WHERE user_id = ? AND family_id = ?"
    ))
    .bind(user_id)
    .bind(family_id)
    .fetch_optional(pool)
    .await?;

    Ok(row
        .map(|(json,)| serde_json::from_str(&json).unwrap_or_default())
        .unwrap_or_default())
}

async fn save_list(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    user_id: i64,
    family_id: i64,
    items: &[String],
) -> Result<(), PersistenceError> {
    let json = serde_json::to_string(items).unwrap_or_else(|_| "[]".to_owned());
    sqlx::query(&format!(
        "INSERT INTO {table} (user_id, family_id, {column}) VALUES (?, ?, ?)
         ON CONFLICT(user_id, family_id) DO UPDATE SET {column} = excluded.{column}"
    ))
    .bind(user_id)
    .bind(family_id)
    .bind(json)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch a tenant's rolling summary sentences, oldest first.
pub async fn get_summary(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
) -> Result<Vec<String>, PersistenceError> {
    load_list(pool, "summaries", "sentences", user_id, family_id).await
}

/// Append a sentence to a tenant's rolling summary, dropping the oldest
/// entry if the cap is exceeded.
pub async fn append_summary_sentence(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
    sentence: &str,
) -> Result<(), PersistenceError> {
    let mut sentences = get_summary(pool, user_id, family_id).await?;
    sentences.push(sentence.to_owned());
    if sentences.len() > MAX_SUMMARY_SENTENCES {
        let overflow = sentences.len() - MAX_SUMMARY_SENTENCES;
        sentences.drain(0..overflow);
    }
    save_list(pool, "summaries", "sentences", user_id, family_id, &sentences).await
}

/// Fetch a tenant's accumulated personality instructions.
pub async fn get_personality(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
) -> Result<Vec<String>, PersistenceError> {
    load_list(
        pool,
        "personality_instructions",
        "instructions",
        user_id,
        family_id,
    )
    .await
}

/// Append free-text personality instructions. The input is split on `". "`
/// so a single message containing several directives ("be brief. use no
/// emoji.") is stored as separate instructions, each later eligible for
/// independent inclusion in a composed prompt.
pub async fn append_personality_instructions(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
    text: &str,
) -> Result<(), PersistenceError> {
    let mut instructions = get_personality(pool, user_id, family_id).await?;
    for clause in text.split(". ") {
        let clause = clause.trim().trim_end_matches('.');
        if !clause.is_empty() && !instructions.iter().any(|existing| existing == clause) {
            instructions.push(clause.to_owned());
        }
    }
    if instructions.len() > MAX_PERSONALITY_INSTRUCTIONS {
        let overflow = instructions.len() - MAX_PERSONALITY_INSTRUCTIONS;
        instructions.drain(0..overflow);
    }
    save_list(
        pool,
        "personality_instructions",
        "instructions",
        user_id,
        family_id,
        &instructions,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn personality_instructions_split_on_sentence_boundary() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let user = crate::db::user::create_user(&pool, "Ada", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(&pool, "Lovelaces", user.id)
            .await
            .unwrap();

        append_personality_instructions(&pool, user.id, family.id, "be brief. use no emoji.")
            .await
            .unwrap();

        let instructions = get_personality(&pool, user.id, family.id).await.unwrap();
        assert_eq!(instructions, vec!["be brief", "use no emoji"]);
    }

    #[tokio::test]
    async fn appending_the_same_instruction_twice_does_not_duplicate_it() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let user = crate::db::user::create_user(&pool, "Ada", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(&pool, "Lovelaces", user.id)
            .await
            .unwrap();

        append_personality_instructions(&pool, user.id, family.id, "be brief")
            .await
            .unwrap();
        append_personality_instructions(&pool, user.id, family.id, "be brief")
            .await
            .unwrap();

        let instructions = get_personality(&pool, user.id, family.id).await.unwrap();
        assert_eq!(instructions, vec!["be brief"]);
    }

    #[tokio::test]
    async fn summary_caps_and_drops_oldest() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let user = crate::db::user::create_user(&pool, "Ada", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(&pool, "Lovelaces", user.id)
            .await
            .unwrap();

        for i in 0..(MAX_SUMMARY_SENTENCES + 5) {
            append_summary_sentence(&pool, user.id, family.id, &format!("fact {i}"))
                .await
                .unwrap();
        }

        let summary = get_summary(&pool, user.id, family.id).await.unwrap();
        assert_eq!(summary.len(), MAX_SUMMARY_SENTENCES);
        assert_eq!(summary[0], "fact 5");
    }
}
