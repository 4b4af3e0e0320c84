//! Memory Store: a thin orchestrator over the persistence layer that adds
//! relevance scoring to facts and prompt-shaping to conversation/summary
//! reads. Holds no state of its own beyond the pool it wraps.

use std::collections::HashSet;

use sqlx::SqlitePool;

use crate::db::conversation::{self, ConversationMessage, Role};
use crate::db::fact::{self, Fact, FactScope};
use crate::db::summary;
use crate::db::PersistenceError;

/// Default cap on facts returned by a relevance search.
pub const DEFAULT_FACT_LIMIT: usize = 12;

/// Keys that receive a fixed relevance boost regardless of token overlap,
/// since they're disproportionately useful context even when they don't
/// share vocabulary with the triggering message.
const BOOSTED_KEYS: &[&str] = &[
    "name",
    "email",
    "location",
    "city",
    "state",
    "zip",
    "home_zip",
    "timezone",
];

/// Fixed score added to a fact whose key is in [`BOOSTED_KEYS`].
const BOOST_SCORE: u32 = 1000;

fn tokenize(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|tok| tok.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|tok| !tok.is_empty())
        .collect()
}

fn score_fact(fact: &Fact, query_tokens: &HashSet<String>) -> u32 {
    let mut haystack = tokenize(&fact.key);
    haystack.extend(tokenize(&fact.value));
    for tag in &fact.tags {
        haystack.extend(tokenize(tag));
    }

    let overlap = haystack.intersection(query_tokens).count() as u32;
    let boost = if BOOSTED_KEYS.contains(&fact.key.as_str()) {
        BOOST_SCORE
    } else {
        0
    };
    overlap + boost
}

/// Search a tenant's facts for relevance to `message`, scored by
/// token overlap across key/value/tags with a fixed boost for a set of
/// always-useful keys (name, location, contact details, timezone). Ties
/// are broken by recency. Capped at `limit` results.
pub async fn search_facts(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
    message: &str,
    limit: usize,
) -> Result<Vec<Fact>, PersistenceError> {
    let all = fact::list_facts(pool, user_id, family_id).await?;
    let query_tokens = tokenize(message);

    let mut scored: Vec<(u32, Fact)> = all
        .into_iter()
        .map(|f| (score_fact(&f, &query_tokens), f))
        .collect();

    // list_facts already orders by updated_at DESC, so a stable sort on
    // score alone preserves recency as the tiebreaker.
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.truncate(limit);

    Ok(scored.into_iter().map(|(_, f)| f).collect())
}

/// Fetch every fact visible to a tenant, unscored, for "what do you know
/// about me" style queries.
pub async fn all_facts(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
) -> Result<Vec<Fact>, PersistenceError> {
    fact::list_facts(pool, user_id, family_id).await
}

/// Record a fact, scoped personal or family-wide.
pub async fn remember(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
    key: &str,
    value: &str,
    scope: FactScope,
    tags: &[String],
) -> Result<Fact, PersistenceError> {
    fact::upsert_fact(pool, user_id, family_id, key, value, scope, tags).await
}

/// Fetch the most recent conversation turns, oldest first, suitable for
/// direct inclusion in a prompt.
pub async fn recent_conversation(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
    cap: u32,
) -> Result<Vec<ConversationMessage>, PersistenceError> {
    conversation::recent(pool, user_id, family_id, cap).await
}

/// Append a user/assistant exchange as two turns, trimming the log back
/// to `cap` after each append.
pub async fn append_exchange(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
    user_message: &str,
    assistant_reply: &str,
    cap: u32,
) -> Result<(), PersistenceError> {
    conversation::append_and_trim(pool, user_id, family_id, Role::User, user_message, cap).await?;
    conversation::append_and_trim(
        pool,
        user_id,
        family_id,
        Role::Assistant,
        assistant_reply,
        cap,
    )
    .await?;
    Ok(())
}

/// Render the rolling summary as a single string suitable for prompt
/// inclusion.
pub async fn summary_text(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
) -> Result<String, PersistenceError> {
    let sentences = summary::get_summary(pool, user_id, family_id).await?;
    Ok(sentences.join(" "))
}

/// Append a sentence to the rolling summary, skipping it if it's an exact
/// duplicate of the most recently recorded sentence.
pub async fn append_summary(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
    sentence: &str,
) -> Result<(), PersistenceError> {
    let existing = summary::get_summary(pool, user_id, family_id).await?;
    if existing.last().map(String::as_str) == Some(sentence) {
        return Ok(());
    }
    summary::append_summary_sentence(pool, user_id, family_id, sentence).await
}

/// Render accumulated personality instructions as a single string
/// suitable for prompt inclusion.
pub async fn personality_text(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
) -> Result<String, PersistenceError> {
    let instructions = summary::get_personality(pool, user_id, family_id).await?;
    Ok(instructions.join(". "))
}

/// Append personality instructions, splitting on `". "` per the
/// persistence layer's convention.
pub async fn append_personality(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
    text: &str,
) -> Result<(), PersistenceError> {
    summary::append_personality_instructions(pool, user_id, family_id, text).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup(pool: &SqlitePool) -> (i64, i64) {
        let user = crate::db::user::create_user(pool, "Ada", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(pool, "Lovelaces", user.id)
            .await
            .unwrap();
        (user.id, family.id)
    }

    #[tokio::test]
    async fn boosted_keys_outrank_token_overlap() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let (user_id, family_id) = setup(&pool).await;

        remember(
            &pool,
            user_id,
            family_id,
            "favorite_color",
            "weather is great today",
            FactScope::Personal,
            &[],
        )
        .await
        .unwrap();
        remember(
            &pool,
            user_id,
            family_id,
            "home_zip",
            "10001",
            FactScope::Personal,
            &[],
        )
        .await
        .unwrap();

        let results = search_facts(&pool, user_id, family_id, "what's the weather", 12)
            .await
            .unwrap();
        assert_eq!(results[0].key, "home_zip");
    }

    #[tokio::test]
    async fn search_is_capped_at_limit() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let (user_id, family_id) = setup(&pool).await;

        for i in 0..20 {
            remember(
                &pool,
                user_id,
                family_id,
                &format!("fact_{i}"),
                "some value",
                FactScope::Personal,
                &[],
            )
            .await
            .unwrap();
        }

        let results = search_facts(&pool, user_id, family_id, "value", 5).await.unwrap();
        assert_eq!(results.len(), 5);
    }

    #[tokio::test]
    async fn duplicate_summary_sentence_is_skipped() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let (user_id, family_id) = setup(&pool).await;

        append_summary(&pool, user_id, family_id, "likes tea").await.unwrap();
        append_summary(&pool, user_id, family_id, "likes tea").await.unwrap();

        let text = summary_text(&pool, user_id, family_id).await.unwrap();
        assert_eq!(text, "likes tea");
    }
}
