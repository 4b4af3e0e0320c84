//! Group chats: transport-level chat rooms mapped onto a family, used so
//! an inbound group message can be resolved to a tenant without per-member
//! lookup.

use sqlx::SqlitePool;

use super::PersistenceError;

/// A transport chat room bound to a family.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GroupChat {
    /// Transport-specific chat id, e.g. a Telegram chat id as a string.
    pub chat_id: String,
    /// Display name.
    pub name: String,
    /// Transport type, e.g. `"telegram"`.
    pub kind: String,
    /// Owning family.
    pub family_id: i64,
}

type GroupChatRow = (String, String, String, i64);

fn group_chat_from_row(row: GroupChatRow) -> GroupChat {
    let (chat_id, name, kind, family_id) = row;
    GroupChat {
        chat_id,
        name,
        kind,
        family_id,
    }
}

/// Register or update a group chat's family binding.
pub async fn upsert_group_chat(
    pool: &SqlitePool,
    chat_id: &str,
    name: &str,
    kind: &str,
    family_id: i64,
) -> Result<(), PersistenceError> {
    sqlx::query(
        "INSERT INTO group_chats (chat_id, name, type, family_id) VALUES (?, ?, ?, ?)
         ON CONFLICT(chat_id) DO UPDATE SET name = excluded.name, family_id = excluded.family_id",
    )
    .bind(chat_id)
    .bind(name)
    .bind(kind)
    .bind(family_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Resolve a transport chat id to its bound family, if registered.
pub async fn get_group_chat(
    pool: &SqlitePool,
    chat_id: &str,
) -> Result<Option<GroupChat>, PersistenceError> {
    let row: Option<GroupChatRow> =
        sqlx::query_as("SELECT chat_id, name, type, family_id FROM group_chats WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(group_chat_from_row))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_lookup_round_trips() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let user = crate::db::user::create_user(&pool, "Ada", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(&pool, "Lovelaces", user.id)
            .await
            .unwrap();

        upsert_group_chat(&pool, "tg-123", "Family Chat", "telegram", family.id)
            .await
            .unwrap();

        let found = get_group_chat(&pool, "tg-123").await.unwrap().expect("present");
        assert_eq!(found.family_id, family.id);
    }
}
