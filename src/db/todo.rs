//! Family-scoped todo items.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::PersistenceError;

/// A single todo item assigned to a family member.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Todo {
    /// Primary key.
    pub id: i64,
    /// Who the item is assigned to.
    pub assignee_id: i64,
    /// Owning family.
    pub family_id: i64,
    /// Who created the item.
    pub creator_id: i64,
    /// Item text.
    pub text: String,
    /// Optional due timestamp.
    pub due_at: Option<DateTime<Utc>>,
    /// Whether the item has been completed.
    pub done: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

type TodoRow = (
    i64,
    i64,
    i64,
    i64,
    String,
    Option<DateTime<Utc>>,
    i64,
    DateTime<Utc>,
);

fn todo_from_row(row: TodoRow) -> Todo {
    let (id, assignee_id, family_id, creator_id, text, due_at, done, created_at) = row;
    Todo {
        id,
        assignee_id,
        family_id,
        creator_id,
        text,
        due_at,
        done: done != 0,
        created_at,
    }
}

const SELECT_TODO: &str =
    "SELECT id, assignee_id, family_id, creator_id, text, due_at, done, created_at FROM todos";

/// Create a todo item.
pub async fn create_todo(
    pool: &SqlitePool,
    assignee_id: i64,
    family_id: i64,
    creator_id: i64,
    text: &str,
    due_at: Option<DateTime<Utc>>,
) -> Result<Todo, PersistenceError> {
    let id = sqlx::query(
        "INSERT INTO todos (assignee_id, family_id, creator_id, text, due_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(assignee_id)
    .bind(family_id)
    .bind(creator_id)
    .bind(text)
    .bind(due_at)
    .execute(pool)
    .await?
    .last_insert_rowid();

    let row: TodoRow = sqlx::query_as(&format!("{SELECT_TODO} WHERE id = ?"))
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(todo_from_row(row))
}

/// List open (not-done) todos assigned to a user within a family.
pub async fn list_open_for_assignee(
    pool: &SqlitePool,
    assignee_id: i64,
    family_id: i64,
) -> Result<Vec<Todo>, PersistenceError> {
    let rows: Vec<TodoRow> = sqlx::query_as(&format!(
        "{SELECT_TODO} WHERE assignee_id = ? AND family_id = ? AND done = 0 ORDER BY created_at"
    ))
    .bind(assignee_id)
    .bind(family_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(todo_from_row).collect())
}

/// Mark a todo item done.
pub async fn mark_done(pool: &SqlitePool, todo_id: i64) -> Result<(), PersistenceError> {
    let result = sqlx::query("UPDATE todos SET done = 1 WHERE id = ?")
        .bind(todo_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(PersistenceError::NotFound(format!("todo {todo_id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn created_todo_is_open_until_marked_done() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let user = crate::db::user::create_user(&pool, "Ada", None, None)
            .await
            .unwrap();
        let family = crate::db::family::create_family(&pool, "Lovelaces", user.id)
            .await
            .unwrap();

        let todo = create_todo(&pool, user.id, family.id, user.id, "buy milk", None)
            .await
            .unwrap();
        assert!(!todo.done);

        let open = list_open_for_assignee(&pool, user.id, family.id)
            .await
            .unwrap();
        assert_eq!(open.len(), 1);

        mark_done(&pool, todo.id).await.unwrap();
        let open = list_open_for_assignee(&pool, user.id, family.id)
            .await
            .unwrap();
        assert!(open.is_empty());
    }
}
