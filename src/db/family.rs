//! Families and the memberships that tie users to them.
//!
//! A family always has at least one owner; [`remove_member`] refuses to
//! drop the last remaining owner rather than leave a family ownerless.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::PersistenceError;

/// A family: the tenancy boundary shared facts, conversations, and
/// reminders are scoped under.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Family {
    /// Primary key.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A membership's role within a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MembershipRole {
    /// Can manage membership and family-scoped settings.
    Owner,
    /// Ordinary participant.
    Member,
}

impl MembershipRole {
    /// Render as the string stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Member => "member",
        }
    }

    /// Parse the stored string back into a role.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidEnum`] for anything other than
    /// `"owner"` or `"member"`.
    pub fn parse(value: &str) -> Result<Self, PersistenceError> {
        match value {
            "owner" => Ok(Self::Owner),
            "member" => Ok(Self::Member),
            other => Err(PersistenceError::InvalidEnum {
                field: "memberships.role",
                value: other.to_owned(),
            }),
        }
    }
}

/// A user's membership in a family.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Membership {
    /// Primary key.
    pub id: i64,
    /// Member user id.
    pub user_id: i64,
    /// Family id.
    pub family_id: i64,
    /// Role within the family.
    pub role: MembershipRole,
    /// When the user joined.
    pub joined_at: DateTime<Utc>,
}

type MembershipRow = (i64, i64, i64, String, DateTime<Utc>);

fn membership_from_row(row: MembershipRow) -> Result<Membership, PersistenceError> {
    let (id, user_id, family_id, role, joined_at) = row;
    Ok(Membership {
        id,
        user_id,
        family_id,
        role: MembershipRole::parse(&role)?,
        joined_at,
    })
}

/// Create a new family with a single owning member.
pub async fn create_family(
    pool: &SqlitePool,
    name: &str,
    owner_user_id: i64,
) -> Result<Family, PersistenceError> {
    let mut tx = pool.begin().await?;

    let family_id = sqlx::query("INSERT INTO families (name) VALUES (?)")
        .bind(name)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

    sqlx::query("INSERT INTO memberships (user_id, family_id, role) VALUES (?, ?, 'owner')")
        .bind(owner_user_id)
        .bind(family_id)
        .execute(&mut *tx)
        .await?;

    let family: (i64, String, DateTime<Utc>) =
        sqlx::query_as("SELECT id, name, created_at FROM families WHERE id = ?")
            .bind(family_id)
            .fetch_one(&mut *tx)
            .await?;

    tx.commit().await?;

    Ok(Family {
        id: family.0,
        name: family.1,
        created_at: family.2,
    })
}

/// Fetch a family by id.
pub async fn get_family(pool: &SqlitePool, family_id: i64) -> Result<Family, PersistenceError> {
    let row: (i64, String, DateTime<Utc>) =
        sqlx::query_as("SELECT id, name, created_at FROM families WHERE id = ?")
            .bind(family_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(format!("family {family_id}")))?;
    Ok(Family {
        id: row.0,
        name: row.1,
        created_at: row.2,
    })
}

/// List every membership in a family.
pub async fn list_members(
    pool: &SqlitePool,
    family_id: i64,
) -> Result<Vec<Membership>, PersistenceError> {
    let rows: Vec<MembershipRow> = sqlx::query_as(
        "SELECT id, user_id, family_id, role, joined_at FROM memberships WHERE family_id = ?",
    )
    .bind(family_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(membership_from_row).collect()
}

/// List every family a user belongs to.
pub async fn list_families_for_user(
    pool: &SqlitePool,
    user_id: i64,
) -> Result<Vec<Membership>, PersistenceError> {
    let rows: Vec<MembershipRow> = sqlx::query_as(
        "SELECT id, user_id, family_id, role, joined_at FROM memberships WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(membership_from_row).collect()
}

/// Add a member to a family, defaulting to the `member` role.
pub async fn add_member(
    pool: &SqlitePool,
    family_id: i64,
    user_id: i64,
    role: MembershipRole,
) -> Result<(), PersistenceError> {
    sqlx::query(
        "INSERT INTO memberships (user_id, family_id, role) VALUES (?, ?, ?)
         ON CONFLICT(user_id, family_id) DO UPDATE SET role = excluded.role",
    )
    .bind(user_id)
    .bind(family_id)
    .bind(role.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// Count the owners currently in a family.
async fn owner_count(pool: &SqlitePool, family_id: i64) -> Result<i64, PersistenceError> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM memberships WHERE family_id = ? AND role = 'owner'",
    )
    .bind(family_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Remove a member from a family.
///
/// # Errors
///
/// Returns [`PersistenceError::InvariantViolated`] if removing this member
/// would leave the family with no owners.
pub async fn remove_member(
    pool: &SqlitePool,
    family_id: i64,
    user_id: i64,
) -> Result<(), PersistenceError> {
    let members = list_members(pool, family_id).await?;
    let target = members.iter().find(|m| m.user_id == user_id);

    if let Some(member) = target {
        if member.role == MembershipRole::Owner && owner_count(pool, family_id).await? <= 1 {
            return Err(PersistenceError::InvariantViolated(
                "cannot remove the last owner of a family".to_owned(),
            ));
        }
    }

    sqlx::query("DELETE FROM memberships WHERE family_id = ? AND user_id = ?")
        .bind(family_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Whether `user_id` is an owner of `family_id`.
pub async fn is_owner(
    pool: &SqlitePool,
    family_id: i64,
    user_id: i64,
) -> Result<bool, PersistenceError> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT role FROM memberships WHERE family_id = ? AND user_id = ?",
    )
    .bind(family_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some((role,)) => Ok(MembershipRole::parse(&role)? == MembershipRole::Owner),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::user::create_user;

    #[tokio::test]
    async fn family_always_keeps_an_owner() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let owner = create_user(&pool, "Ada", None, None).await.unwrap();
        let family = create_family(&pool, "Lovelaces", owner.id).await.unwrap();

        assert!(is_owner(&pool, family.id, owner.id).await.unwrap());

        let err = remove_member(&pool, family.id, owner.id).await.unwrap_err();
        assert!(matches!(err, PersistenceError::InvariantViolated(_)));
    }

    #[tokio::test]
    async fn second_owner_can_leave() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let owner = create_user(&pool, "Ada", None, None).await.unwrap();
        let co_owner = create_user(&pool, "Grace", None, None).await.unwrap();
        let family = create_family(&pool, "Lovelaces", owner.id).await.unwrap();
        add_member(&pool, family.id, co_owner.id, MembershipRole::Owner)
            .await
            .unwrap();

        remove_member(&pool, family.id, co_owner.id).await.unwrap();
        let members = list_members(&pool, family.id).await.unwrap();
        assert_eq!(members.len(), 1);
    }
}
