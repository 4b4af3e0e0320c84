//! Tenant resolution: turning a transport principal into the
//! `(user, family)` pair every other component keys its state on.
//!
//! A brand-new principal is bootstrapped into its own single-member
//! family on first contact, mirroring how a fresh phone number or
//! Telegram account should "just work" without an explicit signup step.

use sqlx::SqlitePool;

use crate::db::family::{self, Family};
use crate::db::user::{self, User};
use crate::db::PersistenceError;
use crate::identity;

/// A resolved tenant: the user and family a message should be processed
/// under.
#[derive(Debug, Clone, PartialEq)]
pub struct Tenant {
    /// The resolved user.
    pub user: User,
    /// The family the message is being processed within.
    pub family: Family,
}

/// Resolve a Telegram principal to its tenant, creating the user and a
/// fresh family if this is the first time this Telegram id has been seen.
pub async fn resolve_telegram(
    pool: &SqlitePool,
    telegram_id: i64,
    display_name: &str,
) -> Result<Tenant, PersistenceError> {
    let existing = user::get_user_by_telegram_id(pool, telegram_id).await?;
    let resolved_user = match existing {
        Some(found) => found,
        None => user::create_user(pool, display_name, None, Some(telegram_id)).await?,
    };
    resolve_for_user(pool, resolved_user).await
}

/// Resolve a phone-based principal to its tenant, creating the user and a
/// fresh family if this is the first time this phone number has been seen.
pub async fn resolve_phone(
    pool: &SqlitePool,
    raw_principal: &str,
    display_name: &str,
) -> Result<Tenant, PersistenceError> {
    let canonical = identity::canonicalize(raw_principal);
    let existing = user::get_user_by_phone(pool, &canonical).await?;
    let resolved_user = match existing {
        Some(found) => found,
        None => user::create_user(pool, display_name, Some(&canonical), None).await?,
    };
    resolve_for_user(pool, resolved_user).await
}

/// Resolve the active family for an already-known user, in order:
/// their last-active family if set; else their existing membership with
/// the lowest family id, if they belong to any family already; else a
/// newly bootstrapped family, for a user who has never been affiliated
/// with one.
async fn resolve_for_user(pool: &SqlitePool, resolved_user: User) -> Result<Tenant, PersistenceError> {
    let family = match resolved_user.last_active_family {
        Some(family_id) => family::get_family(pool, family_id).await?,
        None => {
            let memberships = family::list_families_for_user(pool, resolved_user.id).await?;
            let existing_family_id = memberships.iter().map(|m| m.family_id).min();

            let family = match existing_family_id {
                Some(family_id) => family::get_family(pool, family_id).await?,
                None => {
                    family::create_family(
                        pool,
                        &format!("{}'s family", resolved_user.display_name),
                        resolved_user.id,
                    )
                    .await?
                }
            };
            user::set_last_active_family(pool, resolved_user.id, family.id).await?;
            family
        }
    };

    Ok(Tenant {
        user: resolved_user,
        family,
    })
}

/// Switch a user's active family, used when a user belongs to more than
/// one family and explicitly selects which to act within.
///
/// # Errors
///
/// Returns [`PersistenceError::NotFound`] if the user is not a member of
/// `family_id`.
pub async fn switch_active_family(
    pool: &SqlitePool,
    user_id: i64,
    family_id: i64,
) -> Result<Tenant, PersistenceError> {
    let memberships = family::list_families_for_user(pool, user_id).await?;
    if !memberships.iter().any(|m| m.family_id == family_id) {
        return Err(PersistenceError::NotFound(format!(
            "user {user_id} is not a member of family {family_id}"
        )));
    }

    user::set_last_active_family(pool, user_id, family_id).await?;
    let resolved_user = user::get_user(pool, user_id).await?;
    let family = family::get_family(pool, family_id).await?;
    Ok(Tenant {
        user: resolved_user,
        family,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_contact_bootstraps_a_family() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let tenant = resolve_telegram(&pool, 42, "Ada").await.unwrap();
        assert_eq!(tenant.user.telegram_id, Some(42));
        assert_eq!(tenant.family.name, "Ada's family");
    }

    #[tokio::test]
    async fn repeat_contact_resolves_to_same_tenant() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let first = resolve_telegram(&pool, 42, "Ada").await.unwrap();
        let second = resolve_telegram(&pool, 42, "Ada").await.unwrap();
        assert_eq!(first.user.id, second.user.id);
        assert_eq!(first.family.id, second.family.id);
    }

    #[tokio::test]
    async fn phone_principal_is_canonicalized_before_lookup() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let first = resolve_phone(&pool, "+1 (555) 123-4567", "Ada").await.unwrap();
        let second = resolve_phone(&pool, "5551234567", "Ada").await.unwrap();
        assert_eq!(first.user.id, second.user.id);
    }

    #[tokio::test]
    async fn first_contact_with_an_existing_membership_resolves_to_it_instead_of_bootstrapping() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let owner = resolve_telegram(&pool, 1, "Grace").await.unwrap();

        // A user added to an existing family out-of-band (e.g. by an
        // owner inviting them) before ever contacting the bot themselves.
        let invitee = user::create_user(&pool, "Ada", None, Some(2)).await.unwrap();
        family::add_member(&pool, owner.family.id, invitee.id, family::MembershipRole::Member)
            .await
            .unwrap();

        let tenant = resolve_telegram(&pool, 2, "Ada").await.unwrap();
        assert_eq!(tenant.family.id, owner.family.id);
    }

    #[tokio::test]
    async fn switching_to_unaffiliated_family_fails() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let tenant = resolve_telegram(&pool, 42, "Ada").await.unwrap();
        let other = resolve_telegram(&pool, 99, "Grace").await.unwrap();

        let err = switch_active_family(&pool, tenant.user.id, other.family.id)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }
}
