//! Contacts / Directory: a derived view over a family's users, for
//! resolving between phone numbers and display names when composing or
//! routing a message to "send to Cara" rather than a raw number.

use sqlx::SqlitePool;

use crate::db::family;
use crate::db::user::User;
use crate::db::PersistenceError;

/// Look up a family member's display name by their canonical phone token.
pub async fn number_to_name(
    pool: &SqlitePool,
    family_id: i64,
    phone: &str,
) -> Result<Option<String>, PersistenceError> {
    let members = members_with_phones(pool, family_id).await?;
    Ok(members
        .into_iter()
        .find(|u| u.phone.as_deref() == Some(phone))
        .map(|u| u.display_name))
}

/// Look up a family member's canonical phone token by exact
/// case-insensitive display name match.
pub async fn name_to_number(
    pool: &SqlitePool,
    family_id: i64,
    name: &str,
) -> Result<Option<String>, PersistenceError> {
    let members = members_with_phones(pool, family_id).await?;
    let needle = name.to_lowercase();
    Ok(members
        .into_iter()
        .find(|u| u.display_name.to_lowercase() == needle)
        .and_then(|u| u.phone))
}

async fn members_with_phones(
    pool: &SqlitePool,
    family_id: i64,
) -> Result<Vec<User>, PersistenceError> {
    let memberships = family::list_members(pool, family_id).await?;
    let mut members = Vec::with_capacity(memberships.len());
    for membership in memberships {
        members.push(crate::db::user::get_user(pool, membership.user_id).await?);
    }
    Ok(members)
}

/// Resolve a spoken name to a family member's phone number.
///
/// Matching order:
/// 1. An exact, case-insensitive full-name match.
/// 2. The first contact whose first name equals the input's first word,
///    exactly (case-insensitively) — so `"Cara"` resolves to `"Cara Hogue"`
///    but never matches `"Carrie"`.
///
/// Returns `None` if no member's phone is known, or no name matches.
pub async fn resolve_contact_to_number(
    pool: &SqlitePool,
    family_id: i64,
    name: &str,
) -> Result<Option<String>, PersistenceError> {
    let members = members_with_phones(pool, family_id).await?;
    let needle = name.trim().to_lowercase();

    if let Some(exact) = members
        .iter()
        .find(|u| u.display_name.to_lowercase() == needle)
    {
        return Ok(exact.phone.clone());
    }

    let first_word = needle.split_whitespace().next().unwrap_or(&needle);
    let by_first_name = members.iter().find(|u| {
        u.display_name
            .split_whitespace()
            .next()
            .map(|first| first.to_lowercase() == first_word)
            .unwrap_or(false)
    });

    Ok(by_first_name.and_then(|u| u.phone.clone()))
}

/// Whether `name` matches a family member at all, regardless of whether
/// that member has a phone on file — used to distinguish "unknown
/// contact" from "known contact, no phone" error messages.
pub async fn member_known(
    pool: &SqlitePool,
    family_id: i64,
    name: &str,
) -> Result<bool, PersistenceError> {
    let members = members_with_phones(pool, family_id).await?;
    let needle = name.trim().to_lowercase();
    let first_word = needle.split_whitespace().next().unwrap_or(&needle);

    Ok(members.iter().any(|u| {
        let display = u.display_name.to_lowercase();
        display == needle
            || display
                .split_whitespace()
                .next()
                .map(|first| first == first_word)
                .unwrap_or(false)
    }))
}
