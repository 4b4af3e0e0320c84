//! Skill Registry & ACL: the catalog of capabilities available to the
//! router's skill-selection stage, and which principals may invoke each.

pub mod executor;

use sqlx::SqlitePool;

use crate::db::skill::{self, Skill};
use crate::db::PersistenceError;

/// A skill that is always available without being registered in the
/// persistence layer: the router's own fallback behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticSkill {
    /// Reply directly in the assistant's own voice.
    CreateAResponse,
    /// Supportive, non-task conversation.
    FriendMode,
    /// Forward the message to another family member.
    SendToContact,
}

impl SyntheticSkill {
    /// Stable id, matching the string a selection-stage response would use.
    pub fn id(self) -> &'static str {
        match self {
            Self::CreateAResponse => "create_a_response",
            Self::FriendMode => "friend_mode",
            Self::SendToContact => "send_to_contact",
        }
    }

    /// Every synthetic skill, in a stable order.
    pub fn all() -> [Self; 3] {
        [Self::CreateAResponse, Self::FriendMode, Self::SendToContact]
    }
}

/// The skill catalog and ACL, reloaded from the persistence layer at the
/// start of each request so registry/grant changes take effect
/// immediately without a restart.
#[derive(Debug, Clone)]
pub struct Registry {
    skills: Vec<Skill>,
}

impl Registry {
    /// Load the current skill catalog from the persistence layer.
    pub async fn load(pool: &SqlitePool) -> Result<Self, PersistenceError> {
        Ok(Self {
            skills: skill::list_skills(pool).await?,
        })
    }

    /// Every registered (non-synthetic) skill.
    pub fn skills(&self) -> &[Skill] {
        &self.skills
    }

    /// Look up a registered skill by id. Returns `None` for synthetic
    /// skill ids — callers should check [`SyntheticSkill`] first.
    pub fn get(&self, skill_id: &str) -> Option<&Skill> {
        self.skills.iter().find(|s| s.id == skill_id)
    }

    /// Whether `principal` may invoke `skill_id`.
    ///
    /// Synthetic skills are always allowed. For registered skills, the
    /// effective allow-list for a principal is `byNumber[principal]` if
    /// present, else the `default` allow-list; if both are empty, every
    /// registered skill is allowed. A skill id that appears in an
    /// allow-list but isn't registered is simply never matched, which is
    /// equivalent to silently ignoring it.
    pub async fn is_allowed(
        &self,
        pool: &SqlitePool,
        principal: &str,
        skill_id: &str,
    ) -> Result<bool, PersistenceError> {
        if SyntheticSkill::all().iter().any(|s| s.id() == skill_id) {
            return Ok(true);
        }
        if self.get(skill_id).is_none() {
            return Ok(false);
        }

        let has_any_grants = has_any_acl_entries(pool).await?;
        if !has_any_grants {
            return Ok(true);
        }

        skill::is_allowed(pool, principal, skill_id).await
    }
}

async fn has_any_acl_entries(pool: &SqlitePool) -> Result<bool, PersistenceError> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM skill_acl")
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}
