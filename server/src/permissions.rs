//! Permission service: answers "may principal P perform action A on queue Q"
//! and produces the per-user permission matrix for admin UIs.
//!
//! Grants live in `group_user` as (user, group, key, value) rows; a queue is
//! guarded by its group. The resolved matrix is cached per user and
//! invalidated on group/user mutations.

use moka::future::Cache;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::db::{self, DbPool};
use crate::error::{Error, Result};
use crate::models::{GroupUser, PermissionKey, Queue};

/// Actions guarded per queue, mapped to the key they require. `rw` always
/// suffices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    ReadTicket,
    MoveInto,
    CreateTicket,
    AddNote,
    ChangeOwner,
    ChangePriority,
    OtherMutation,
}

impl QueueAction {
    pub fn required_key(&self) -> PermissionKey {
        match self {
            Self::ReadTicket => PermissionKey::Ro,
            Self::MoveInto => PermissionKey::MoveInto,
            Self::CreateTicket => PermissionKey::Create,
            Self::AddNote => PermissionKey::Note,
            Self::ChangeOwner => PermissionKey::Owner,
            Self::ChangePriority => PermissionKey::Priority,
            Self::OtherMutation => PermissionKey::Rw,
        }
    }
}

/// The effective key set of one user in one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    keys: HashSet<PermissionKey>,
}

impl PermissionSet {
    pub fn insert(&mut self, key: PermissionKey) {
        self.keys.insert(key);
    }

    /// `rw` implies every other key.
    pub fn allows(&self, key: PermissionKey) -> bool {
        self.keys.contains(&key) || self.keys.contains(&PermissionKey::Rw)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PermissionKey> {
        self.keys.iter()
    }
}

/// Resolved permissions of one user, cached as a unit.
#[derive(Debug, Clone)]
pub struct UserPermissions {
    pub user_valid: bool,
    pub is_admin: bool,
    pub matrix: HashMap<i64, PermissionSet>,
}

impl UserPermissions {
    fn denied() -> Self {
        Self {
            user_valid: false,
            is_admin: false,
            matrix: HashMap::new(),
        }
    }

    pub fn allows_in_group(&self, group_id: i64, key: PermissionKey) -> bool {
        if !self.user_valid {
            return false;
        }
        if self.is_admin {
            return true;
        }
        self.matrix
            .get(&group_id)
            .map(|set| set.allows(key))
            .unwrap_or(false)
    }
}

/// Fold grant rows into the per-group matrix. Multiple rows for the same
/// (group, key) OR together; a positive value anywhere wins.
pub fn build_matrix(grants: &[GroupUser]) -> HashMap<i64, PermissionSet> {
    let mut matrix: HashMap<i64, PermissionSet> = HashMap::new();
    for grant in grants {
        if grant.permission_value <= 0 {
            continue;
        }
        let Some(key) = PermissionKey::from_name(&grant.permission_key) else {
            debug!(key = %grant.permission_key, "Skipping unknown permission key");
            continue;
        };
        matrix.entry(grant.group_id).or_default().insert(key);
    }
    matrix
}

pub struct PermissionService {
    pool: DbPool,
    cache: Cache<i64, Arc<UserPermissions>>,
}

impl PermissionService {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            cache: Cache::new(10_000),
        }
    }

    /// Resolved permissions of one user, cached until invalidated.
    pub async fn resolve(&self, user_id: i64) -> Result<Arc<UserPermissions>> {
        if let Some(perms) = self.cache.get(&user_id).await {
            return Ok(perms);
        }
        let perms = Arc::new(self.load(user_id).await?);
        self.cache.insert(user_id, Arc::clone(&perms)).await;
        Ok(perms)
    }

    /// The full user↔group matrix for admin UIs.
    pub async fn permissions_for(
        &self,
        user_id: i64,
    ) -> Result<HashMap<i64, PermissionSet>> {
        Ok(self.resolve(user_id).await?.matrix.clone())
    }

    /// May the user perform `action` on this queue?
    pub async fn may_access_queue(
        &self,
        user_id: i64,
        queue: &Queue,
        action: QueueAction,
    ) -> Result<bool> {
        let perms = self.resolve(user_id).await?;
        Ok(perms.allows_in_group(queue.group_id, action.required_key()))
    }

    /// Like [`may_access_queue`], but failing with `PermissionDenied`.
    pub async fn authorize_queue(
        &self,
        user_id: i64,
        queue: &Queue,
        action: QueueAction,
    ) -> Result<()> {
        if self.may_access_queue(user_id, queue, action).await? {
            return Ok(());
        }
        Err(Error::permission_denied(format!(
            "user {} lacks {} on queue {}",
            user_id,
            action.required_key().as_str(),
            queue.name
        )))
    }

    /// Drop one user's cached matrix after a grant change.
    pub async fn invalidate(&self, user_id: i64) {
        self.cache.invalidate(&user_id).await;
    }

    /// Drop every cached matrix after a group mutation.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    async fn load(&self, user_id: i64) -> Result<UserPermissions> {
        let Some(user) = db::get_user(&self.pool, user_id).await? else {
            return Ok(UserPermissions::denied());
        };
        if !user.is_valid() {
            // Invalid users keep read access to their own tickets only;
            // that exception is enforced on the read path.
            return Ok(UserPermissions::denied());
        }

        let grants = db::list_group_grants(&self.pool, user_id).await?;
        let matrix = build_matrix(&grants);

        let is_admin = if user.is_system() {
            true
        } else {
            match db::get_group_by_name(&self.pool, "admin").await? {
                Some(admin) => matrix
                    .get(&admin.id)
                    .map(|set| !set.is_empty())
                    .unwrap_or(false),
                None => false,
            }
        };

        Ok(UserPermissions {
            user_valid: true,
            is_admin,
            matrix,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(group_id: i64, key: &str, value: i16) -> GroupUser {
        GroupUser {
            user_id: 5,
            group_id,
            permission_key: key.to_string(),
            permission_value: value,
        }
    }

    #[test]
    fn test_rw_implies_all_keys() {
        let matrix = build_matrix(&[grant(1, "rw", 1)]);
        let set = matrix.get(&1).unwrap();
        for key in [
            PermissionKey::Ro,
            PermissionKey::MoveInto,
            PermissionKey::Create,
            PermissionKey::Note,
            PermissionKey::Owner,
            PermissionKey::Priority,
            PermissionKey::Rw,
        ] {
            assert!(set.allows(key));
        }
    }

    #[test]
    fn test_single_key_does_not_imply_others() {
        let matrix = build_matrix(&[grant(2, "ro", 1)]);
        let set = matrix.get(&2).unwrap();
        assert!(set.allows(PermissionKey::Ro));
        assert!(!set.allows(PermissionKey::MoveInto));
        assert!(!set.allows(PermissionKey::Rw));
    }

    #[test]
    fn test_duplicate_grants_or_together() {
        // A zero-valued row does not cancel a positive one.
        let matrix = build_matrix(&[grant(1, "note", 0), grant(1, "note", 1)]);
        assert!(matrix.get(&1).unwrap().allows(PermissionKey::Note));

        let matrix = build_matrix(&[grant(1, "note", 1), grant(1, "note", 0)]);
        assert!(matrix.get(&1).unwrap().allows(PermissionKey::Note));
    }

    #[test]
    fn test_zero_valued_grant_alone_denies() {
        let matrix = build_matrix(&[grant(1, "ro", 0)]);
        assert!(matrix.get(&1).is_none());
    }

    #[test]
    fn test_grant_monotonicity() {
        // Granting a new key never removes access previously held.
        let before = build_matrix(&[grant(1, "ro", 1)]);
        let after = build_matrix(&[grant(1, "ro", 1), grant(1, "move_into", 1)]);
        for (group_id, set) in &before {
            for key in set.keys() {
                assert!(after.get(group_id).unwrap().allows(*key));
            }
        }
    }

    #[test]
    fn test_unknown_key_skipped() {
        let matrix = build_matrix(&[grant(1, "superuser", 1)]);
        assert!(matrix.get(&1).is_none());
    }

    #[test]
    fn test_action_key_table() {
        assert_eq!(QueueAction::ReadTicket.required_key(), PermissionKey::Ro);
        assert_eq!(QueueAction::MoveInto.required_key(), PermissionKey::MoveInto);
        assert_eq!(QueueAction::CreateTicket.required_key(), PermissionKey::Create);
        assert_eq!(QueueAction::AddNote.required_key(), PermissionKey::Note);
        assert_eq!(QueueAction::ChangeOwner.required_key(), PermissionKey::Owner);
        assert_eq!(QueueAction::ChangePriority.required_key(), PermissionKey::Priority);
        assert_eq!(QueueAction::OtherMutation.required_key(), PermissionKey::Rw);
    }

    #[test]
    fn test_admin_bypass_and_invalid_user() {
        let admin = UserPermissions {
            user_valid: true,
            is_admin: true,
            matrix: HashMap::new(),
        };
        assert!(admin.allows_in_group(42, PermissionKey::Rw));

        let invalid = UserPermissions {
            user_valid: false,
            is_admin: true,
            matrix: HashMap::new(),
        };
        assert!(!invalid.allows_in_group(42, PermissionKey::Ro));
    }

    #[test]
    fn test_matrix_lookup_by_group() {
        let perms = UserPermissions {
            user_valid: true,
            is_admin: false,
            matrix: build_matrix(&[grant(3, "create", 1)]),
        };
        assert!(perms.allows_in_group(3, PermissionKey::Create));
        assert!(!perms.allows_in_group(4, PermissionKey::Create));
    }
}
