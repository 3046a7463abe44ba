//! Guarded admin operations on groups, queues and permission grants.
//!
//! Only what the lifecycle requires lives here: deactivation flows, the
//! hard-delete guards, and the grant mutation that keeps the permission
//! cache honest. System groups ("admin", "users", "stats") may be
//! deactivated but never hard-deleted; a queue with tickets may be
//! deactivated but never hard-deleted.

use std::sync::Arc;
use tracing::info;

use crate::db::{self, DbPool};
use crate::error::{Error, Result};
use crate::lookups::LookupCache;
use crate::models::PermissionKey;
use crate::permissions::PermissionService;

pub struct AdminOps {
    pool: DbPool,
    lookups: Arc<LookupCache>,
    permissions: Arc<PermissionService>,
}

impl AdminOps {
    pub fn new(
        pool: DbPool,
        lookups: Arc<LookupCache>,
        permissions: Arc<PermissionService>,
    ) -> Self {
        Self {
            pool,
            lookups,
            permissions,
        }
    }

    /// Grant or revoke one permission key. Invalidate the affected user's
    /// cached matrix so the change is visible immediately.
    pub async fn set_group_permission(
        &self,
        user_id: i64,
        group_id: i64,
        key: PermissionKey,
        granted: bool,
    ) -> Result<()> {
        db::upsert_group_permission(
            &self.pool,
            user_id,
            group_id,
            key.as_str(),
            i16::from(granted),
        )
        .await?;
        self.permissions.invalidate(user_id).await;
        info!(user_id, group_id, key = key.as_str(), granted, "Permission grant updated");
        Ok(())
    }

    /// Mark a group invalid. Its queues keep their tickets; access through
    /// the group stops at the next matrix load.
    pub async fn deactivate_group(&self, group_id: i64) -> Result<()> {
        let updated = sqlx::query("UPDATE groups SET valid_id = 2, change_time = NOW() WHERE id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::not_found("group"));
        }
        self.permissions.invalidate_all();
        Ok(())
    }

    /// Hard-delete a group. Refused for system groups and for groups that
    /// still guard a queue; deactivate instead.
    pub async fn delete_group(&self, group_id: i64) -> Result<()> {
        let name: Option<String> = sqlx::query_scalar("SELECT name FROM groups WHERE id = $1")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?;
        let name = name.ok_or(Error::not_found("group"))?;
        if matches!(name.as_str(), "admin" | "users" | "stats") {
            return Err(Error::precondition(format!(
                "system group '{}' cannot be deleted, only deactivated",
                name
            )));
        }

        let queues: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue WHERE group_id = $1")
            .bind(group_id)
            .fetch_one(&self.pool)
            .await?;
        if queues > 0 {
            return Err(Error::precondition(format!(
                "group '{}' still guards {} queue(s)",
                name, queues
            )));
        }

        sqlx::query("DELETE FROM group_user WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM groups WHERE id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        self.permissions.invalidate_all();
        info!(group_id, name = %name, "Group deleted");
        Ok(())
    }

    /// Mark a queue invalid. Existing tickets stay in the queue and remain
    /// readable; new routing into it is refused by the lookup layer.
    pub async fn deactivate_queue(&self, queue_id: i64) -> Result<()> {
        let updated = sqlx::query("UPDATE queue SET valid_id = 2 WHERE id = $1")
            .bind(queue_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::not_found("queue"));
        }
        self.lookups.invalidate().await;
        Ok(())
    }

    /// Hard-delete a queue. Refused while any ticket references it.
    pub async fn delete_queue(&self, queue_id: i64) -> Result<()> {
        let tickets: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ticket WHERE queue_id = $1")
            .bind(queue_id)
            .fetch_one(&self.pool)
            .await?;
        if tickets > 0 {
            return Err(Error::precondition(format!(
                "queue still holds {} ticket(s); deactivate it instead",
                tickets
            )));
        }

        let deleted = sqlx::query("DELETE FROM queue WHERE id = $1")
            .bind(queue_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(Error::not_found("queue"));
        }
        self.lookups.invalidate().await;
        info!(queue_id, "Queue deleted");
        Ok(())
    }
}
