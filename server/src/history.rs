//! History recorder: the single choke-point for audit log writes.
//!
//! Every state-change path records through [`record`] inside its own
//! transaction; the `messages` helpers derive the human-readable names so
//! update events read as diffs ("State set from 'open' to 'closed
//! successful'").

use sqlx::{Postgres, Transaction};

use crate::db;
use crate::models::HistoryType;

/// Append one history row inside the caller's transaction.
pub async fn record(
    txn: &mut Transaction<'_, Postgres>,
    ticket_id: i64,
    article_id: Option<i64>,
    history_type: HistoryType,
    name: &str,
    by: i64,
) -> sqlx::Result<i64> {
    db::insert_history(txn, ticket_id, article_id, history_type.as_str(), name, by).await
}

/// Human-readable history messages. Update events mention both the old and
/// the new value when a previous snapshot is available.
pub mod messages {
    use crate::util::excerpt;

    /// Body excerpts in history are capped at 140 characters.
    pub const EXCERPT_MAX: usize = 140;

    pub fn new_ticket(queue_name: &str) -> String {
        format!("New ticket created in queue '{}'.", queue_name)
    }

    pub fn state_update(old_state: &str, new_state: &str) -> String {
        format!("State set from '{}' to '{}'.", old_state, new_state)
    }

    pub fn pending_time_set(until: chrono::DateTime<chrono::Utc>) -> String {
        format!(
            "Pending time set to {}.",
            until.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }

    pub fn pending_time_cleared() -> String {
        "Pending time cleared.".to_string()
    }

    pub fn owner_update(owner_login: &str) -> String {
        format!("Owner set to '{}'.", owner_login)
    }

    pub fn priority_update(old_priority: &str, new_priority: &str) -> String {
        format!("Priority set from '{}' to '{}'.", old_priority, new_priority)
    }

    pub fn queue_move(old_queue: &str, new_queue: &str) -> String {
        format!("Ticket moved from queue '{}' to queue '{}'.", old_queue, new_queue)
    }

    pub fn add_note(body: &str) -> String {
        format!("Note added: {}", excerpt(body, EXCERPT_MAX))
    }

    pub fn time_accounting(minutes: i32, total_minutes: i64) -> String {
        format!("Accounted {} minutes ({} total).", minutes, total_minutes)
    }

    pub fn merged_into(target_tn: &str) -> String {
        format!("Merged into ticket #{}.", target_tn)
    }

    pub fn merged_from(source_tn: &str) -> String {
        format!("Ticket #{} was merged into this ticket.", source_tn)
    }

    pub fn reopened(reason: &str) -> String {
        format!("Reopened: {}", excerpt(reason, EXCERPT_MAX))
    }

    pub fn attachment_added(filename: &str) -> String {
        format!("Attachment '{}' added.", filename)
    }

    pub fn dynamic_field_set(field_name: &str) -> String {
        format!("Dynamic field '{}' set.", field_name)
    }
}

#[cfg(test)]
mod tests {
    use super::messages;

    #[test]
    fn test_state_update_mentions_both_states() {
        let msg = messages::state_update("open", "closed successful");
        assert!(msg.contains("open"));
        assert!(msg.contains("closed successful"));
    }

    #[test]
    fn test_queue_move_mentions_both_queues() {
        let msg = messages::queue_move("Raw", "Postmaster");
        assert!(msg.contains("Raw"));
        assert!(msg.contains("Postmaster"));
    }

    #[test]
    fn test_note_excerpt_is_bounded() {
        let body = "word ".repeat(100);
        let msg = messages::add_note(&body);
        // "Note added: " prefix plus the capped excerpt.
        assert!(msg.chars().count() <= 12 + messages::EXCERPT_MAX);
        assert!(msg.ends_with("..."));
    }

    #[test]
    fn test_pending_time_formats() {
        let until = chrono::DateTime::parse_from_rfc3339("2026-08-01T12:30:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(
            messages::pending_time_set(until),
            "Pending time set to 2026-08-01 12:30:00 UTC."
        );
    }

    #[test]
    fn test_merge_messages() {
        assert_eq!(
            messages::merged_into("20260801120000"),
            "Merged into ticket #20260801120000."
        );
        assert_eq!(
            messages::merged_from("20260801120000"),
            "Ticket #20260801120000 was merged into this ticket."
        );
    }

    #[test]
    fn test_time_accounting_message() {
        assert_eq!(
            messages::time_accounting(5, 15),
            "Accounted 5 minutes (15 total)."
        );
    }
}
