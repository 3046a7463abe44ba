//! Pending-reminder / auto-close scheduler.
//!
//! A single process-wide ticker scans tickets whose `until_time` has
//! elapsed. Reminder states publish to the notifications hub and keep their
//! pending time (agents clear it by setting a new state); auto-close states
//! transition through the lifecycle service, which re-checks the condition
//! under the ticket row lock, so overlapping workers no-op on redelivery.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db;
use crate::error::Result;
use crate::lifecycle::TicketService;
use crate::models::{StateType, Ticket};
use crate::notifications::ReminderEvent;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub reminders: usize,
    pub auto_closed: usize,
    pub skipped: usize,
}

fn reminder_event(ticket: &Ticket) -> ReminderEvent {
    ReminderEvent {
        ticket_id: ticket.id,
        tn: ticket.tn.clone(),
        title: ticket.title.clone(),
        until_time: ticket.until_time,
        fired_at: Utc::now(),
    }
}

/// One scan pass over the due tickets.
pub async fn scan_once(service: &TicketService, batch_size: i64) -> Result<ScanStats> {
    let snapshot = service.lookups().snapshot().await?;
    let now = Utc::now().timestamp();
    let due = db::list_due_pending_tickets(service.pool(), now, batch_size).await?;

    let mut stats = ScanStats::default();
    for ticket in due {
        let state_type = match snapshot.state_type_of(ticket.state_id) {
            Ok(st) => st,
            Err(e) => {
                warn!(ticket_id = ticket.id, error = %e, "Skipping ticket with unresolvable state");
                stats.skipped += 1;
                continue;
            }
        };

        match state_type {
            StateType::PendingReminder => {
                // The pending time stays set; agents clear it explicitly.
                match ticket.reminder_recipient() {
                    Some(user_id) => {
                        service.hub().emit(user_id, reminder_event(&ticket)).await;
                        stats.reminders += 1;
                    }
                    None => {
                        debug!(ticket_id = ticket.id, "Reminder due but ticket has no owner");
                        stats.skipped += 1;
                    }
                }
            }
            StateType::PendingAutoClosePlus | StateType::PendingAutoCloseMinus => {
                match service.auto_close_due(ticket.id).await {
                    Ok(true) => stats.auto_closed += 1,
                    Ok(false) => stats.skipped += 1,
                    Err(e) => {
                        error!(ticket_id = ticket.id, error = %e, "Auto-close failed");
                        stats.skipped += 1;
                    }
                }
            }
            // A stale until_time on a non-pending ticket is a no-op.
            _ => {
                debug!(
                    ticket_id = ticket.id,
                    state_type = state_type.as_str(),
                    "Elapsed pending time on non-pending ticket, ignoring"
                );
                stats.skipped += 1;
            }
        }
    }
    Ok(stats)
}

/// Run the scheduler. Call from the composition root; returns when
/// `shutdown` is cancelled. In-flight transactions complete.
pub async fn run_pending_scan_worker(
    service: Arc<TicketService>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        interval_secs = config.interval.as_secs(),
        "Pending scan worker started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match scan_once(&service, config.batch_size).await {
                    Ok(stats) if stats == ScanStats::default() => {}
                    Ok(stats) => debug!(
                        reminders = stats.reminders,
                        auto_closed = stats.auto_closed,
                        skipped = stats.skipped,
                        "Pending scan complete"
                    ),
                    Err(e) => error!(error = %e, "Pending scan failed"),
                }
            }
            _ = shutdown.cancelled() => {
                info!("Pending scan worker shutting down");
                break;
            }
        }
    }
}
