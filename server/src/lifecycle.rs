//! The lifecycle service: the single entry point for every ticket mutation.
//!
//! Each public operation validates its input, consults the permission
//! service, performs all writes in one transaction serialized by the ticket
//! row lock, records history through the recorder, and (where an article is
//! customer-visible) enqueues outbound mail after the transaction commits.
//! Mail enqueue is best-effort: a failure is logged and counted, never
//! propagated.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{self, DbPool, NewArticle, NewTicket};
use crate::dynamic_fields::{self, FieldRegistry, FieldValue, ObjectType};
use crate::error::{Error, Result};
use crate::history::{self, messages};
use crate::lookups::LookupCache;
use crate::mailq::{self, MailQueue};
use crate::models::{
    Article, Channel, HistoryType, Principal, ScreenName, SenderType, StateType, Ticket,
    TicketHistory,
};
use crate::notifications::NotificationHub;
use crate::permissions::{PermissionService, QueueAction};
use crate::ticket_number::TnGenerator;

/// How many times CreateTicket retries a colliding ticket number.
const TN_RETRY_LIMIT: usize = 5;

/// Subject length cap; longer titles are a validation error.
const SUBJECT_MAX: usize = 200;

/// Service-level configuration, env-driven in the composition root.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// When set, agent notes must carry accounted time.
    pub require_time_units: bool,
}

/// An attachment supplied with a new article.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CreateTicketInput {
    pub subject: String,
    pub body: String,
    pub queue_id: i64,
    pub channel: Channel,
    pub type_id: Option<i64>,
    pub priority_id: Option<i64>,
    /// Customer directory login; resolved to an address for notifications.
    pub customer_user_id: Option<String>,
    /// Raw customer address for channels without a directory entry.
    pub customer_email: Option<String>,
    pub attachments: Vec<NewAttachment>,
    pub dynamic_fields: HashMap<String, FieldValue>,
}

#[derive(Debug, Clone)]
pub struct AddArticleInput {
    pub subject: Option<String>,
    pub body: String,
    pub content_type: String,
    pub sender_type: SenderType,
    pub channel: Channel,
    pub visible_for_customer: bool,
    pub time_units: Option<i32>,
    pub attachments: Vec<NewAttachment>,
    pub dynamic_fields: HashMap<String, FieldValue>,
}

#[derive(Debug, Clone)]
pub struct CloseTicketInput {
    pub state_id: i64,
    pub note: String,
    pub time_units: Option<i32>,
    pub dynamic_fields: HashMap<String, FieldValue>,
    pub notify_customer: bool,
}

/// Result of CreateTicket: the persisted ticket and its first article.
#[derive(Debug, Clone)]
pub struct CreatedTicket {
    pub ticket: Ticket,
    pub article_id: i64,
}

/// A ticket with its communication and audit trail, loaded in three
/// queries.
#[derive(Debug, Clone)]
pub struct TicketView {
    pub ticket: Ticket,
    pub articles: Vec<Article>,
    pub history: Vec<TicketHistory>,
}

/// The orchestrator. One instance per process; background workers borrow
/// its components through the accessors.
pub struct TicketService {
    pool: DbPool,
    lookups: Arc<LookupCache>,
    permissions: Arc<PermissionService>,
    fields: Arc<FieldRegistry>,
    hub: Arc<NotificationHub>,
    mail: Arc<MailQueue>,
    tn_gen: TnGenerator,
    config: ServiceConfig,
}

impl TicketService {
    pub fn new(pool: DbPool, config: ServiceConfig) -> Self {
        Self {
            lookups: Arc::new(LookupCache::new(pool.clone())),
            permissions: Arc::new(PermissionService::new(pool.clone())),
            fields: Arc::new(FieldRegistry::new(pool.clone())),
            hub: Arc::new(NotificationHub::default()),
            mail: Arc::new(MailQueue::new(pool.clone())),
            tn_gen: TnGenerator::new(),
            config,
            pool,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn mail_queue(&self) -> &Arc<MailQueue> {
        &self.mail
    }

    pub fn lookups(&self) -> &Arc<LookupCache> {
        &self.lookups
    }

    pub fn permissions(&self) -> &Arc<PermissionService> {
        &self.permissions
    }

    pub fn dynamic_fields(&self) -> &Arc<FieldRegistry> {
        &self.fields
    }

    /// Admin operations sharing this service's caches.
    pub fn admin(&self) -> crate::admin::AdminOps {
        crate::admin::AdminOps::new(
            self.pool.clone(),
            Arc::clone(&self.lookups),
            Arc::clone(&self.permissions),
        )
    }

    // =========================================================================
    // CreateTicket
    // =========================================================================

    pub async fn create_ticket(
        &self,
        input: CreateTicketInput,
        by: Principal,
    ) -> Result<CreatedTicket> {
        validate_subject(&input.subject)?;
        if input.body.trim().is_empty() {
            return Err(Error::validation("body must not be empty"));
        }
        if let Some(email) = input.customer_email.as_deref() {
            validate_email(email)?;
        }

        let snapshot = self.lookups.snapshot().await?;
        let queue = snapshot.valid_queue(input.queue_id)?.clone();
        self.permissions
            .authorize_queue(by.user_id, &queue, QueueAction::CreateTicket)
            .await?;

        let state = snapshot.initial_state_for_queue(&queue)?.clone();
        let priority_id = match input.priority_id {
            Some(id) => {
                snapshot
                    .priority(id)
                    .ok_or(Error::not_found("ticket priority"))?;
                id
            }
            None => snapshot.default_priority()?.id,
        };
        if let Some(type_id) = input.type_id {
            snapshot
                .ticket_type(type_id)
                .ok_or(Error::not_found("ticket type"))?;
        }

        // Directory login wins; a bare address doubles as the customer key
        // for channels without a directory entry.
        let customer_email = self
            .resolve_input_email(input.customer_user_id.as_deref(), input.customer_email.as_deref())
            .await?;
        let customer_key = input
            .customer_user_id
            .clone()
            .or_else(|| input.customer_email.clone());
        let customer_company = match input.customer_user_id.as_deref() {
            Some(login) => db::get_customer_user(&self.pool, login)
                .await?
                .and_then(|c| c.customer_id),
            None => None,
        };

        let screen = ScreenName::for_create_channel(input.channel);
        let schema = self.fields.schema().await?;
        let prepared =
            schema.validate_for_screen(screen, ObjectType::Ticket, &input.dynamic_fields)?;

        let visible = input.channel.first_article_customer_visible();
        let sender_type = match input.channel {
            Channel::Email | Channel::Web | Channel::Api => SenderType::Customer,
            Channel::Phone | Channel::Note => SenderType::Agent,
        };

        // Allocate and insert; a duplicate tn aborts the transaction and
        // retries with a fresh number.
        let mut last_err = Error::internal("ticket number allocation failed");
        for attempt in 0..TN_RETRY_LIMIT {
            let tn = self.tn_gen.next();
            let mut txn = self.pool.begin().await?;

            let inserted = db::insert_ticket(
                &mut txn,
                &NewTicket {
                    tn: &tn,
                    title: input.subject.trim(),
                    queue_id: queue.id,
                    state_id: state.id,
                    priority_id,
                    type_id: input.type_id,
                    service_id: None,
                    sla_id: None,
                    owner_user_id: None,
                    responsible_user_id: None,
                    customer_user_id: customer_key.as_deref(),
                    customer_id: customer_company.as_deref(),
                    create_by: by.user_id,
                },
            )
            .await;

            let ticket = match inserted {
                Ok(ticket) => ticket,
                Err(e) => {
                    txn.rollback().await.ok();
                    let err: Error = e.into();
                    if matches!(err, Error::Conflict { .. }) && attempt + 1 < TN_RETRY_LIMIT {
                        debug!(tn, attempt, "Duplicate ticket number, retrying");
                        last_err = err;
                        continue;
                    }
                    return Err(err);
                }
            };

            let article = db::insert_article(
                &mut txn,
                &NewArticle {
                    ticket_id: ticket.id,
                    subject: Some(input.subject.trim()),
                    sender_type: sender_type.as_str(),
                    channel: input.channel.as_str(),
                    is_visible_for_customer: visible,
                    is_first_article: true,
                    create_by: by.user_id,
                },
            )
            .await?;
            db::insert_article_mime(
                &mut txn,
                article.id,
                customer_email.as_deref(),
                None,
                Some(input.subject.trim()),
                "text/plain; charset=utf-8",
                input.body.as_bytes(),
            )
            .await?;

            for attachment in &input.attachments {
                db::insert_attachment(
                    &mut txn,
                    article.id,
                    &attachment.filename,
                    &attachment.content_type,
                    &attachment.content,
                )
                .await?;
                history::record(
                    &mut txn,
                    ticket.id,
                    Some(article.id),
                    HistoryType::AttachmentAdded,
                    &messages::attachment_added(&attachment.filename),
                    by.user_id,
                )
                .await?;
            }

            dynamic_fields::write_values(&mut txn, ObjectType::Ticket, ticket.id, &prepared)
                .await?;

            history::record(
                &mut txn,
                ticket.id,
                Some(article.id),
                HistoryType::NewTicket,
                &messages::new_ticket(&queue.name),
                by.user_id,
            )
            .await?;

            txn.commit().await?;
            info!(ticket_id = ticket.id, tn = %ticket.tn, queue = %queue.name, "Ticket created");

            if visible {
                if let Some(recipient) = customer_email.as_deref() {
                    self.enqueue_customer_mail(
                        &ticket,
                        article.id,
                        recipient,
                        &input.subject,
                        &input.body,
                    )
                    .await;
                }
            }

            return Ok(CreatedTicket {
                ticket,
                article_id: article.id,
            });
        }
        Err(last_err)
    }

    // =========================================================================
    // AddArticle
    // =========================================================================

    pub async fn add_article(
        &self,
        ticket_id: i64,
        input: AddArticleInput,
        by: Principal,
    ) -> Result<Article> {
        if input.body.trim().is_empty() {
            return Err(Error::validation("body must not be empty"));
        }
        if let Some(minutes) = input.time_units {
            if minutes <= 0 {
                return Err(Error::validation("time units must be a positive minute count"));
            }
        } else if self.config.require_time_units && input.sender_type == SenderType::Agent {
            return Err(Error::validation("time units are required for agent notes"));
        }

        let snapshot = self.lookups.snapshot().await?;
        let schema = self.fields.schema().await?;
        let prepared = schema.validate_for_screen(
            ScreenName::AgentTicketNote,
            ObjectType::Article,
            &input.dynamic_fields,
        )?;

        let mut txn = self.pool.begin().await?;
        let ticket = db::lock_ticket(&mut txn, ticket_id)
            .await?
            .ok_or(Error::not_found("ticket"))?;
        let queue = snapshot.valid_queue(ticket.queue_id)?;
        self.permissions
            .authorize_queue(by.user_id, queue, QueueAction::AddNote)
            .await?;

        let article = db::insert_article(
            &mut txn,
            &NewArticle {
                ticket_id: ticket.id,
                subject: input.subject.as_deref(),
                sender_type: input.sender_type.as_str(),
                channel: input.channel.as_str(),
                is_visible_for_customer: input.visible_for_customer,
                is_first_article: false,
                create_by: by.user_id,
            },
        )
        .await?;
        db::insert_article_mime(
            &mut txn,
            article.id,
            None,
            None,
            input.subject.as_deref(),
            &input.content_type,
            input.body.as_bytes(),
        )
        .await?;

        for attachment in &input.attachments {
            db::insert_attachment(
                &mut txn,
                article.id,
                &attachment.filename,
                &attachment.content_type,
                &attachment.content,
            )
            .await?;
            history::record(
                &mut txn,
                ticket.id,
                Some(article.id),
                HistoryType::AttachmentAdded,
                &messages::attachment_added(&attachment.filename),
                by.user_id,
            )
            .await?;
        }

        dynamic_fields::write_values(&mut txn, ObjectType::Article, article.id, &prepared).await?;

        if let Some(minutes) = input.time_units {
            db::insert_time_accounting(&mut txn, ticket.id, Some(article.id), minutes, by.user_id)
                .await?;
            let total = db::total_time_units(&mut txn, ticket.id).await?;
            history::record(
                &mut txn,
                ticket.id,
                Some(article.id),
                HistoryType::TimeAccounting,
                &messages::time_accounting(minutes, total),
                by.user_id,
            )
            .await?;
        }

        history::record(
            &mut txn,
            ticket.id,
            Some(article.id),
            HistoryType::AddNote,
            &messages::add_note(&input.body),
            by.user_id,
        )
        .await?;
        db::touch_ticket(&mut txn, ticket.id, by.user_id).await?;
        txn.commit().await?;

        debug!(ticket_id, article_id = article.id, "Article added");

        if input.visible_for_customer {
            if let Some(recipient) = self.resolve_customer_email(&ticket).await {
                let subject = input
                    .subject
                    .clone()
                    .unwrap_or_else(|| ticket.title.clone());
                self.enqueue_customer_mail(&ticket, article.id, &recipient, &subject, &input.body)
                    .await;
            }
        }

        Ok(article)
    }

    // =========================================================================
    // SetState
    // =========================================================================

    pub async fn set_state(
        &self,
        ticket_id: i64,
        new_state_id: i64,
        pending_until: Option<DateTime<Utc>>,
        by: Principal,
    ) -> Result<()> {
        let snapshot = self.lookups.snapshot().await?;
        let new_state = snapshot
            .state(new_state_id)
            .ok_or(Error::not_found("ticket state"))?
            .clone();
        let new_type = snapshot.state_type_of(new_state_id)?;

        let until_time = if new_type.is_pending() {
            let until = pending_until.ok_or_else(|| {
                Error::precondition("a pending state requires a pending-until time")
            })?;
            if until <= Utc::now() {
                return Err(Error::precondition("pending-until must be in the future"));
            }
            until.timestamp()
        } else {
            0
        };

        let mut txn = self.pool.begin().await?;
        let ticket = db::lock_ticket(&mut txn, ticket_id)
            .await?
            .ok_or(Error::not_found("ticket"))?;
        let queue = snapshot.valid_queue(ticket.queue_id)?;
        self.permissions
            .authorize_queue(by.user_id, queue, QueueAction::OtherMutation)
            .await?;

        if ticket.state_id == new_state_id && ticket.until_time == until_time {
            txn.rollback().await.ok();
            return Ok(());
        }

        let old_state_name = snapshot
            .state(ticket.state_id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("state {}", ticket.state_id));

        db::update_ticket_state(&mut txn, ticket.id, new_state_id, until_time, by.user_id).await?;
        history::record(
            &mut txn,
            ticket.id,
            None,
            HistoryType::StateUpdate,
            &messages::state_update(&old_state_name, &new_state.name),
            by.user_id,
        )
        .await?;

        if ticket.until_time != until_time {
            let message = match pending_until {
                Some(until) if until_time > 0 => messages::pending_time_set(until),
                _ => messages::pending_time_cleared(),
            };
            history::record(
                &mut txn,
                ticket.id,
                None,
                HistoryType::SetPendingTime,
                &message,
                by.user_id,
            )
            .await?;
        }

        txn.commit().await?;
        info!(ticket_id, state = %new_state.name, "State changed");
        Ok(())
    }

    // =========================================================================
    // AssignOwner / UpdatePriority / MoveQueue
    // =========================================================================

    pub async fn assign_owner(&self, ticket_id: i64, user_id: i64, by: Principal) -> Result<()> {
        let owner = db::get_user(&self.pool, user_id)
            .await?
            .ok_or(Error::not_found("user"))?;
        if !owner.is_valid() {
            return Err(Error::precondition("cannot assign an invalid user as owner"));
        }

        let snapshot = self.lookups.snapshot().await?;
        let mut txn = self.pool.begin().await?;
        let ticket = db::lock_ticket(&mut txn, ticket_id)
            .await?
            .ok_or(Error::not_found("ticket"))?;
        let queue = snapshot.valid_queue(ticket.queue_id)?;
        self.permissions
            .authorize_queue(by.user_id, queue, QueueAction::ChangeOwner)
            .await?;

        db::update_ticket_owner(&mut txn, ticket.id, owner.id, owner.id, by.user_id).await?;
        history::record(
            &mut txn,
            ticket.id,
            None,
            HistoryType::OwnerUpdate,
            &messages::owner_update(&owner.login),
            by.user_id,
        )
        .await?;
        txn.commit().await?;

        info!(ticket_id, owner = %owner.login, "Owner assigned");
        Ok(())
    }

    pub async fn update_priority(
        &self,
        ticket_id: i64,
        priority_id: i64,
        by: Principal,
    ) -> Result<()> {
        let snapshot = self.lookups.snapshot().await?;
        let new_priority = snapshot
            .priority(priority_id)
            .ok_or(Error::not_found("ticket priority"))?
            .clone();

        let mut txn = self.pool.begin().await?;
        let ticket = db::lock_ticket(&mut txn, ticket_id)
            .await?
            .ok_or(Error::not_found("ticket"))?;
        let queue = snapshot.valid_queue(ticket.queue_id)?;
        self.permissions
            .authorize_queue(by.user_id, queue, QueueAction::ChangePriority)
            .await?;

        if ticket.priority_id == priority_id {
            txn.rollback().await.ok();
            return Ok(());
        }

        let old_name = snapshot
            .priority(ticket.priority_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| format!("priority {}", ticket.priority_id));

        db::update_ticket_priority(&mut txn, ticket.id, priority_id, by.user_id).await?;
        history::record(
            &mut txn,
            ticket.id,
            None,
            HistoryType::PriorityUpdate,
            &messages::priority_update(&old_name, &new_priority.name),
            by.user_id,
        )
        .await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn move_queue(&self, ticket_id: i64, queue_id: i64, by: Principal) -> Result<()> {
        let snapshot = self.lookups.snapshot().await?;
        let destination = snapshot.valid_queue(queue_id)?.clone();
        self.permissions
            .authorize_queue(by.user_id, &destination, QueueAction::MoveInto)
            .await?;

        let mut txn = self.pool.begin().await?;
        let ticket = db::lock_ticket(&mut txn, ticket_id)
            .await?
            .ok_or(Error::not_found("ticket"))?;

        if ticket.queue_id == destination.id {
            txn.rollback().await.ok();
            return Ok(());
        }

        let old_name = snapshot
            .queue(ticket.queue_id)
            .map(|q| q.name.clone())
            .unwrap_or_else(|| format!("queue {}", ticket.queue_id));

        db::update_ticket_queue(&mut txn, ticket.id, destination.id, by.user_id).await?;
        history::record(
            &mut txn,
            ticket.id,
            None,
            HistoryType::QueueMove,
            &messages::queue_move(&old_name, &destination.name),
            by.user_id,
        )
        .await?;
        txn.commit().await?;

        info!(ticket_id, queue = %destination.name, "Ticket moved");
        Ok(())
    }

    // =========================================================================
    // CloseTicket / ReopenTicket
    // =========================================================================

    pub async fn close_ticket(
        &self,
        ticket_id: i64,
        input: CloseTicketInput,
        by: Principal,
    ) -> Result<i64> {
        if input.note.trim().is_empty() {
            return Err(Error::validation("closing requires a note"));
        }
        if let Some(minutes) = input.time_units {
            if minutes <= 0 {
                return Err(Error::validation("time units must be a positive minute count"));
            }
        }

        let snapshot = self.lookups.snapshot().await?;
        let close_state = snapshot
            .state(input.state_id)
            .ok_or(Error::not_found("ticket state"))?
            .clone();
        if !snapshot.state_type_of(close_state.id)?.is_closed() {
            return Err(Error::precondition("close target must be a closed state"));
        }

        let schema = self.fields.schema().await?;
        let prepared = schema.validate_for_screen(
            ScreenName::AgentTicketClose,
            ObjectType::Ticket,
            &input.dynamic_fields,
        )?;

        let mut txn = self.pool.begin().await?;
        let ticket = db::lock_ticket(&mut txn, ticket_id)
            .await?
            .ok_or(Error::not_found("ticket"))?;
        let queue = snapshot.valid_queue(ticket.queue_id)?;
        self.permissions
            .authorize_queue(by.user_id, queue, QueueAction::OtherMutation)
            .await?;

        let article = db::insert_article(
            &mut txn,
            &NewArticle {
                ticket_id: ticket.id,
                subject: Some(&ticket.title),
                sender_type: SenderType::Agent.as_str(),
                channel: Channel::Note.as_str(),
                is_visible_for_customer: input.notify_customer,
                is_first_article: false,
                create_by: by.user_id,
            },
        )
        .await?;
        db::insert_article_mime(
            &mut txn,
            article.id,
            None,
            None,
            Some(&ticket.title),
            "text/plain; charset=utf-8",
            input.note.as_bytes(),
        )
        .await?;

        if let Some(minutes) = input.time_units {
            db::insert_time_accounting(&mut txn, ticket.id, Some(article.id), minutes, by.user_id)
                .await?;
            let total = db::total_time_units(&mut txn, ticket.id).await?;
            history::record(
                &mut txn,
                ticket.id,
                Some(article.id),
                HistoryType::TimeAccounting,
                &messages::time_accounting(minutes, total),
                by.user_id,
            )
            .await?;
        }

        dynamic_fields::write_values(&mut txn, ObjectType::Ticket, ticket.id, &prepared).await?;

        let old_state_name = snapshot
            .state(ticket.state_id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("state {}", ticket.state_id));

        db::update_ticket_state(&mut txn, ticket.id, close_state.id, 0, by.user_id).await?;
        history::record(
            &mut txn,
            ticket.id,
            None,
            HistoryType::StateUpdate,
            &messages::state_update(&old_state_name, &close_state.name),
            by.user_id,
        )
        .await?;
        if ticket.until_time != 0 {
            history::record(
                &mut txn,
                ticket.id,
                None,
                HistoryType::SetPendingTime,
                &messages::pending_time_cleared(),
                by.user_id,
            )
            .await?;
        }
        history::record(
            &mut txn,
            ticket.id,
            Some(article.id),
            HistoryType::AddNote,
            &messages::add_note(&input.note),
            by.user_id,
        )
        .await?;

        txn.commit().await?;
        info!(ticket_id, state = %close_state.name, "Ticket closed");

        if input.notify_customer {
            if let Some(recipient) = self.resolve_customer_email(&ticket).await {
                self.enqueue_customer_mail(&ticket, article.id, &recipient, &ticket.title, &input.note)
                    .await;
            }
        }

        Ok(article.id)
    }

    pub async fn reopen_ticket(
        &self,
        ticket_id: i64,
        to_state_id: Option<i64>,
        reason: &str,
        by: Principal,
    ) -> Result<()> {
        if reason.trim().is_empty() {
            return Err(Error::validation("reopening requires a reason"));
        }

        let snapshot = self.lookups.snapshot().await?;
        let target = match to_state_id {
            Some(id) => snapshot
                .state(id)
                .ok_or(Error::not_found("ticket state"))?
                .clone(),
            None => snapshot.default_open_state()?.clone(),
        };
        if snapshot.state_type_of(target.id)?.is_closed() {
            return Err(Error::precondition("reopen target must not be a closed state"));
        }

        let mut txn = self.pool.begin().await?;
        let ticket = db::lock_ticket(&mut txn, ticket_id)
            .await?
            .ok_or(Error::not_found("ticket"))?;
        let queue = snapshot.valid_queue(ticket.queue_id)?;
        self.permissions
            .authorize_queue(by.user_id, queue, QueueAction::OtherMutation)
            .await?;

        let current_type = snapshot.state_type_of(ticket.state_id)?;
        if !current_type.is_closed() {
            txn.rollback().await.ok();
            return Err(Error::precondition("only closed tickets can be reopened"));
        }

        let article = db::insert_article(
            &mut txn,
            &NewArticle {
                ticket_id: ticket.id,
                subject: Some(&ticket.title),
                sender_type: SenderType::System.as_str(),
                channel: Channel::Note.as_str(),
                is_visible_for_customer: false,
                is_first_article: false,
                create_by: by.user_id,
            },
        )
        .await?;
        db::insert_article_mime(
            &mut txn,
            article.id,
            None,
            None,
            Some(&ticket.title),
            "text/plain; charset=utf-8",
            reason.as_bytes(),
        )
        .await?;

        let old_state_name = snapshot
            .state(ticket.state_id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("state {}", ticket.state_id));

        db::update_ticket_state(&mut txn, ticket.id, target.id, 0, by.user_id).await?;
        history::record(
            &mut txn,
            ticket.id,
            None,
            HistoryType::StateUpdate,
            &messages::state_update(&old_state_name, &target.name),
            by.user_id,
        )
        .await?;
        history::record(
            &mut txn,
            ticket.id,
            Some(article.id),
            HistoryType::Reopened,
            &messages::reopened(reason),
            by.user_id,
        )
        .await?;
        txn.commit().await?;

        info!(ticket_id, state = %target.name, "Ticket reopened");
        Ok(())
    }

    // =========================================================================
    // MergeTickets
    // =========================================================================

    /// Merge each source into the target. Sources are processed in
    /// ascending id order, one transaction per source; within a
    /// transaction, the lower-id ticket of (source, target) is locked
    /// first. An already-merged source is skipped without history.
    pub async fn merge_tickets(
        &self,
        source_ids: &[i64],
        target_id: i64,
        by: Principal,
    ) -> Result<()> {
        let snapshot = self.lookups.snapshot().await?;
        let merged_state = snapshot.merged_state()?.clone();

        let target = db::get_ticket(&self.pool, target_id)
            .await?
            .ok_or(Error::not_found("target ticket"))?;
        let target_queue = snapshot.valid_queue(target.queue_id)?;
        self.permissions
            .authorize_queue(by.user_id, target_queue, QueueAction::OtherMutation)
            .await?;

        for source_id in sorted_sources(source_ids, target_id) {
            let mut txn = self.pool.begin().await?;

            // Deadlock avoidance: lock both rows in ascending id order.
            let (source, target) = if source_id < target_id {
                let source = db::lock_ticket(&mut txn, source_id).await?;
                let target = db::lock_ticket(&mut txn, target_id).await?;
                (source, target)
            } else {
                let target = db::lock_ticket(&mut txn, target_id).await?;
                let source = db::lock_ticket(&mut txn, source_id).await?;
                (source, target)
            };
            let source = source.ok_or(Error::not_found("source ticket"))?;
            let target = target.ok_or(Error::not_found("target ticket"))?;

            let source_queue = snapshot.valid_queue(source.queue_id)?;
            self.permissions
                .authorize_queue(by.user_id, source_queue, QueueAction::OtherMutation)
                .await?;

            // Merging an already-merged source is a no-op.
            if snapshot.state_type_of(source.state_id)? == StateType::Merged {
                txn.rollback().await.ok();
                debug!(source_id, "Source already merged, skipping");
                continue;
            }

            let source_note = messages::merged_into(&target.tn);
            let source_article = db::insert_article(
                &mut txn,
                &NewArticle {
                    ticket_id: source.id,
                    subject: Some(&source.title),
                    sender_type: SenderType::System.as_str(),
                    channel: Channel::Note.as_str(),
                    is_visible_for_customer: true,
                    is_first_article: false,
                    create_by: by.user_id,
                },
            )
            .await?;
            db::insert_article_mime(
                &mut txn,
                source_article.id,
                None,
                None,
                Some(&source.title),
                "text/plain; charset=utf-8",
                source_note.as_bytes(),
            )
            .await?;

            let target_note = messages::merged_from(&source.tn);
            let target_article = db::insert_article(
                &mut txn,
                &NewArticle {
                    ticket_id: target.id,
                    subject: Some(&target.title),
                    sender_type: SenderType::System.as_str(),
                    channel: Channel::Note.as_str(),
                    is_visible_for_customer: false,
                    is_first_article: false,
                    create_by: by.user_id,
                },
            )
            .await?;
            db::insert_article_mime(
                &mut txn,
                target_article.id,
                None,
                None,
                Some(&target.title),
                "text/plain; charset=utf-8",
                target_note.as_bytes(),
            )
            .await?;

            let old_state_name = snapshot
                .state(source.state_id)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| format!("state {}", source.state_id));

            db::update_ticket_state(&mut txn, source.id, merged_state.id, 0, by.user_id).await?;
            history::record(
                &mut txn,
                source.id,
                None,
                HistoryType::StateUpdate,
                &messages::state_update(&old_state_name, &merged_state.name),
                by.user_id,
            )
            .await?;
            history::record(
                &mut txn,
                source.id,
                Some(source_article.id),
                HistoryType::Merged,
                &source_note,
                by.user_id,
            )
            .await?;
            history::record(
                &mut txn,
                target.id,
                Some(target_article.id),
                HistoryType::Merged,
                &target_note,
                by.user_id,
            )
            .await?;
            db::touch_ticket(&mut txn, target.id, by.user_id).await?;

            txn.commit().await?;
            info!(source_id, target_id, "Ticket merged");
        }
        Ok(())
    }

    // =========================================================================
    // AddTime / SetDynamicField
    // =========================================================================

    pub async fn add_time(
        &self,
        ticket_id: i64,
        article_id: Option<i64>,
        minutes: i32,
        by: Principal,
    ) -> Result<()> {
        if minutes <= 0 {
            return Err(Error::validation("time units must be a positive minute count"));
        }

        let snapshot = self.lookups.snapshot().await?;
        let mut txn = self.pool.begin().await?;
        let ticket = db::lock_ticket(&mut txn, ticket_id)
            .await?
            .ok_or(Error::not_found("ticket"))?;
        let queue = snapshot.valid_queue(ticket.queue_id)?;
        self.permissions
            .authorize_queue(by.user_id, queue, QueueAction::OtherMutation)
            .await?;

        db::insert_time_accounting(&mut txn, ticket.id, article_id, minutes, by.user_id).await?;
        let total = db::total_time_units(&mut txn, ticket.id).await?;
        history::record(
            &mut txn,
            ticket.id,
            article_id,
            HistoryType::TimeAccounting,
            &messages::time_accounting(minutes, total),
            by.user_id,
        )
        .await?;
        db::touch_ticket(&mut txn, ticket.id, by.user_id).await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn set_dynamic_fields(
        &self,
        ticket_id: i64,
        screen: ScreenName,
        values: HashMap<String, FieldValue>,
        by: Principal,
    ) -> Result<()> {
        let schema = self.fields.schema().await?;
        let prepared = schema.validate_for_screen(screen, ObjectType::Ticket, &values)?;

        let snapshot = self.lookups.snapshot().await?;
        let mut txn = self.pool.begin().await?;
        let ticket = db::lock_ticket(&mut txn, ticket_id)
            .await?
            .ok_or(Error::not_found("ticket"))?;
        let queue = snapshot.valid_queue(ticket.queue_id)?;
        self.permissions
            .authorize_queue(by.user_id, queue, QueueAction::OtherMutation)
            .await?;

        dynamic_fields::write_values(&mut txn, ObjectType::Ticket, ticket.id, &prepared).await?;
        for value in &prepared {
            let field_name = schema
                .field(value.field_id)
                .map(|f| f.name.clone())
                .unwrap_or_else(|| format!("field {}", value.field_id));
            history::record(
                &mut txn,
                ticket.id,
                None,
                HistoryType::DynamicFieldSet,
                &messages::dynamic_field_set(&field_name),
                by.user_id,
            )
            .await?;
        }
        db::touch_ticket(&mut txn, ticket.id, by.user_id).await?;
        txn.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Read surface
    // =========================================================================

    /// Ticket + articles + history in three queries. Readable with `ro` on
    /// the ticket's queue; the ticket owner may always read their own,
    /// which also covers otherwise-invalid users.
    pub async fn get_ticket(&self, ticket_id: i64, by: Principal) -> Result<TicketView> {
        let ticket = db::get_ticket(&self.pool, ticket_id)
            .await?
            .ok_or(Error::not_found("ticket"))?;

        if ticket.owner_user_id != Some(by.user_id) {
            let snapshot = self.lookups.snapshot().await?;
            let queue = snapshot
                .queue(ticket.queue_id)
                .ok_or(Error::not_found("queue"))?;
            self.permissions
                .authorize_queue(by.user_id, queue, QueueAction::ReadTicket)
                .await?;
        }

        let articles = db::list_articles(&self.pool, ticket.id).await?;
        let history = db::list_history(&self.pool, ticket.id).await?;
        Ok(TicketView {
            ticket,
            articles,
            history,
        })
    }

    /// Customer-facing lookup by ticket number.
    pub async fn get_ticket_by_tn(&self, tn: &str, by: Principal) -> Result<TicketView> {
        let ticket = db::get_ticket_by_tn(&self.pool, tn)
            .await?
            .ok_or(Error::not_found("ticket"))?;
        self.get_ticket(ticket.id, by).await
    }

    /// Typed dynamic-field values of a ticket, keyed by field name.
    pub async fn dynamic_field_values(
        &self,
        ticket_id: i64,
        by: Principal,
    ) -> Result<HashMap<String, FieldValue>> {
        // Reuses the read authorization of get_ticket.
        let view = self.get_ticket(ticket_id, by).await?;
        let schema = self.fields.schema().await?;
        let rows = db::list_dynamic_field_values(
            &self.pool,
            ObjectType::Ticket.as_str(),
            view.ticket.id,
        )
        .await?;
        Ok(schema.decode_values(&rows))
    }

    /// Queue listing, visible only with `ro` on the queue. Denial hides the
    /// listing; it never moves tickets anywhere.
    pub async fn list_queue_tickets(
        &self,
        queue_id: i64,
        limit: i64,
        offset: i64,
        by: Principal,
    ) -> Result<Vec<Ticket>> {
        let snapshot = self.lookups.snapshot().await?;
        let queue = snapshot.queue(queue_id).ok_or(Error::not_found("queue"))?;
        self.permissions
            .authorize_queue(by.user_id, queue, QueueAction::ReadTicket)
            .await?;
        Ok(db::list_queue_tickets(&self.pool, queue_id, limit, offset).await?)
    }

    // =========================================================================
    // Scheduler entry point
    // =========================================================================

    /// Auto-close one due ticket on behalf of the scheduler. Re-checks the
    /// pending condition under the row lock and no-ops when it no longer
    /// holds, so redelivery is harmless.
    pub async fn auto_close_due(&self, ticket_id: i64) -> Result<bool> {
        let snapshot = self.lookups.snapshot().await?;
        let system = Principal::system();

        let mut txn = self.pool.begin().await?;
        let Some(ticket) = db::lock_ticket(&mut txn, ticket_id).await? else {
            txn.rollback().await.ok();
            return Ok(false);
        };

        let state_type = snapshot.state_type_of(ticket.state_id)?;
        let now = Utc::now().timestamp();
        if !state_type.is_pending_auto() || ticket.until_time == 0 || ticket.until_time > now {
            txn.rollback().await.ok();
            return Ok(false);
        }

        let target = snapshot.auto_close_target(state_type)?.clone();
        let old_state_name = snapshot
            .state(ticket.state_id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("state {}", ticket.state_id));

        db::update_ticket_state(&mut txn, ticket.id, target.id, 0, system.user_id).await?;
        history::record(
            &mut txn,
            ticket.id,
            None,
            HistoryType::StateUpdate,
            &messages::state_update(&old_state_name, &target.name),
            system.user_id,
        )
        .await?;
        history::record(
            &mut txn,
            ticket.id,
            None,
            HistoryType::SetPendingTime,
            &messages::pending_time_cleared(),
            system.user_id,
        )
        .await?;
        txn.commit().await?;

        info!(ticket_id, state = %target.name, "Ticket auto-closed");
        Ok(true)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn resolve_input_email(
        &self,
        login: Option<&str>,
        raw_email: Option<&str>,
    ) -> Result<Option<String>> {
        if let Some(login) = login {
            if let Some(customer) = db::get_customer_user(&self.pool, login).await? {
                return Ok(Some(customer.email));
            }
            return Err(Error::not_found("customer user"));
        }
        Ok(raw_email.map(str::to_string))
    }

    /// Notification address for an existing ticket: the directory entry's
    /// address when the customer key is a login, the key itself when it is
    /// a bare address.
    async fn resolve_customer_email(&self, ticket: &Ticket) -> Option<String> {
        let key = ticket.customer_user_id.as_deref()?;
        match db::get_customer_user(&self.pool, key).await {
            Ok(Some(customer)) => Some(customer.email),
            Ok(None) if key.contains('@') => Some(key.to_string()),
            Ok(None) => None,
            Err(e) => {
                warn!(ticket_id = ticket.id, error = %e, "Customer lookup failed");
                None
            }
        }
    }

    /// Post-commit mail enqueue. Best-effort: failures log and count, the
    /// ticket write stands.
    async fn enqueue_customer_mail(
        &self,
        ticket: &Ticket,
        article_id: i64,
        recipient: &str,
        subject: &str,
        body: &str,
    ) {
        let result = async {
            let snapshot = self.lookups.snapshot().await?;
            let queue = snapshot
                .queue(ticket.queue_id)
                .ok_or(Error::not_found("queue"))?;
            let sender = snapshot.sender_address_for_queue(queue)?;
            let full_subject = format!("[Ticket#{}] {}", ticket.tn, subject);
            let raw = mailq::compose_message(&sender.mailbox(), recipient, &full_subject, body)?;
            self.mail
                .insert(Some(article_id), &sender.email, recipient, &raw)
                .await
                .map_err(Error::from)
        }
        .await;

        if let Err(e) = result {
            metrics::counter!("mail_enqueue_failures_total", 1);
            warn!(
                ticket_id = ticket.id,
                article_id,
                error = %e,
                "Customer notification could not be enqueued"
            );
        }
    }
}

fn validate_subject(subject: &str) -> Result<()> {
    let trimmed = subject.trim();
    if trimmed.is_empty() {
        return Err(Error::validation("subject must not be empty"));
    }
    if trimmed.chars().count() > SUBJECT_MAX {
        return Err(Error::validation("subject must be at most 200 characters"));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<()> {
    email
        .parse::<lettre::Address>()
        .map(|_| ())
        .map_err(|_| Error::validation("invalid customer email address"))
}

/// Deduplicated sources in ascending id order, excluding the target itself.
fn sorted_sources(source_ids: &[i64], target_id: i64) -> Vec<i64> {
    let mut sources: Vec<i64> = source_ids
        .iter()
        .copied()
        .filter(|id| *id != target_id)
        .collect();
    sources.sort_unstable();
    sources.dedup();
    sources
}
