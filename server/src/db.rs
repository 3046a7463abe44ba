use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use std::time::Duration;

use crate::models::{
    Article, ArticleAttachment, ArticleDataMime, CustomerCompany, CustomerUser, DynamicField,
    DynamicFieldValue, Group, GroupUser, Queue, ScreenConfigRow, Service, Sla, SystemAddress,
    Ticket, TicketHistory, TicketPriority, TicketState, TicketType, TimeAccounting, User,
};

pub type DbPool = PgPool;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/ticketd".to_string()),
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Initialize database connection pool with configuration
pub async fn init_db(config: DbConfig) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    Ok(pool)
}

/// Initialize database with default configuration
pub async fn init_db_default() -> Result<DbPool> {
    init_db(DbConfig::default()).await
}

// =============================================================================
// User & Group Operations
// =============================================================================

pub async fn get_user(pool: &DbPool, user_id: i64) -> sqlx::Result<Option<User>> {
    sqlx::query_as::<_, User>(
        "SELECT id, login, first_name, last_name, valid_id, create_time, change_time \
         FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn get_group_by_name(pool: &DbPool, name: &str) -> sqlx::Result<Option<Group>> {
    sqlx::query_as::<_, Group>(
        "SELECT id, name, comments, valid_id, create_time, change_time \
         FROM groups WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await
}

/// All permission grants for a user, including zero-valued revocations.
pub async fn list_group_grants(pool: &DbPool, user_id: i64) -> sqlx::Result<Vec<GroupUser>> {
    sqlx::query_as::<_, GroupUser>(
        "SELECT gu.user_id, gu.group_id, gu.permission_key, gu.permission_value \
         FROM group_user gu \
         INNER JOIN groups g ON g.id = gu.group_id \
         WHERE gu.user_id = $1 AND g.valid_id = 1",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

/// Upsert one (user, group, key) grant. Callers must invalidate the
/// permission cache afterwards.
pub async fn upsert_group_permission(
    pool: &DbPool,
    user_id: i64,
    group_id: i64,
    permission_key: &str,
    permission_value: i16,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO group_user (user_id, group_id, permission_key, permission_value) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (user_id, group_id, permission_key) \
         DO UPDATE SET permission_value = $4",
    )
    .bind(user_id)
    .bind(group_id)
    .bind(permission_key)
    .bind(permission_value)
    .execute(pool)
    .await?;
    Ok(())
}

// =============================================================================
// Lookup Operations (cached by lookups::LookupCache)
// =============================================================================

pub async fn list_queues(pool: &DbPool) -> sqlx::Result<Vec<Queue>> {
    sqlx::query_as::<_, Queue>(
        "SELECT id, name, group_id, system_address_id, default_state_id, comments, valid_id \
         FROM queue",
    )
    .fetch_all(pool)
    .await
}

pub async fn list_states(pool: &DbPool) -> sqlx::Result<Vec<TicketState>> {
    sqlx::query_as::<_, TicketState>(
        "SELECT s.id, s.name, s.type_id, t.name AS type_name, s.valid_id \
         FROM ticket_state s \
         INNER JOIN ticket_state_type t ON t.id = s.type_id",
    )
    .fetch_all(pool)
    .await
}

pub async fn list_priorities(pool: &DbPool) -> sqlx::Result<Vec<TicketPriority>> {
    sqlx::query_as::<_, TicketPriority>(
        "SELECT id, name, valid_id FROM ticket_priority ORDER BY id",
    )
    .fetch_all(pool)
    .await
}

pub async fn list_ticket_types(pool: &DbPool) -> sqlx::Result<Vec<TicketType>> {
    sqlx::query_as::<_, TicketType>("SELECT id, name, valid_id FROM ticket_type")
        .fetch_all(pool)
        .await
}

pub async fn list_services(pool: &DbPool) -> sqlx::Result<Vec<Service>> {
    sqlx::query_as::<_, Service>("SELECT id, name, valid_id FROM service")
        .fetch_all(pool)
        .await
}

pub async fn list_slas(pool: &DbPool) -> sqlx::Result<Vec<Sla>> {
    sqlx::query_as::<_, Sla>("SELECT id, name, valid_id FROM sla")
        .fetch_all(pool)
        .await
}

pub async fn list_system_addresses(pool: &DbPool) -> sqlx::Result<Vec<SystemAddress>> {
    sqlx::query_as::<_, SystemAddress>(
        "SELECT id, email, display_name, valid_id FROM system_address",
    )
    .fetch_all(pool)
    .await
}

// =============================================================================
// Customer Directory Operations (read-only from the lifecycle engine)
// =============================================================================

pub async fn get_customer_user(pool: &DbPool, login: &str) -> sqlx::Result<Option<CustomerUser>> {
    sqlx::query_as::<_, CustomerUser>(
        "SELECT login, email, first_name, last_name, customer_id, valid_id \
         FROM customer_user WHERE login = $1",
    )
    .bind(login)
    .fetch_optional(pool)
    .await
}

pub async fn get_customer_company(
    pool: &DbPool,
    customer_id: &str,
) -> sqlx::Result<Option<CustomerCompany>> {
    sqlx::query_as::<_, CustomerCompany>(
        "SELECT customer_id, name, valid_id FROM customer_company WHERE customer_id = $1",
    )
    .bind(customer_id)
    .fetch_optional(pool)
    .await
}

// =============================================================================
// Ticket Operations
// =============================================================================

/// Parameters for the ticket insert; audit columns are filled here.
#[derive(Debug, Clone)]
pub struct NewTicket<'a> {
    pub tn: &'a str,
    pub title: &'a str,
    pub queue_id: i64,
    pub state_id: i64,
    pub priority_id: i64,
    pub type_id: Option<i64>,
    pub service_id: Option<i64>,
    pub sla_id: Option<i64>,
    pub owner_user_id: Option<i64>,
    pub responsible_user_id: Option<i64>,
    pub customer_user_id: Option<&'a str>,
    pub customer_id: Option<&'a str>,
    pub create_by: i64,
}

pub async fn insert_ticket(
    txn: &mut Transaction<'_, Postgres>,
    params: &NewTicket<'_>,
) -> sqlx::Result<Ticket> {
    let now = Utc::now();
    sqlx::query_as::<_, Ticket>(
        "INSERT INTO ticket \
           (tn, title, queue_id, state_id, priority_id, type_id, service_id, sla_id, \
            owner_user_id, responsible_user_id, customer_user_id, customer_id, \
            until_time, archive_flag, create_time, create_by, change_time, change_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 0, FALSE, $13, $14, $13, $14) \
         RETURNING id, tn, title, queue_id, state_id, priority_id, type_id, service_id, sla_id, \
                   owner_user_id, responsible_user_id, customer_user_id, customer_id, \
                   until_time, archive_flag, create_time, create_by, change_time, change_by",
    )
    .bind(params.tn)
    .bind(params.title)
    .bind(params.queue_id)
    .bind(params.state_id)
    .bind(params.priority_id)
    .bind(params.type_id)
    .bind(params.service_id)
    .bind(params.sla_id)
    .bind(params.owner_user_id)
    .bind(params.responsible_user_id)
    .bind(params.customer_user_id)
    .bind(params.customer_id)
    .bind(now)
    .bind(params.create_by)
    .fetch_one(&mut **txn)
    .await
}

pub async fn get_ticket(pool: &DbPool, ticket_id: i64) -> sqlx::Result<Option<Ticket>> {
    sqlx::query_as::<_, Ticket>(
        "SELECT id, tn, title, queue_id, state_id, priority_id, type_id, service_id, sla_id, \
                owner_user_id, responsible_user_id, customer_user_id, customer_id, \
                until_time, archive_flag, create_time, create_by, change_time, change_by \
         FROM ticket WHERE id = $1",
    )
    .bind(ticket_id)
    .fetch_optional(pool)
    .await
}

pub async fn get_ticket_by_tn(pool: &DbPool, tn: &str) -> sqlx::Result<Option<Ticket>> {
    sqlx::query_as::<_, Ticket>(
        "SELECT id, tn, title, queue_id, state_id, priority_id, type_id, service_id, sla_id, \
                owner_user_id, responsible_user_id, customer_user_id, customer_id, \
                until_time, archive_flag, create_time, create_by, change_time, change_by \
         FROM ticket WHERE tn = $1",
    )
    .bind(tn)
    .fetch_optional(pool)
    .await
}

/// Lock the ticket row for the duration of the caller's transaction.
/// Serializes concurrent state transitions on the same ticket.
pub async fn lock_ticket(
    txn: &mut Transaction<'_, Postgres>,
    ticket_id: i64,
) -> sqlx::Result<Option<Ticket>> {
    sqlx::query_as::<_, Ticket>(
        "SELECT id, tn, title, queue_id, state_id, priority_id, type_id, service_id, sla_id, \
                owner_user_id, responsible_user_id, customer_user_id, customer_id, \
                until_time, archive_flag, create_time, create_by, change_time, change_by \
         FROM ticket WHERE id = $1 FOR UPDATE",
    )
    .bind(ticket_id)
    .fetch_optional(&mut **txn)
    .await
}

pub async fn update_ticket_state(
    txn: &mut Transaction<'_, Postgres>,
    ticket_id: i64,
    state_id: i64,
    until_time: i64,
    change_by: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE ticket SET state_id = $2, until_time = $3, change_time = $4, change_by = $5 \
         WHERE id = $1",
    )
    .bind(ticket_id)
    .bind(state_id)
    .bind(until_time)
    .bind(Utc::now())
    .bind(change_by)
    .execute(&mut **txn)
    .await?;
    Ok(())
}

pub async fn update_ticket_owner(
    txn: &mut Transaction<'_, Postgres>,
    ticket_id: i64,
    owner_user_id: i64,
    responsible_user_id: i64,
    change_by: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE ticket SET owner_user_id = $2, responsible_user_id = $3, \
                change_time = $4, change_by = $5 \
         WHERE id = $1",
    )
    .bind(ticket_id)
    .bind(owner_user_id)
    .bind(responsible_user_id)
    .bind(Utc::now())
    .bind(change_by)
    .execute(&mut **txn)
    .await?;
    Ok(())
}

pub async fn update_ticket_priority(
    txn: &mut Transaction<'_, Postgres>,
    ticket_id: i64,
    priority_id: i64,
    change_by: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE ticket SET priority_id = $2, change_time = $3, change_by = $4 WHERE id = $1",
    )
    .bind(ticket_id)
    .bind(priority_id)
    .bind(Utc::now())
    .bind(change_by)
    .execute(&mut **txn)
    .await?;
    Ok(())
}

pub async fn update_ticket_queue(
    txn: &mut Transaction<'_, Postgres>,
    ticket_id: i64,
    queue_id: i64,
    change_by: i64,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE ticket SET queue_id = $2, change_time = $3, change_by = $4 WHERE id = $1")
        .bind(ticket_id)
        .bind(queue_id)
        .bind(Utc::now())
        .bind(change_by)
        .execute(&mut **txn)
        .await?;
    Ok(())
}

/// Bump the change audit columns without touching anything else. Used by
/// paths that append dependent rows (articles, time accounting).
pub async fn touch_ticket(
    txn: &mut Transaction<'_, Postgres>,
    ticket_id: i64,
    change_by: i64,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE ticket SET change_time = $2, change_by = $3 WHERE id = $1")
        .bind(ticket_id)
        .bind(Utc::now())
        .bind(change_by)
        .execute(&mut **txn)
        .await?;
    Ok(())
}

/// Tickets of one queue, newest first, excluding archived rows.
pub async fn list_queue_tickets(
    pool: &DbPool,
    queue_id: i64,
    limit: i64,
    offset: i64,
) -> sqlx::Result<Vec<Ticket>> {
    sqlx::query_as::<_, Ticket>(
        "SELECT id, tn, title, queue_id, state_id, priority_id, type_id, service_id, sla_id, \
                owner_user_id, responsible_user_id, customer_user_id, customer_id, \
                until_time, archive_flag, create_time, create_by, change_time, change_by \
         FROM ticket \
         WHERE queue_id = $1 AND archive_flag = FALSE \
         ORDER BY create_time DESC \
         LIMIT $2 OFFSET $3",
    )
    .bind(queue_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

/// Tickets whose pending time has elapsed, oldest due first. The scheduler
/// classifies them by state type and re-checks under the row lock.
pub async fn list_due_pending_tickets(
    pool: &DbPool,
    now_epoch: i64,
    limit: i64,
) -> sqlx::Result<Vec<Ticket>> {
    sqlx::query_as::<_, Ticket>(
        "SELECT id, tn, title, queue_id, state_id, priority_id, type_id, service_id, sla_id, \
                owner_user_id, responsible_user_id, customer_user_id, customer_id, \
                until_time, archive_flag, create_time, create_by, change_time, change_by \
         FROM ticket \
         WHERE until_time > 0 AND until_time <= $1 \
         ORDER BY until_time ASC \
         LIMIT $2",
    )
    .bind(now_epoch)
    .bind(limit)
    .fetch_all(pool)
    .await
}

// =============================================================================
// Article Operations
// =============================================================================

#[derive(Debug, Clone)]
pub struct NewArticle<'a> {
    pub ticket_id: i64,
    pub subject: Option<&'a str>,
    pub sender_type: &'a str,
    pub channel: &'a str,
    pub is_visible_for_customer: bool,
    pub is_first_article: bool,
    pub create_by: i64,
}

pub async fn insert_article(
    txn: &mut Transaction<'_, Postgres>,
    params: &NewArticle<'_>,
) -> sqlx::Result<Article> {
    let now = Utc::now();
    sqlx::query_as::<_, Article>(
        "INSERT INTO article \
           (ticket_id, subject, sender_type, channel, is_visible_for_customer, \
            is_first_article, create_time, create_by, change_time, change_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $7, $8) \
         RETURNING id, ticket_id, subject, sender_type, channel, is_visible_for_customer, \
                   is_first_article, create_time, create_by, change_time, change_by",
    )
    .bind(params.ticket_id)
    .bind(params.subject)
    .bind(params.sender_type)
    .bind(params.channel)
    .bind(params.is_visible_for_customer)
    .bind(params.is_first_article)
    .bind(now)
    .bind(params.create_by)
    .fetch_one(&mut **txn)
    .await
}

pub async fn insert_article_mime(
    txn: &mut Transaction<'_, Postgres>,
    article_id: i64,
    a_from: Option<&str>,
    a_to: Option<&str>,
    a_subject: Option<&str>,
    content_type: &str,
    body: &[u8],
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO article_data_mime (article_id, a_from, a_to, a_subject, content_type, body) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(article_id)
    .bind(a_from)
    .bind(a_to)
    .bind(a_subject)
    .bind(content_type)
    .bind(body)
    .execute(&mut **txn)
    .await?;
    Ok(())
}

pub async fn insert_attachment(
    txn: &mut Transaction<'_, Postgres>,
    article_id: i64,
    filename: &str,
    content_type: &str,
    content: &[u8],
) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO article_attachment (article_id, filename, content_type, content, size) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING id",
    )
    .bind(article_id)
    .bind(filename)
    .bind(content_type)
    .bind(content)
    .bind(content.len() as i64)
    .fetch_one(&mut **txn)
    .await
}

pub async fn list_articles(pool: &DbPool, ticket_id: i64) -> sqlx::Result<Vec<Article>> {
    sqlx::query_as::<_, Article>(
        "SELECT id, ticket_id, subject, sender_type, channel, is_visible_for_customer, \
                is_first_article, create_time, create_by, change_time, change_by \
         FROM article WHERE ticket_id = $1 ORDER BY create_time, id",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
}

pub async fn get_article_mime(
    pool: &DbPool,
    article_id: i64,
) -> sqlx::Result<Option<ArticleDataMime>> {
    sqlx::query_as::<_, ArticleDataMime>(
        "SELECT article_id, a_from, a_to, a_subject, content_type, body \
         FROM article_data_mime WHERE article_id = $1",
    )
    .bind(article_id)
    .fetch_optional(pool)
    .await
}

pub async fn list_attachments(
    pool: &DbPool,
    article_id: i64,
) -> sqlx::Result<Vec<ArticleAttachment>> {
    sqlx::query_as::<_, ArticleAttachment>(
        "SELECT id, article_id, filename, content_type, content, size \
         FROM article_attachment WHERE article_id = $1 ORDER BY id",
    )
    .bind(article_id)
    .fetch_all(pool)
    .await
}

// =============================================================================
// History Operations (writes go through history::Recorder)
// =============================================================================

pub async fn insert_history(
    txn: &mut Transaction<'_, Postgres>,
    ticket_id: i64,
    article_id: Option<i64>,
    history_type: &str,
    name: &str,
    create_by: i64,
) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO ticket_history (ticket_id, article_id, history_type, name, create_time, create_by) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING id",
    )
    .bind(ticket_id)
    .bind(article_id)
    .bind(history_type)
    .bind(name)
    .bind(Utc::now())
    .bind(create_by)
    .fetch_one(&mut **txn)
    .await
}

pub async fn list_history(pool: &DbPool, ticket_id: i64) -> sqlx::Result<Vec<TicketHistory>> {
    sqlx::query_as::<_, TicketHistory>(
        "SELECT id, ticket_id, article_id, history_type, name, create_time, create_by \
         FROM ticket_history WHERE ticket_id = $1 ORDER BY create_time, id",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
}

// =============================================================================
// Time Accounting Operations
// =============================================================================

pub async fn insert_time_accounting(
    txn: &mut Transaction<'_, Postgres>,
    ticket_id: i64,
    article_id: Option<i64>,
    time_unit: i32,
    create_by: i64,
) -> sqlx::Result<TimeAccounting> {
    sqlx::query_as::<_, TimeAccounting>(
        "INSERT INTO time_accounting (ticket_id, article_id, time_unit, create_time, create_by) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING id, ticket_id, article_id, time_unit, create_time, create_by",
    )
    .bind(ticket_id)
    .bind(article_id)
    .bind(time_unit)
    .bind(Utc::now())
    .bind(create_by)
    .fetch_one(&mut **txn)
    .await
}

/// Accounted minutes total including rows written in the open transaction.
pub async fn total_time_units(
    txn: &mut Transaction<'_, Postgres>,
    ticket_id: i64,
) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(SUM(time_unit), 0) FROM time_accounting WHERE ticket_id = $1",
    )
    .bind(ticket_id)
    .fetch_one(&mut **txn)
    .await
}

// =============================================================================
// Dynamic Field Operations
// =============================================================================

pub async fn list_dynamic_fields(pool: &DbPool) -> sqlx::Result<Vec<DynamicField>> {
    sqlx::query_as::<_, DynamicField>(
        "SELECT id, name, label, field_type, object_type, config, valid_id \
         FROM dynamic_field WHERE valid_id = 1",
    )
    .fetch_all(pool)
    .await
}

pub async fn list_screen_config(pool: &DbPool) -> sqlx::Result<Vec<ScreenConfigRow>> {
    sqlx::query_as::<_, ScreenConfigRow>(
        "SELECT screen_name, field_id, visible, required, default_value FROM screen_config",
    )
    .fetch_all(pool)
    .await
}

/// Replace all value rows of one field on one object. Multi-value fields
/// write one row per entry afterwards.
pub async fn delete_dynamic_field_values(
    txn: &mut Transaction<'_, Postgres>,
    field_id: i64,
    object_type: &str,
    object_id: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        "DELETE FROM dynamic_field_value \
         WHERE field_id = $1 AND object_type = $2 AND object_id = $3",
    )
    .bind(field_id)
    .bind(object_type)
    .bind(object_id)
    .execute(&mut **txn)
    .await?;
    Ok(())
}

pub async fn insert_dynamic_field_value(
    txn: &mut Transaction<'_, Postgres>,
    field_id: i64,
    object_type: &str,
    object_id: i64,
    value_text: Option<&str>,
    value_int: Option<i64>,
    value_date: Option<chrono::DateTime<Utc>>,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO dynamic_field_value \
           (field_id, object_type, object_id, value_text, value_int, value_date) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(field_id)
    .bind(object_type)
    .bind(object_id)
    .bind(value_text)
    .bind(value_int)
    .bind(value_date)
    .execute(&mut **txn)
    .await?;
    Ok(())
}

pub async fn list_dynamic_field_values(
    pool: &DbPool,
    object_type: &str,
    object_id: i64,
) -> sqlx::Result<Vec<DynamicFieldValue>> {
    sqlx::query_as::<_, DynamicFieldValue>(
        "SELECT id, field_id, object_type, object_id, value_text, value_int, value_date \
         FROM dynamic_field_value \
         WHERE object_type = $1 AND object_id = $2 \
         ORDER BY field_id, id",
    )
    .bind(object_type)
    .bind(object_id)
    .fetch_all(pool)
    .await
}
