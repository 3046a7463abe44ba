use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::models::MailQueueItem;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Outcome of one SMTP send as reported by the transport.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: i32,
    pub message: String,
}

/// The SMTP transport contract. The queue records whatever code the
/// transport returns; the protocol itself lives outside the core.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Deliver one fully assembled RFC-5322 message. An `Err` means the
    /// transport could not obtain any SMTP status (connection failure) and
    /// is treated as transient.
    async fn send(
        &self,
        sender: &str,
        recipient: &str,
        raw_message: &[u8],
    ) -> anyhow::Result<SmtpResponse>;
}

/// Relay adapter over an SMTP submission endpoint.
pub struct SmtpRelayTransport {
    transport: lettre::AsyncSmtpTransport<lettre::Tokio1Executor>,
}

impl SmtpRelayTransport {
    pub fn new(host: &str, port: u16, credentials: Option<(String, String)>) -> anyhow::Result<Self> {
        let mut builder =
            lettre::AsyncSmtpTransport::<lettre::Tokio1Executor>::starttls_relay(host)?.port(port);
        if let Some((user, pass)) = credentials {
            builder = builder.credentials(lettre::transport::smtp::authentication::Credentials::new(
                user, pass,
            ));
        }
        Ok(Self {
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpRelayTransport {
    async fn send(
        &self,
        sender: &str,
        recipient: &str,
        raw_message: &[u8],
    ) -> anyhow::Result<SmtpResponse> {
        use lettre::AsyncTransport;

        let envelope = lettre::address::Envelope::new(
            Some(sender.parse()?),
            vec![recipient.parse()?],
        )?;
        match self.transport.send_raw(&envelope, raw_message).await {
            Ok(response) => Ok(SmtpResponse {
                code: response.code().to_string().parse().unwrap_or(250),
                message: response.message().collect::<Vec<_>>().join(" "),
            }),
            // A rejected send still carries an SMTP status; surface it so
            // the queue can classify. Anything else bubbles as transient.
            Err(e) => match e.status() {
                Some(code) => Ok(SmtpResponse {
                    code: code.to_string().parse().unwrap_or(451),
                    message: e.to_string(),
                }),
                None => Err(e.into()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Message composition
// ---------------------------------------------------------------------------

/// Assemble an RFC-5322 notification message. `from` is the queue's system
/// address mailbox; the subject carries the ticket number so replies thread
/// back to the ticket.
pub fn compose_message(from: &str, to: &str, subject: &str, body: &str) -> Result<Vec<u8>> {
    let message = lettre::Message::builder()
        .from(from
            .parse()
            .map_err(|_| Error::validation("invalid sender address"))?)
        .to(to
            .parse()
            .map_err(|_| Error::validation("invalid recipient address"))?)
        .subject(subject)
        .header(lettre::message::header::ContentType::TEXT_PLAIN)
        .body(body.to_string())
        .map_err(|e| Error::internal(format!("message assembly failed: {}", e)))?;
    Ok(message.formatted())
}

// ---------------------------------------------------------------------------
// Outcome classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// 2xx: accepted; the row is marked sent and never re-selected.
    Success,
    /// 4xx (and unknown codes): retried with backoff.
    Transient,
    /// 5xx: parked until an operator retries.
    Permanent,
}

pub fn classify_smtp_code(code: i32) -> SendOutcome {
    match code {
        200..=299 => SendOutcome::Success,
        500..=599 => SendOutcome::Permanent,
        _ => SendOutcome::Transient,
    }
}

/// Exponential backoff: 60 s → 2 m → 4 m → 8 m → 16 m (capped at 1 h).
fn backoff_delay(attempts: i32) -> Duration {
    let base = 60u64;
    let delay = base.saturating_mul(2u64.saturating_pow(attempts.max(0) as u32));
    Duration::from_secs(delay.min(3600))
}

/// Apply ±20% jitter so parallel workers do not thunder in step.
fn with_jitter(delay: Duration, rng: &mut impl Rng) -> Duration {
    let secs = delay.as_secs() as f64;
    let factor = rng.gen_range(0.8..=1.2);
    Duration::from_secs((secs * factor).round() as u64)
}

// ---------------------------------------------------------------------------
// Queue stats (monitoring)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MailQueueStats {
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
    pub total: i64,
}

// ---------------------------------------------------------------------------
// MailQueue
// ---------------------------------------------------------------------------

/// Worker configuration; env-driven in the composition root.
#[derive(Debug, Clone)]
pub struct MailWorkerConfig {
    pub interval: Duration,
    pub batch_size: i64,
}

impl Default for MailWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            batch_size: 20,
        }
    }
}

/// Manages the durable outbound mail queue backed by PostgreSQL.
pub struct MailQueue {
    pool: PgPool,
}

impl MailQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // -- Enqueue ----------------------------------------------------------------

    /// Enqueue one assembled message, due immediately.
    pub async fn insert(
        &self,
        article_id: Option<i64>,
        sender: &str,
        recipient: &str,
        raw_message: &[u8],
    ) -> sqlx::Result<String> {
        let id = ulid::Ulid::new().to_string();
        sqlx::query(
            "INSERT INTO mail_queue \
               (id, article_id, sender, recipient, raw_message, attempts, create_time) \
             VALUES ($1, $2, $3, $4, $5, 0, NOW())",
        )
        .bind(&id)
        .bind(article_id)
        .bind(sender)
        .bind(recipient)
        .bind(raw_message)
        .execute(&self.pool)
        .await?;

        debug!(mail_id = %id, recipient, "Mail enqueued");
        Ok(id)
    }

    // -- Background worker ------------------------------------------------------

    /// Run the drain worker. Call from the composition root; returns when
    /// `shutdown` is cancelled. In-flight rows finish their bookkeeping.
    pub async fn run_worker(
        &self,
        transport: Arc<dyn MailTransport>,
        config: MailWorkerConfig,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval_secs = config.interval.as_secs(),
            batch_size = config.batch_size,
            "Mail queue worker started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.process_due_batch(transport.as_ref(), config.batch_size).await {
                        Ok(0) => {}
                        Ok(n) => debug!(processed = n, "Processed mail queue rows"),
                        Err(e) => error!(error = %e, "Mail queue worker error"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Mail queue worker shutting down");
                    break;
                }
            }
        }
    }

    // -- Batch processing -------------------------------------------------------

    /// One drain pass. Rows are read in one query; SMTP I/O happens with no
    /// database transaction held; outcomes are recorded row by row. A crash
    /// between send and bookkeeping duplicates a send, never loses one.
    pub async fn process_due_batch(
        &self,
        transport: &dyn MailTransport,
        batch_size: i64,
    ) -> sqlx::Result<usize> {
        let rows = sqlx::query_as::<_, MailQueueItem>(
            "SELECT id, article_id, sender, recipient, raw_message, attempts, \
                    due_time, last_smtp_code, last_smtp_message, create_time \
             FROM mail_queue \
             WHERE (due_time IS NULL OR due_time <= NOW()) \
               AND (last_smtp_code IS NULL \
                    OR (last_smtp_code >= 400 AND last_smtp_code < 500)) \
             ORDER BY create_time ASC \
             LIMIT $1",
        )
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        let count = rows.len();
        for item in rows {
            self.process_item(&item, transport).await;
        }
        Ok(count)
    }

    // -- Single item processing -------------------------------------------------

    async fn process_item(&self, item: &MailQueueItem, transport: &dyn MailTransport) {
        match transport
            .send(&item.sender, &item.recipient, &item.raw_message)
            .await
        {
            Ok(response) => match classify_smtp_code(response.code) {
                SendOutcome::Success => {
                    debug!(mail_id = %item.id, code = response.code, "Mail sent");
                    metrics::counter!("mail_queue_sent_total", 1);
                    let _ = self.mark_sent(&item.id, &response).await;
                }
                SendOutcome::Transient => {
                    let delay = with_jitter(backoff_delay(item.attempts), &mut rand::thread_rng());
                    warn!(
                        mail_id = %item.id,
                        code = response.code,
                        attempt = item.attempts + 1,
                        next_try_secs = delay.as_secs(),
                        "Transient SMTP failure, scheduling retry"
                    );
                    metrics::counter!("mail_queue_deferred_total", 1);
                    let _ = self
                        .schedule_retry(&item.id, Some(&response), delay)
                        .await;
                }
                SendOutcome::Permanent => {
                    error!(
                        mail_id = %item.id,
                        code = response.code,
                        smtp_message = %response.message,
                        "Permanent SMTP failure, parking row"
                    );
                    metrics::counter!("mail_queue_failed_total", 1);
                    let _ = self.mark_permanent(&item.id, &response).await;
                }
            },
            Err(e) => {
                // No SMTP status at all: connection-level failure, transient.
                let delay = with_jitter(backoff_delay(item.attempts), &mut rand::thread_rng());
                warn!(
                    mail_id = %item.id,
                    error = %e,
                    attempt = item.attempts + 1,
                    next_try_secs = delay.as_secs(),
                    "Transport failure, scheduling retry"
                );
                metrics::counter!("mail_queue_deferred_total", 1);
                let _ = self.record_transport_failure(&item.id, &e.to_string(), delay).await;
            }
        }
    }

    // -- Status mutations -------------------------------------------------------

    async fn mark_sent(&self, id: &str, response: &SmtpResponse) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE mail_queue \
             SET attempts = attempts + 1, \
                 last_smtp_code = $2, last_smtp_message = $3, due_time = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .bind(response.code)
        .bind(&response.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: &str,
        response: Option<&SmtpResponse>,
        delay: Duration,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE mail_queue \
             SET attempts = attempts + 1, \
                 last_smtp_code = $2, last_smtp_message = $3, \
                 due_time = NOW() + make_interval(secs => $4) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(response.map(|r| r.code))
        .bind(response.map(|r| r.message.as_str()))
        .bind(delay.as_secs() as f64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_permanent(&self, id: &str, response: &SmtpResponse) -> sqlx::Result<()> {
        // The 5xx code keeps the row out of the due selection until an
        // operator clears it via retry/retry_all.
        sqlx::query(
            "UPDATE mail_queue \
             SET attempts = attempts + 1, \
                 last_smtp_code = $2, last_smtp_message = $3 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(response.code)
        .bind(&response.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_transport_failure(
        &self,
        id: &str,
        error_msg: &str,
        delay: Duration,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE mail_queue \
             SET attempts = attempts + 1, \
                 last_smtp_code = NULL, last_smtp_message = $2, \
                 due_time = NOW() + make_interval(secs => $3) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(error_msg)
        .bind(delay.as_secs() as f64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- Operator actions -------------------------------------------------------

    /// Reset one parked row so the worker picks it up again. `attempts`
    /// stays as-is; it only ever grows.
    pub async fn retry(&self, id: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE mail_queue \
             SET due_time = NULL, last_smtp_code = NULL, last_smtp_message = NULL \
             WHERE id = $1 \
               AND (last_smtp_code IS NULL OR last_smtp_code < 200 OR last_smtp_code >= 300)",
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(Error::not_found("retryable mail queue row"));
        }
        info!(mail_id = %id, "Mail queue row reset for retry");
        Ok(())
    }

    /// Reset every row that has failed at least once and is not sent.
    pub async fn retry_all(&self) -> Result<u64> {
        let updated = sqlx::query(
            "UPDATE mail_queue \
             SET due_time = NULL, last_smtp_code = NULL, last_smtp_message = NULL \
             WHERE (last_smtp_code IS NOT NULL \
                      AND (last_smtp_code < 200 OR last_smtp_code >= 300)) \
                OR (last_smtp_code IS NULL AND attempts > 0)",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        info!(rows = updated, "Mail queue retry-all");
        Ok(updated)
    }

    // -- Maintenance ------------------------------------------------------------

    /// Delete sent rows older than `max_age_hours`.
    pub async fn cleanup_sent(&self, max_age_hours: i64) -> sqlx::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM mail_queue \
             WHERE last_smtp_code >= 200 AND last_smtp_code < 300 \
               AND create_time < NOW() - make_interval(hours => $1)",
        )
        .bind(max_age_hours as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Queue statistics for monitoring.
    pub async fn stats(&self) -> sqlx::Result<MailQueueStats> {
        let row: (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT \
                COUNT(*) FILTER (WHERE last_smtp_code IS NULL \
                                   OR (last_smtp_code >= 400 AND last_smtp_code < 500)), \
                COUNT(*) FILTER (WHERE last_smtp_code >= 200 AND last_smtp_code < 300), \
                COUNT(*) FILTER (WHERE last_smtp_code >= 500), \
                COUNT(*) \
             FROM mail_queue",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(MailQueueStats {
            pending: row.0,
            sent: row.1,
            failed: row.2,
            total: row.3,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_classification() {
        assert_eq!(classify_smtp_code(250), SendOutcome::Success);
        assert_eq!(classify_smtp_code(200), SendOutcome::Success);
        assert_eq!(classify_smtp_code(299), SendOutcome::Success);
        assert_eq!(classify_smtp_code(421), SendOutcome::Transient);
        assert_eq!(classify_smtp_code(451), SendOutcome::Transient);
        assert_eq!(classify_smtp_code(550), SendOutcome::Permanent);
        assert_eq!(classify_smtp_code(599), SendOutcome::Permanent);
        // Codes outside the SMTP ranges retry rather than park.
        assert_eq!(classify_smtp_code(0), SendOutcome::Transient);
        assert_eq!(classify_smtp_code(354), SendOutcome::Transient);
    }

    #[test]
    fn backoff_values() {
        assert_eq!(backoff_delay(0), Duration::from_secs(60));
        assert_eq!(backoff_delay(1), Duration::from_secs(120));
        assert_eq!(backoff_delay(2), Duration::from_secs(240));
        assert_eq!(backoff_delay(3), Duration::from_secs(480));
        assert_eq!(backoff_delay(4), Duration::from_secs(960));
        assert_eq!(backoff_delay(5), Duration::from_secs(1920));
        assert_eq!(backoff_delay(6), Duration::from_secs(3600)); // capped
        assert_eq!(backoff_delay(10), Duration::from_secs(3600)); // still capped
        assert_eq!(backoff_delay(-1), Duration::from_secs(60)); // defensive floor
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for attempts in 0..8 {
            let base = backoff_delay(attempts);
            for _ in 0..100 {
                let jittered = with_jitter(base, &mut rng);
                let secs = jittered.as_secs() as f64;
                let base_secs = base.as_secs() as f64;
                assert!(secs >= (base_secs * 0.8).floor());
                assert!(secs <= (base_secs * 1.2).ceil());
            }
        }
    }

    #[test]
    fn test_compose_message_headers() {
        let raw = compose_message(
            "Support <support@example.com>",
            "john@example.com",
            "[Ticket#20260801120000] Cannot access email",
            "We received your request.",
        )
        .unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("From:"));
        assert!(text.contains("support@example.com"));
        assert!(text.contains("To:"));
        assert!(text.contains("john@example.com"));
        assert!(text.contains("Subject: [Ticket#20260801120000] Cannot access email"));
        assert!(text.contains("We received your request."));
    }

    #[test]
    fn test_compose_message_rejects_bad_addresses() {
        assert_eq!(
            compose_message("not an address", "john@example.com", "s", "b")
                .unwrap_err()
                .code(),
            "ValidationFailed"
        );
        assert_eq!(
            compose_message("support@example.com", "nope", "s", "b")
                .unwrap_err()
                .code(),
            "ValidationFailed"
        );
    }
}
