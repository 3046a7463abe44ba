use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ticketd_server::lifecycle::{ServiceConfig, TicketService};
use ticketd_server::mailq::{MailWorkerConfig, SmtpRelayTransport};
use ticketd_server::scheduler::{self, SchedulerConfig};
use ticketd_server::{db, mailq};

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Default to warn in production, debug in development
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }

        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting ticketd");

    let db_pool = db::init_db_default().await?;
    tracing::info!("Database initialized");

    let service_config = ServiceConfig {
        require_time_units: env_flag("REQUIRE_TIME_UNITS"),
    };
    let service = Arc::new(TicketService::new(db_pool.clone(), service_config));
    tracing::info!("Lifecycle service initialized");

    let shutdown = CancellationToken::new();
    let mut workers = Vec::new();

    // Test mode runs the core without background workers.
    if env_flag("TICKETD_TEST_MODE") {
        tracing::warn!("TICKETD_TEST_MODE is set; background workers disabled");
    } else {
        let scheduler_config = SchedulerConfig {
            interval: env_secs("SCHEDULER_INTERVAL_SECS", 60),
            batch_size: std::env::var("SCHEDULER_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
        };
        let scan_service = Arc::clone(&service);
        let scan_shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move {
            scheduler::run_pending_scan_worker(scan_service, scheduler_config, scan_shutdown).await;
        }));
        tracing::info!("Pending scan worker started");

        match std::env::var("SMTP_HOST") {
            Ok(host) => {
                let port = std::env::var("SMTP_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(587);
                let credentials = match (std::env::var("SMTP_USER"), std::env::var("SMTP_PASS")) {
                    (Ok(user), Ok(pass)) => Some((user, pass)),
                    _ => None,
                };
                let transport: Arc<dyn mailq::MailTransport> =
                    Arc::new(SmtpRelayTransport::new(&host, port, credentials)?);

                let mail_config = MailWorkerConfig {
                    interval: env_secs("MAIL_WORKER_INTERVAL_SECS", 15),
                    batch_size: std::env::var("MAIL_WORKER_BATCH_SIZE")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(20),
                };
                let mail_service = Arc::clone(&service);
                let mail_shutdown = shutdown.clone();
                workers.push(tokio::spawn(async move {
                    mail_service
                        .mail_queue()
                        .run_worker(transport, mail_config, mail_shutdown)
                        .await;
                }));
                tracing::info!("Mail queue worker started");
            }
            Err(_) => {
                tracing::warn!("SMTP_HOST not set; mail queue worker not started");
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    tracing::info!("ticketd stopped");

    Ok(())
}
