// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tierlock Background Worker
//!
//! Drives the grant retry queue: on a cron schedule it calls the API's
//! internal drain endpoint, which processes one bounded batch and
//! dead-letters anything past its retry budget.

mod drain;

use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::drain::{DrainClient, DrainConfig, DrainError};

/// Every minute, at second 0
const DEFAULT_DRAIN_CRON: &str = "0 */1 * * * *";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Tierlock Worker");

    let client = DrainClient::new(DrainConfig::from_env()?)?;
    let schedule =
        std::env::var("RETRY_DRAIN_CRON").unwrap_or_else(|_| DEFAULT_DRAIN_CRON.to_string());

    let scheduler = JobScheduler::new().await?;

    // Job 1: Drain the grant retry queue
    let drain_client = client.clone();
    scheduler
        .add(Job::new_async(schedule.as_str(), move |_uuid, _l| {
            let client = drain_client.clone();
            Box::pin(async move {
                match client.drain().await {
                    Ok(summary) if summary.processed.is_empty() => {}
                    Ok(summary) => {
                        info!(
                            succeeded = summary.count("success"),
                            failed = summary.count("failed"),
                            dead_lettered = summary.count("dead_lettered"),
                            remaining = summary.remaining,
                            dead_letter = summary.dead_letter,
                            "Retry queue drain complete"
                        );
                        let dead = summary.event_ids("dead_lettered");
                        if !dead.is_empty() {
                            error!(
                                dead_letter = summary.dead_letter,
                                event_ids = ?dead,
                                "Grants moved to dead letter - stranded payments need operator review"
                            );
                        }
                    }
                    Err(DrainError::Rejected { status, body }) => {
                        error!(status = status, body = %body, "Drain endpoint rejected the worker - check RETRY_DRAIN_SECRET");
                    }
                    Err(e) => warn!(error = %e, "Retry queue drain failed; next run will try again"),
                }
            })
        })?)
        .await?;
    info!(schedule = %schedule, "Scheduled: Grant retry queue drain");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Tierlock Worker started successfully");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
