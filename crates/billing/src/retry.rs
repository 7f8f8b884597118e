//! Retry queue and dead letter for grant writes
//!
//! When the entitlement write fails after the grant lock was taken, the grant
//! is "promised" but not yet visible. A [`RetryQueueItem`] is queued so a
//! scheduled drain can catch the record up.
//!
//! Drain pops from the head and re-enqueues failures at the tail, so one bad
//! item never blocks the items behind it. After `max_retries` failed attempts
//! an item moves to the dead-letter list and waits for an operator.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tierlock_shared::SharedStore;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLog, AuditLogEntry};
use crate::catalog::Product;
use crate::error::{BillingError, BillingResult};
use crate::keys;

/// How long an event id stays marked as queued
const MARKER_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Retrying,
    DeadLettered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryQueueItem {
    /// Processor event id, or `{source}:{session_id}` for non-webhook grants
    pub event_id: String,
    pub user_id: Uuid,
    pub product_type: String,
    pub product_id: String,
    pub session_id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub amount_paid_cents: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
    pub retry_count: u32,
    pub status: RetryStatus,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl RetryQueueItem {
    pub fn new(
        event_id: impl Into<String>,
        user_id: Uuid,
        product: Product,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            user_id,
            product_type: product.product_type().to_string(),
            product_id: product.product_id().to_string(),
            session_id: session_id.into(),
            customer_id: None,
            amount_paid_cents: 0,
            failed_at: OffsetDateTime::now_utc(),
            retry_count: 0,
            status: RetryStatus::Pending,
            last_error: None,
        }
    }

    pub fn customer(mut self, customer_id: Option<String>) -> Self {
        self.customer_id = customer_id;
        self
    }

    pub fn amount(mut self, amount_paid_cents: i64) -> Self {
        self.amount_paid_cents = amount_paid_cents;
        self
    }

    pub fn product(&self) -> Option<Product> {
        Product::parse(&self.product_type, &self.product_id)
    }
}

/// Re-applies a promised grant for one queued item
#[async_trait]
pub trait RetryHandler: Send + Sync {
    async fn retry_grant(&self, item: &RetryQueueItem) -> BillingResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedOutcome {
    Success,
    Failed,
    DeadLettered,
    /// Queue entry could not be decoded; parked in dead letter as-is
    Unreadable,
}

impl fmt::Display for ProcessedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessedOutcome::Success => "success",
            ProcessedOutcome::Failed => "failed",
            ProcessedOutcome::DeadLettered => "dead_lettered",
            ProcessedOutcome::Unreadable => "unreadable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessedItem {
    pub event_id: String,
    pub outcome: ProcessedOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    pub processed: Vec<ProcessedItem>,
    pub remaining: usize,
    pub dead_letter: usize,
}

impl DrainReport {
    pub fn count(&self, outcome: ProcessedOutcome) -> usize {
        self.processed.iter().filter(|p| p.outcome == outcome).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryQueueSnapshot {
    pub pending_len: usize,
    pub dead_letter_len: usize,
    pub pending: Vec<RetryQueueItem>,
    pub dead_letter: Vec<RetryQueueItem>,
}

#[derive(Clone)]
pub struct RetryQueue {
    store: SharedStore,
    audit: AuditLog,
    max_retries: u32,
}

impl RetryQueue {
    pub fn new(store: SharedStore, audit: AuditLog, max_retries: u32) -> Self {
        Self {
            store,
            audit,
            max_retries,
        }
    }

    /// Queue a catch-up grant. Returns false if the event id is already queued.
    pub async fn enqueue(&self, item: RetryQueueItem) -> BillingResult<bool> {
        let fresh = self
            .store
            .set_if_absent(&keys::retry_marker(&item.event_id), "1", Some(MARKER_TTL))
            .await?;
        if !fresh {
            tracing::info!(
                event_id = %item.event_id,
                "Retry item already queued for this event"
            );
            return Ok(false);
        }

        let json = serde_json::to_string(&item)?;
        if let Err(e) = self.store.push_back(keys::RETRY_QUEUE, &json).await {
            // Drop the marker so a later delivery can queue it again
            let _ = self.store.delete(&keys::retry_marker(&item.event_id)).await;
            return Err(e.into());
        }

        tracing::warn!(
            event_id = %item.event_id,
            user_id = %item.user_id,
            session_id = %item.session_id,
            product = %format!("{}:{}", item.product_type, item.product_id),
            "Grant write queued for retry"
        );
        Ok(true)
    }

    /// Process at most `batch` items, never more than were queued at the start
    pub async fn drain(&self, batch: usize, handler: &dyn RetryHandler) -> BillingResult<DrainReport> {
        let queued = self.store.len(keys::RETRY_QUEUE).await?;
        let mut report = DrainReport::default();

        for _ in 0..batch.min(queued) {
            let Some(raw) = self.store.pop_front(keys::RETRY_QUEUE).await? else {
                break;
            };

            let mut item: RetryQueueItem = match serde_json::from_str(&raw) {
                Ok(item) => item,
                Err(e) => {
                    tracing::error!(error = %e, raw = %raw, "Unreadable retry item moved to dead letter");
                    self.store.push_back(keys::DEAD_LETTER_QUEUE, &raw).await?;
                    report.processed.push(ProcessedItem {
                        event_id: String::new(),
                        outcome: ProcessedOutcome::Unreadable,
                    });
                    continue;
                }
            };

            let outcome = match handler.retry_grant(&item).await {
                Ok(()) => {
                    let _ = self.store.delete(&keys::retry_marker(&item.event_id)).await;
                    tracing::info!(
                        event_id = %item.event_id,
                        user_id = %item.user_id,
                        attempts = item.retry_count + 1,
                        "Retried grant applied"
                    );
                    ProcessedOutcome::Success
                }
                Err(e) => self.record_failure(&mut item, e).await?,
            };

            report.processed.push(ProcessedItem {
                event_id: item.event_id,
                outcome,
            });
        }

        report.remaining = self.store.len(keys::RETRY_QUEUE).await?;
        report.dead_letter = self.store.len(keys::DEAD_LETTER_QUEUE).await?;
        Ok(report)
    }

    async fn record_failure(
        &self,
        item: &mut RetryQueueItem,
        error: BillingError,
    ) -> BillingResult<ProcessedOutcome> {
        item.retry_count += 1;
        item.failed_at = OffsetDateTime::now_utc();
        item.last_error = Some(error.to_string());

        if item.retry_count > self.max_retries {
            item.status = RetryStatus::DeadLettered;
            let json = serde_json::to_string(&item)?;
            self.store.push_back(keys::DEAD_LETTER_QUEUE, &json).await?;
            let _ = self.store.delete(&keys::retry_marker(&item.event_id)).await;

            tracing::error!(
                event_id = %item.event_id,
                user_id = %item.user_id,
                session_id = %item.session_id,
                retry_count = item.retry_count,
                error = %error,
                "STRANDED PAYMENT: grant retry exhausted, moved to dead letter"
            );
            self.audit
                .record(
                    item.user_id,
                    AuditLogEntry::new(AuditAction::GrantDeadLettered)
                        .session(item.session_id.clone())
                        .detail(serde_json::json!({
                            "event_id": item.event_id,
                            "retry_count": item.retry_count,
                            "error": item.last_error,
                        })),
                )
                .await;
            return Ok(ProcessedOutcome::DeadLettered);
        }

        item.status = RetryStatus::Retrying;
        let json = serde_json::to_string(&item)?;
        self.store.push_back(keys::RETRY_QUEUE, &json).await?;
        tracing::warn!(
            event_id = %item.event_id,
            retry_count = item.retry_count,
            error = %error,
            "Grant retry failed, re-queued at tail"
        );
        Ok(ProcessedOutcome::Failed)
    }

    /// Both lists, up to `limit` items each, head first
    pub async fn inspect(&self, limit: usize) -> BillingResult<RetryQueueSnapshot> {
        let stop = limit.max(1) as isize - 1;
        Ok(RetryQueueSnapshot {
            pending_len: self.store.len(keys::RETRY_QUEUE).await?,
            dead_letter_len: self.store.len(keys::DEAD_LETTER_QUEUE).await?,
            pending: decode_all(self.store.range(keys::RETRY_QUEUE, 0, stop).await?),
            dead_letter: decode_all(self.store.range(keys::DEAD_LETTER_QUEUE, 0, stop).await?),
        })
    }

    /// Operator action: move a dead-lettered item back to the main queue with a fresh budget
    pub async fn requeue_dead_letter(&self, event_id: &str) -> BillingResult<RetryQueueItem> {
        let entries = self.store.range(keys::DEAD_LETTER_QUEUE, 0, -1).await?;
        let found = entries.into_iter().find_map(|raw| {
            serde_json::from_str::<RetryQueueItem>(&raw)
                .ok()
                .filter(|item| item.event_id == event_id)
                .map(|item| (raw, item))
        });
        let Some((raw, mut item)) = found else {
            return Err(BillingError::NotFound(format!(
                "dead-letter item {}",
                event_id
            )));
        };

        if self.store.remove(keys::DEAD_LETTER_QUEUE, &raw).await? == 0 {
            // Another operator got there first
            return Err(BillingError::NotFound(format!(
                "dead-letter item {}",
                event_id
            )));
        }

        item.retry_count = 0;
        item.status = RetryStatus::Pending;
        item.last_error = None;
        self.store
            .set(&keys::retry_marker(&item.event_id), "1", Some(MARKER_TTL))
            .await?;
        self.store
            .push_back(keys::RETRY_QUEUE, &serde_json::to_string(&item)?)
            .await?;

        tracing::info!(
            event_id = %item.event_id,
            user_id = %item.user_id,
            "Dead-letter item re-queued by operator"
        );
        Ok(item)
    }
}

fn decode_all(raw: Vec<String>) -> Vec<RetryQueueItem> {
    raw.iter()
        .filter_map(|r| serde_json::from_str(r).ok())
        .collect()
}
