// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries processor error text
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tierlock Billing
//!
//! Grants paid entitlements (tiers and add-ons) exactly once per payment
//! session, however many times and by however many paths the grant is
//! attempted.
//!
//! ## Features
//!
//! - **Catalog**: Tier feature sets, prices, and add-on effects
//! - **Grant Lock**: Set-if-absent claim per payment session
//! - **Convergence**: Webhook, redirect sync, manual reconcile, and self-heal
//!   all run one shared grant algorithm
//! - **Retry Queue**: Catch-up for grant writes that failed after the lock,
//!   with a dead letter for items past their retry budget
//! - **Proration**: Upgrade charge is the new price less what was already paid
//! - **Usage**: Fail-open quota consumption with an audit trail

pub mod audit;
pub mod catalog;
pub mod client;
pub mod config;
pub mod convergence;
pub mod entitlement;
pub mod error;
pub mod grant_lock;
pub mod keys;
pub mod processor;
pub mod proration;
pub mod resolver;
pub mod retry;
pub mod testing;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

use tierlock_shared::SharedStore;

pub use audit::{AuditAction, AuditLog, AuditLogEntry};
pub use catalog::{Addon, Capability, Product, Quota, Tier};
pub use client::StripeClient;
pub use config::{GrantConfig, ProductResolverConfig, StripeConfig};
pub use convergence::{GrantEngine, GrantOutcome, ReconcileDiagnosis, SessionResolver};
pub use entitlement::{EntitlementRecord, EntitlementStore};
pub use error::{BillingError, BillingResult};
pub use grant_lock::{GrantLock, GrantSource};
pub use processor::{PaymentProcessor, PaymentSession, SharedProcessor};
pub use proration::{ProrationError, UpgradeQuote};
pub use retry::{DrainReport, RetryQueueItem, RetryQueueSnapshot};
pub use usage::{EntitlementService, UsageDecision};
pub use webhooks::{WebhookDisposition, WebhookHandler};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub engine: Arc<GrantEngine>,
    pub webhooks: Arc<WebhookHandler>,
    pub entitlements: EntitlementService,
}

impl BillingService {
    /// Create a billing service with an explicit processor (Stripe or a mock)
    pub fn new(
        store: SharedStore,
        processor: SharedProcessor,
        webhook_secret: impl Into<String>,
        resolver_config: ProductResolverConfig,
        grant_config: GrantConfig,
    ) -> Self {
        let audit_cap = grant_config.audit_cap;
        let engine = Arc::new(GrantEngine::new(
            store.clone(),
            processor,
            resolver_config,
            grant_config,
        ));
        let webhooks = Arc::new(WebhookHandler::new(engine.clone(), webhook_secret));
        let entitlements = EntitlementService::new(store.clone(), AuditLog::new(store, audit_cap));

        Self {
            engine,
            webhooks,
            entitlements,
        }
    }

    /// Create a Stripe-backed billing service from environment variables
    pub fn from_env(store: SharedStore) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let webhook_secret = stripe.config().webhook_secret.clone();
        let mut grant_config = GrantConfig::from_env()?;
        grant_config.processor_timeout = stripe.config().api_timeout;

        tracing::info!(
            lock_ttl_days = grant_config.lock_ttl.as_secs() / 86_400,
            audit_cap = grant_config.audit_cap,
            "Billing service configured"
        );

        Ok(Self::new(
            store,
            Arc::new(stripe),
            webhook_secret,
            ProductResolverConfig::from_env()?,
            grant_config,
        ))
    }
}
