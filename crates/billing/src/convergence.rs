//! Grant convergence
//!
//! Four triggers can grant a paid session: the processor webhook, the
//! redirect sync, a manual reconcile, and the self-heal on read. They differ
//! only in how they find and authenticate the session, which is what a
//! [`SessionResolver`] captures. Everything after that runs through
//! [`GrantEngine::converge`]:
//!
//! 1. Existing grant lock means "already granted"; return current state.
//! 2. Resolve the product the session bought.
//! 3. Compute the new entitlement record.
//! 4. Take the grant lock. Losing the race also means "already granted".
//! 5. Write the record, then audit. A failed write is queued for retry and the
//!    grant is still reported, since the lock makes it a promise.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tierlock_shared::SharedStore;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLog, AuditLogEntry};
use crate::catalog::{price_for, Product, Tier};
use crate::config::{GrantConfig, ProductResolverConfig};
use crate::entitlement::{EntitlementRecord, EntitlementStore};
use crate::error::{BillingError, BillingResult};
use crate::grant_lock::{GrantLockService, GrantSource};
use crate::keys;
use crate::processor::{
    bounded, validate_session_id, PaymentProcessor, PaymentSession, SessionQuery, SharedProcessor,
};
use crate::proration;
use crate::resolver::ProductResolver;
use crate::retry::{RetryHandler, RetryQueue, RetryQueueItem};

/// A paid session tied to the user it will be granted to
#[derive(Debug, Clone)]
pub struct VerifiedSession {
    pub session: PaymentSession,
    pub user_id: Uuid,
    /// Processor event id when the session arrived by webhook
    pub event_id: Option<String>,
}

/// How one trigger finds and authenticates its payment session
#[async_trait]
pub trait SessionResolver: Send + Sync {
    fn source(&self) -> GrantSource;

    /// `Ok(None)` when there is nothing to grant
    async fn resolve(&self, processor: &dyn PaymentProcessor)
        -> BillingResult<Option<VerifiedSession>>;
}

/// Session delivered in a signature-verified webhook payload
pub struct PushedSession {
    pub event_id: String,
    pub session: PaymentSession,
}

#[async_trait]
impl SessionResolver for PushedSession {
    fn source(&self) -> GrantSource {
        GrantSource::Webhook
    }

    async fn resolve(
        &self,
        _processor: &dyn PaymentProcessor,
    ) -> BillingResult<Option<VerifiedSession>> {
        if !self.session.paid {
            tracing::info!(
                event_id = %self.event_id,
                session_id = %self.session.id,
                "Checkout completed without payment yet, skipping grant"
            );
            return Ok(None);
        }
        let Some(user_id) = self.session.embedded_user_id() else {
            tracing::error!(
                event_id = %self.event_id,
                session_id = %self.session.id,
                customer_id = ?self.session.customer_id,
                "RECONCILIATION NEEDED: paid session carries no user id"
            );
            return Err(BillingError::SessionOwnershipUnverifiable);
        };
        Ok(Some(VerifiedSession {
            session: self.session.clone(),
            user_id,
            event_id: Some(self.event_id.clone()),
        }))
    }
}

/// Session id handed back by the browser after hosted checkout
pub struct RedirectSession {
    pub user_id: Uuid,
    pub session_id: String,
}

#[async_trait]
impl SessionResolver for RedirectSession {
    fn source(&self) -> GrantSource {
        GrantSource::RedirectSync
    }

    async fn resolve(
        &self,
        processor: &dyn PaymentProcessor,
    ) -> BillingResult<Option<VerifiedSession>> {
        validate_session_id(&self.session_id)?;

        let session = processor
            .retrieve_session(&self.session_id)
            .await?
            .ok_or_else(|| BillingError::SessionNotFound(self.session_id.clone()))?;

        if session.embedded_user_id() != Some(self.user_id) {
            tracing::warn!(
                user_id = %self.user_id,
                session_id = %self.session_id,
                "Sync attempted with a session belonging to someone else"
            );
            return Err(BillingError::SessionOwnershipUnverifiable);
        }
        if !session.paid {
            return Err(BillingError::SessionNotPaid(self.session_id.clone()));
        }

        Ok(Some(VerifiedSession {
            session,
            user_id: self.user_id,
            event_id: None,
        }))
    }
}

/// Search the processor for the caller's most recent paid session
pub struct CustomerSearch {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub known_customer_id: Option<String>,
    pub limit: u64,
    pub source: GrantSource,
}

impl CustomerSearch {
    /// Embedded user id match, or customer id and email both matching
    pub fn owns(&self, session: &PaymentSession) -> bool {
        if session.embedded_user_id() == Some(self.user_id) {
            return true;
        }
        let customer_match = matches!(
            (&self.known_customer_id, &session.customer_id),
            (Some(known), Some(actual)) if known == actual
        );
        let email_match = self
            .email
            .as_deref()
            .is_some_and(|email| session.email_matches(email));
        customer_match && email_match
    }
}

#[async_trait]
impl SessionResolver for CustomerSearch {
    fn source(&self) -> GrantSource {
        self.source
    }

    async fn resolve(
        &self,
        processor: &dyn PaymentProcessor,
    ) -> BillingResult<Option<VerifiedSession>> {
        if self.known_customer_id.is_none() && self.email.is_none() {
            return Ok(None);
        }

        let query = SessionQuery {
            customer_id: self.known_customer_id.clone(),
            email: self.email.clone(),
            limit: self.limit,
        };
        let Some(latest) = processor
            .list_sessions(&query)
            .await?
            .into_iter()
            .filter(|s| s.paid)
            .max_by_key(|s| s.created)
        else {
            return Ok(None);
        };

        if !self.owns(&latest) {
            tracing::warn!(
                user_id = %self.user_id,
                session_id = %latest.id,
                source = %self.source,
                "Found paid session but could not verify ownership"
            );
            return Err(BillingError::SessionOwnershipUnverifiable);
        }

        Ok(Some(VerifiedSession {
            session: latest,
            user_id: self.user_id,
            event_id: None,
        }))
    }
}

/// Result of one convergence attempt
#[derive(Debug, Clone, Serialize)]
pub struct GrantOutcome {
    pub granted: bool,
    pub already_granted: bool,
    pub tier: Tier,
    pub entitlement: EntitlementRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<Product>,
    /// The record write failed and a catch-up is queued
    pub retry_enqueued: bool,
}

impl GrantOutcome {
    fn already(entitlement: EntitlementRecord, session_id: &str, product: Option<Product>) -> Self {
        Self {
            granted: false,
            already_granted: true,
            tier: entitlement.tier,
            entitlement,
            session_id: Some(session_id.to_string()),
            product,
            retry_enqueued: false,
        }
    }

    fn nothing_found(entitlement: EntitlementRecord) -> Self {
        Self {
            granted: false,
            already_granted: false,
            tier: entitlement.tier,
            entitlement,
            session_id: None,
            product: None,
            retry_enqueued: false,
        }
    }
}

/// GET reconcile: what a POST would do, without doing it
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileDiagnosis {
    pub current_tier: Tier,
    pub paid_session_found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<Product>,
    pub already_granted: bool,
    pub would_help: bool,
    pub detail: String,
}

pub struct GrantEngine {
    store: SharedStore,
    processor: SharedProcessor,
    entitlements: EntitlementStore,
    locks: GrantLockService,
    audit: AuditLog,
    retry: RetryQueue,
    resolver: ProductResolver,
    config: GrantConfig,
}

impl GrantEngine {
    pub fn new(
        store: SharedStore,
        processor: SharedProcessor,
        resolver_config: ProductResolverConfig,
        config: GrantConfig,
    ) -> Self {
        let audit = AuditLog::new(store.clone(), config.audit_cap);
        Self {
            entitlements: EntitlementStore::new(store.clone()),
            locks: GrantLockService::new(store.clone(), config.lock_ttl),
            retry: RetryQueue::new(store.clone(), audit.clone(), config.max_retries),
            resolver: ProductResolver::new(resolver_config),
            audit,
            store,
            processor,
            config,
        }
    }

    pub fn entitlements(&self) -> &EntitlementStore {
        &self.entitlements
    }

    pub fn locks(&self) -> &GrantLockService {
        &self.locks
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    fn timeout(&self) -> Duration {
        self.config.processor_timeout
    }

    /// The shared grant algorithm. `Ok(None)` when the resolver found nothing.
    pub async fn converge(
        &self,
        resolver: &dyn SessionResolver,
    ) -> BillingResult<Option<GrantOutcome>> {
        let source = resolver.source();
        let verified = bounded(
            self.timeout(),
            "resolve_session",
            resolver.resolve(self.processor.as_ref()),
        )
        .await?;

        match verified {
            Some(verified) => self.grant_verified(verified, source).await.map(Some),
            None => Ok(None),
        }
    }

    async fn grant_verified(
        &self,
        verified: VerifiedSession,
        source: GrantSource,
    ) -> BillingResult<GrantOutcome> {
        let VerifiedSession {
            session,
            user_id,
            event_id,
        } = verified;
        let session_id = session.id.as_str();

        if let Some(lock) = self.locks.get_lock_info(session_id).await? {
            tracing::debug!(
                session_id = %session_id,
                granted_by = %lock.source,
                source = %source,
                "Session already granted"
            );
            let current = self.entitlements.read(lock.user_id).await?;
            if current.has_session(session_id) || !source.recovers_lost_writes() {
                return Ok(GrantOutcome::already(current, session_id, Some(lock.product)));
            }

            // Lock held but the record never received the grant: the write
            // failed and its retry was lost, or a stale overwrite erased it.
            let age = OffsetDateTime::now_utc() - lock.granted_at;
            if age < self.config.recovery_grace {
                return Ok(GrantOutcome::already(current, session_id, Some(lock.product)));
            }
            let amount = charged_amount(&session, &current, lock.product);
            let recovered = self
                .catch_up(
                    lock.user_id,
                    lock.product,
                    session_id,
                    session.customer_id.clone(),
                    amount,
                    serde_json::json!({
                        "source": source,
                        "granted_by": lock.source,
                        "event_id": event_id,
                    }),
                )
                .await?;
            return Ok(match recovered {
                Some(record) => {
                    tracing::warn!(
                        user_id = %lock.user_id,
                        session_id = %session_id,
                        product = %lock.product,
                        source = %source,
                        "Restored grant missing from the entitlement record"
                    );
                    GrantOutcome {
                        granted: true,
                        already_granted: false,
                        tier: record.tier,
                        entitlement: record,
                        session_id: Some(session_id.to_string()),
                        product: Some(lock.product),
                        retry_enqueued: false,
                    }
                }
                None => GrantOutcome::already(current, session_id, Some(lock.product)),
            });
        }

        let current = self.entitlements.read(user_id).await?;
        if current.has_session(session_id) {
            return Ok(GrantOutcome::already(current, session_id, None));
        }

        let resolution = self.resolver.resolve(&session, &current)?;
        let product = resolution.product;
        let amount = charged_amount(&session, &current, product);
        let now = OffsetDateTime::now_utc();

        let mut next = current.clone();
        let changed = apply_product(
            &mut next,
            product,
            session_id,
            session.customer_id.clone(),
            amount,
            now,
        );

        if !self
            .locks
            .try_acquire(session_id, user_id, product, source)
            .await?
        {
            let current = self.entitlements.read(user_id).await?;
            return Ok(GrantOutcome::already(current, session_id, Some(product)));
        }

        if !changed {
            tracing::warn!(
                user_id = %user_id,
                session_id = %session_id,
                current_tier = %current.tier,
                product = %product,
                "Paid session does not raise the current tier, record left unchanged"
            );
            return Ok(GrantOutcome::already(current, session_id, Some(product)));
        }

        let mut retry_enqueued = false;
        match self.entitlements.write(&next).await {
            Ok(()) => {}
            Err(BillingError::StoreWriteFailed(reason)) => {
                tracing::error!(
                    user_id = %user_id,
                    session_id = %session_id,
                    product = %product,
                    error = %reason,
                    "RECONCILIATION NEEDED: grant lock held but entitlement write failed"
                );
                let item = RetryQueueItem::new(
                    event_id
                        .clone()
                        .unwrap_or_else(|| format!("{}:{}", source, session_id)),
                    user_id,
                    product,
                    session_id,
                )
                .customer(session.customer_id.clone())
                .amount(amount);
                match self.retry.enqueue(item).await {
                    Ok(_) => retry_enqueued = true,
                    Err(e) => tracing::error!(
                        user_id = %user_id,
                        session_id = %session_id,
                        error = %e,
                        "STRANDED PAYMENT: failed to queue grant retry"
                    ),
                }
            }
            Err(e) => return Err(e),
        }

        if let Some(customer_id) = &session.customer_id {
            if let Err(e) = self.entitlements.remember_customer(user_id, customer_id).await {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to remember processor customer");
            }
        }

        self.audit
            .record(
                user_id,
                AuditLogEntry::new(grant_action(&current, product))
                    .session(session_id)
                    .detail(serde_json::json!({
                        "source": source,
                        "product": product,
                        "resolved_by": resolution.resolved_by,
                        "amount_cents": amount,
                        "event_id": event_id,
                        "retry_enqueued": retry_enqueued,
                    })),
            )
            .await;

        tracing::info!(
            user_id = %user_id,
            session_id = %session_id,
            product = %product,
            source = %source,
            tier = %next.tier,
            "Entitlement granted"
        );

        Ok(GrantOutcome {
            granted: true,
            already_granted: false,
            tier: next.tier,
            entitlement: next,
            session_id: Some(session_id.to_string()),
            product: Some(product),
            retry_enqueued,
        })
    }

    /// Webhook path; the payload signature has already been verified
    pub async fn grant_pushed(
        &self,
        event_id: &str,
        session: PaymentSession,
    ) -> BillingResult<Option<GrantOutcome>> {
        self.converge(&PushedSession {
            event_id: event_id.to_string(),
            session,
        })
        .await
    }

    /// Redirect-sync path
    pub async fn sync_session(&self, user_id: Uuid, session_id: &str) -> BillingResult<GrantOutcome> {
        let resolver = RedirectSession {
            user_id,
            session_id: session_id.to_string(),
        };
        match self.converge(&resolver).await? {
            Some(outcome) => Ok(outcome),
            None => Ok(GrantOutcome::nothing_found(self.entitlements.read(user_id).await?)),
        }
    }

    async fn customer_search(
        &self,
        user_id: Uuid,
        email: Option<&str>,
        source: GrantSource,
    ) -> CustomerSearch {
        let known_customer_id = match self.entitlements.customer_for(user_id).await {
            Ok(customer) => customer,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Customer lookup failed");
                None
            }
        };
        CustomerSearch {
            user_id,
            email: email.map(str::to_string),
            known_customer_id,
            limit: self.config.search_limit,
            source,
        }
    }

    /// Manual reconcile. Processor trouble soft-fails to "nothing found".
    pub async fn reconcile(&self, user_id: Uuid, email: Option<&str>) -> BillingResult<GrantOutcome> {
        let search = self
            .customer_search(user_id, email, GrantSource::ManualReconcile)
            .await;
        match self.converge(&search).await {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => Ok(GrantOutcome::nothing_found(self.entitlements.read(user_id).await?)),
            Err(e) if e.is_soft() => {
                tracing::warn!(user_id = %user_id, error = %e, "Reconcile soft-failed");
                Ok(GrantOutcome::nothing_found(self.entitlements.read(user_id).await?))
            }
            Err(e) => Err(e),
        }
    }

    /// Read path with self-heal. A free record triggers a silent processor
    /// search at most once per cooldown window; any failure returns the
    /// record as read.
    pub async fn read_with_self_heal(
        &self,
        user_id: Uuid,
        email: Option<&str>,
    ) -> BillingResult<EntitlementRecord> {
        let record = self.entitlements.read(user_id).await?;
        if record.tier != Tier::Free {
            return Ok(record);
        }

        match self
            .store
            .set_if_absent(
                &keys::self_heal_cooldown(user_id),
                "1",
                Some(self.config.self_heal_cooldown),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => return Ok(record),
            Err(e) => {
                tracing::debug!(user_id = %user_id, error = %e, "Self-heal cooldown unavailable");
                return Ok(record);
            }
        }

        let search = self.customer_search(user_id, email, GrantSource::SelfHeal).await;
        match self.converge(&search).await {
            Ok(Some(outcome)) => {
                if outcome.granted {
                    tracing::info!(user_id = %user_id, tier = %outcome.tier, "Self-heal recovered a missed grant");
                }
                Ok(outcome.entitlement)
            }
            Ok(None) => Ok(record),
            Err(e) => {
                tracing::debug!(user_id = %user_id, error = %e, "Self-heal found nothing to grant");
                Ok(record)
            }
        }
    }

    /// GET reconcile: search and resolve without taking a lock or writing
    pub async fn diagnose(
        &self,
        user_id: Uuid,
        email: Option<&str>,
    ) -> BillingResult<ReconcileDiagnosis> {
        let current = self
            .entitlements
            .find(user_id)
            .await?
            .unwrap_or_else(|| EntitlementRecord::free(user_id));
        let search = self
            .customer_search(user_id, email, GrantSource::ManualReconcile)
            .await;

        let verified = match bounded(
            self.timeout(),
            "resolve_session",
            search.resolve(self.processor.as_ref()),
        )
        .await
        {
            Ok(v) => v,
            Err(e) if e.is_soft() => {
                return Ok(ReconcileDiagnosis {
                    current_tier: current.tier,
                    paid_session_found: false,
                    session_id: None,
                    product: None,
                    already_granted: false,
                    would_help: false,
                    detail: format!("payment processor unavailable: {}", e),
                })
            }
            Err(e) => return Err(e),
        };

        let Some(verified) = verified else {
            return Ok(ReconcileDiagnosis {
                current_tier: current.tier,
                paid_session_found: false,
                session_id: None,
                product: None,
                already_granted: false,
                would_help: false,
                detail: "no paid session found".into(),
            });
        };

        let session_id = verified.session.id.clone();
        let lock = self.locks.get_lock_info(&session_id).await?;
        let product = match &lock {
            Some(lock) => Some(lock.product),
            None => self
                .resolver
                .resolve(&verified.session, &current)
                .ok()
                .map(|r| r.product),
        };
        let raises = match product {
            Some(Product::Tier(tier)) => tier > current.tier,
            Some(Product::Addon(_)) => true,
            None => false,
        };
        let in_record = current.has_session(&session_id);
        let lost_write = lock.is_some() && !in_record && raises;
        let already_granted = in_record || (lock.is_some() && !lost_write);
        let would_help = !already_granted && raises;
        let detail = if already_granted {
            "latest paid session is already granted"
        } else if lost_write {
            "grant lock held but the entitlement is missing; reconcile would restore it"
        } else if product.is_none() {
            "paid session found but its product is indeterminate"
        } else if would_help {
            "reconcile would grant the latest paid session"
        } else {
            "latest paid session does not raise the current tier"
        };

        Ok(ReconcileDiagnosis {
            current_tier: current.tier,
            paid_session_found: true,
            session_id: Some(session_id),
            product,
            already_granted,
            would_help,
            detail: detail.to_string(),
        })
    }
}

#[async_trait]
impl RetryHandler for GrantEngine {
    async fn retry_grant(&self, item: &RetryQueueItem) -> BillingResult<()> {
        let product = item.product().ok_or_else(|| {
            BillingError::Internal(format!(
                "retry item has unknown product {}:{}",
                item.product_type, item.product_id
            ))
        })?;

        self.catch_up(
            item.user_id,
            product,
            &item.session_id,
            item.customer_id.clone(),
            item.amount_paid_cents,
            serde_json::json!({
                "event_id": item.event_id,
                "attempt": item.retry_count + 1,
            }),
        )
        .await?;
        Ok(())
    }
}

impl GrantEngine {
    /// Apply a grant whose lock is already held. `None` when the record
    /// already carries the session or the product would not change it.
    async fn catch_up(
        &self,
        user_id: Uuid,
        product: Product,
        session_id: &str,
        customer_id: Option<String>,
        amount_paid_cents: i64,
        detail: serde_json::Value,
    ) -> BillingResult<Option<EntitlementRecord>> {
        let mut record = self.entitlements.read(user_id).await?;
        if record.has_session(session_id) {
            return Ok(None);
        }

        let previous_tier = record.tier;
        let changed = apply_product(
            &mut record,
            product,
            session_id,
            customer_id,
            amount_paid_cents,
            OffsetDateTime::now_utc(),
        );
        if !changed {
            return Ok(None);
        }

        self.entitlements.write(&record).await?;
        self.audit
            .record(
                user_id,
                AuditLogEntry::new(AuditAction::GrantRecovered)
                    .session(session_id)
                    .detail(serde_json::json!({
                        "product": product,
                        "from_tier": previous_tier,
                        "context": detail,
                    })),
            )
            .await;
        Ok(Some(record))
    }
}

/// What the session actually charged, or the quote if the processor omitted it
fn charged_amount(session: &PaymentSession, current: &EntitlementRecord, product: Product) -> i64 {
    if let Some(amount) = session.amount_total_cents.filter(|a| *a > 0) {
        return amount;
    }
    match product {
        Product::Tier(tier) => proration::quote(current, tier)
            .map(|q| q.charge_cents)
            .unwrap_or_else(|_| price_for(tier)),
        Product::Addon(addon) => addon.price(),
    }
}

/// Returns whether the record changed
fn apply_product(
    record: &mut EntitlementRecord,
    product: Product,
    session_id: &str,
    customer_id: Option<String>,
    amount_cents: i64,
    now: OffsetDateTime,
) -> bool {
    match product {
        Product::Tier(tier) => {
            record.apply_tier_grant(tier, session_id, customer_id, amount_cents, now)
        }
        Product::Addon(addon) => {
            record.apply_addon(addon, session_id, now);
            true
        }
    }
}

fn grant_action(previous: &EntitlementRecord, product: Product) -> AuditAction {
    match product {
        Product::Addon(_) => AuditAction::AddonGranted,
        Product::Tier(_) if previous.tier.is_paid() => AuditAction::TierUpgraded,
        Product::Tier(_) => AuditAction::TierGranted,
    }
}
