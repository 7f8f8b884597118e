// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Grant Engine
//!
//! Tests race conditions and failure paths in:
//! - Concurrent convergence (GRANT-C01 to GRANT-C03)
//! - Retry queue and dead letter (GRANT-Q01 to GRANT-Q04)
//! - Lost grant writes restored by reconcile and self-heal (GRANT-R01 to GRANT-R03)
//! - Proration through real grants (GRANT-P01 to GRANT-P02)
//! - Ownership and soft failure (GRANT-O01 to GRANT-O05)
//! - Webhooks (GRANT-W01 to GRANT-W04)

#[cfg(test)]
mod support {
    use std::sync::Arc;
    use std::time::Duration;

    use tierlock_shared::MemoryStore;

    use crate::config::{GrantConfig, ProductResolverConfig};
    use crate::convergence::GrantEngine;
    use crate::testing::MockProcessor;

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub processor: Arc<MockProcessor>,
        pub engine: Arc<GrantEngine>,
    }

    pub fn harness() -> Harness {
        harness_with(GrantConfig {
            processor_timeout: Duration::from_millis(200),
            ..GrantConfig::default()
        })
    }

    pub fn harness_with(config: GrantConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(MockProcessor::new());
        let engine = Arc::new(GrantEngine::new(
            store.clone(),
            processor.clone(),
            ProductResolverConfig::default(),
            config,
        ));
        Harness {
            store,
            processor,
            engine,
        }
    }
}

#[cfg(test)]
mod convergence_tests {
    use std::sync::Arc;

    use tokio::sync::Barrier;
    use uuid::Uuid;

    use super::support::harness;
    use crate::catalog::{Product, Tier};
    use crate::keys;
    use crate::testing::paid_session;

    // =========================================================================
    // GRANT-C01: All four paths race on one session - exactly one grant
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_paths_grant_at_most_once() {
        let h = harness();
        let user = Uuid::new_v4();
        let mut session = paid_session("cs_test_race", user, Product::Tier(Tier::Pro));
        session.customer_email = Some("buyer@example.com".into());
        h.processor.add_session(session.clone()).await;

        let barrier = Arc::new(Barrier::new(9));
        let mut handles = vec![];

        for i in 0..9 {
            let engine = Arc::clone(&h.engine);
            let barrier = Arc::clone(&barrier);
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                match i % 3 {
                    0 => engine
                        .grant_pushed("evt_race", session)
                        .await
                        .unwrap()
                        .unwrap()
                        .granted,
                    1 => engine.sync_session(user, "cs_test_race").await.unwrap().granted,
                    _ => {
                        engine
                            .reconcile(user, Some("buyer@example.com"))
                            .await
                            .unwrap()
                            .granted
                    }
                }
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 1, "Exactly one path should perform the grant");
        assert_eq!(h.store.write_count(&keys::entitlement(user)).await, 1);
        let record = h.engine.entitlements().read(user).await.unwrap();
        assert_eq!(record.tier, Tier::Pro);
    }

    // =========================================================================
    // GRANT-C02: Second sync with the same session is a no-op
    // =========================================================================
    #[tokio::test]
    async fn test_resync_reports_already_granted_without_writing() {
        let h = harness();
        let user = Uuid::new_v4();
        h.processor
            .add_session(paid_session("cs_test_once", user, Product::Tier(Tier::Starter)))
            .await;

        let first = h.engine.sync_session(user, "cs_test_once").await.unwrap();
        assert!(first.granted);
        assert!(!first.already_granted);

        let second = h.engine.sync_session(user, "cs_test_once").await.unwrap();
        assert!(!second.granted);
        assert!(second.already_granted);
        assert_eq!(second.tier, Tier::Starter);

        assert_eq!(h.store.write_count(&keys::entitlement(user)).await, 1);
    }

    // =========================================================================
    // GRANT-C03: A session for a lower tier never downgrades
    // =========================================================================
    #[tokio::test]
    async fn test_lower_tier_session_leaves_record_unchanged() {
        let h = harness();
        let user = Uuid::new_v4();
        h.processor
            .add_session(paid_session("cs_test_high", user, Product::Tier(Tier::Ultimate)))
            .await;
        h.processor
            .add_session(paid_session("cs_test_low", user, Product::Tier(Tier::Starter)))
            .await;

        h.engine.sync_session(user, "cs_test_high").await.unwrap();
        let low = h.engine.sync_session(user, "cs_test_low").await.unwrap();

        assert!(!low.granted);
        assert_eq!(low.tier, Tier::Ultimate);
        assert_eq!(h.store.write_count(&keys::entitlement(user)).await, 1);
    }
}

#[cfg(test)]
mod retry_queue_tests {
    use uuid::Uuid;

    use super::support::harness;
    use crate::audit::AuditAction;
    use crate::catalog::{Product, Tier};
    use crate::retry::{ProcessedOutcome, RetryQueueItem, RetryStatus};
    use crate::testing::paid_session;

    fn poison(event_id: &str) -> RetryQueueItem {
        let mut item = RetryQueueItem::new(
            event_id,
            Uuid::new_v4(),
            Product::Tier(Tier::Pro),
            "cs_test_poison",
        );
        item.product_id = "platinum".into();
        item
    }

    // =========================================================================
    // GRANT-Q01: [bad, good1, good2] - bad goes to the tail, goods proceed
    // =========================================================================
    #[tokio::test]
    async fn test_poison_item_does_not_block_queue() {
        let h = harness();
        let queue = h.engine.retry_queue();
        let good_user_1 = Uuid::new_v4();
        let good_user_2 = Uuid::new_v4();

        queue.enqueue(poison("bad")).await.unwrap();
        queue
            .enqueue(RetryQueueItem::new("good1", good_user_1, Product::Tier(Tier::Pro), "cs_test_g1"))
            .await
            .unwrap();
        queue
            .enqueue(RetryQueueItem::new(
                "good2",
                good_user_2,
                Product::Tier(Tier::Starter),
                "cs_test_g2",
            ))
            .await
            .unwrap();

        let report = queue.drain(3, h.engine.as_ref()).await.unwrap();

        let processed: Vec<(String, ProcessedOutcome)> = report
            .processed
            .iter()
            .map(|p| (p.event_id.clone(), p.outcome))
            .collect();
        assert_eq!(
            processed,
            vec![
                ("bad".to_string(), ProcessedOutcome::Failed),
                ("good1".to_string(), ProcessedOutcome::Success),
                ("good2".to_string(), ProcessedOutcome::Success),
            ]
        );

        let snapshot = queue.inspect(10).await.unwrap();
        let remaining: Vec<&str> = snapshot.pending.iter().map(|i| i.event_id.as_str()).collect();
        assert_eq!(remaining, vec!["bad"]);
        assert_eq!(snapshot.pending[0].retry_count, 1);

        assert_eq!(
            h.engine.entitlements().read(good_user_1).await.unwrap().tier,
            Tier::Pro
        );
        assert_eq!(
            h.engine.entitlements().read(good_user_2).await.unwrap().tier,
            Tier::Starter
        );
    }

    // =========================================================================
    // GRANT-Q02: Six consecutive failures - dead letter, gone from main queue
    // =========================================================================
    #[tokio::test]
    async fn test_dead_letter_after_six_failures() {
        let h = harness();
        let queue = h.engine.retry_queue();
        let item = poison("evt_doomed");
        let user = item.user_id;
        queue.enqueue(item).await.unwrap();

        for attempt in 1..=5 {
            let report = queue.drain(10, h.engine.as_ref()).await.unwrap();
            assert_eq!(report.count(ProcessedOutcome::Failed), 1, "attempt {}", attempt);
            assert_eq!(report.remaining, 1);
        }

        let report = queue.drain(10, h.engine.as_ref()).await.unwrap();
        assert_eq!(report.count(ProcessedOutcome::DeadLettered), 1);

        let snapshot = queue.inspect(10).await.unwrap();
        assert_eq!(snapshot.pending_len, 0);
        assert_eq!(snapshot.dead_letter_len, 1);
        assert_eq!(snapshot.dead_letter[0].retry_count, 6);
        assert_eq!(snapshot.dead_letter[0].status, RetryStatus::DeadLettered);

        let audit = h.engine.audit().recent(user, 10).await.unwrap();
        assert!(audit.iter().any(|e| e.action == AuditAction::GrantDeadLettered));

        // Dead letter is not auto-retried
        let report = queue.drain(10, h.engine.as_ref()).await.unwrap();
        assert!(report.processed.is_empty());
    }

    // =========================================================================
    // GRANT-Q03: Record write fails after lock - success reported, retry catches up
    // =========================================================================
    #[tokio::test]
    async fn test_failed_write_is_promised_and_recovered() {
        let h = harness();
        let user = Uuid::new_v4();
        h.processor
            .add_session(paid_session("cs_test_flaky", user, Product::Tier(Tier::Pro)))
            .await;
        h.store.fail_sets_with_prefix("entitlement:").await;

        let outcome = h.engine.sync_session(user, "cs_test_flaky").await.unwrap();
        assert!(outcome.granted, "Grant is promised once the lock is held");
        assert!(outcome.retry_enqueued);
        assert_eq!(outcome.tier, Tier::Pro);
        assert_eq!(
            h.engine.entitlements().read(user).await.unwrap().tier,
            Tier::Free
        );

        let snapshot = h.engine.retry_queue().inspect(10).await.unwrap();
        assert_eq!(snapshot.pending_len, 1);
        assert_eq!(snapshot.pending[0].event_id, "redirect_sync:cs_test_flaky");

        // A retry while the store is still failing goes back to the tail
        let report = h.engine.retry_queue().drain(10, h.engine.as_ref()).await.unwrap();
        assert_eq!(report.count(ProcessedOutcome::Failed), 1);

        h.store.clear_failures().await;
        let report = h.engine.retry_queue().drain(10, h.engine.as_ref()).await.unwrap();
        assert_eq!(report.count(ProcessedOutcome::Success), 1);
        assert_eq!(report.remaining, 0);

        let record = h.engine.entitlements().read(user).await.unwrap();
        assert_eq!(record.tier, Tier::Pro);
        assert!(record.has_session("cs_test_flaky"));

        let audit = h.engine.audit().recent(user, 10).await.unwrap();
        assert!(audit.iter().any(|e| e.action == AuditAction::GrantRecovered));
    }

    // =========================================================================
    // GRANT-Q04: Retrying an already-applied item is a no-op success
    // =========================================================================
    #[tokio::test]
    async fn test_retry_of_applied_grant_is_noop() {
        let h = harness();
        let user = Uuid::new_v4();
        h.processor
            .add_session(paid_session("cs_test_done", user, Product::Tier(Tier::Starter)))
            .await;
        h.engine.sync_session(user, "cs_test_done").await.unwrap();

        h.engine
            .retry_queue()
            .enqueue(RetryQueueItem::new("evt_late", user, Product::Tier(Tier::Starter), "cs_test_done"))
            .await
            .unwrap();
        let report = h.engine.retry_queue().drain(10, h.engine.as_ref()).await.unwrap();
        assert_eq!(report.count(ProcessedOutcome::Success), 1);
        assert_eq!(
            h.store
                .write_count(&crate::keys::entitlement(user))
                .await,
            1
        );
    }
}

#[cfg(test)]
mod recovery_tests {
    use std::time::Duration;

    use tierlock_shared::KvStore;
    use uuid::Uuid;

    use super::support::{harness, harness_with, Harness};
    use crate::audit::AuditAction;
    use crate::catalog::{Product, Tier};
    use crate::config::GrantConfig;
    use crate::entitlement::EntitlementRecord;
    use crate::keys;
    use crate::processor::PaymentSession;
    use crate::testing::paid_session;

    const EMAIL: &str = "lost@example.com";

    /// Locks count as stale immediately
    fn recovering_harness() -> Harness {
        harness_with(GrantConfig {
            processor_timeout: Duration::from_millis(200),
            recovery_grace: Duration::ZERO,
            ..GrantConfig::default()
        })
    }

    fn owned_session(session_id: &str, user: Uuid, tier: Tier) -> PaymentSession {
        let mut session = paid_session(session_id, user, Product::Tier(tier));
        session.customer_email = Some(EMAIL.into());
        session
    }

    // =========================================================================
    // GRANT-R01: Write failed and the retry item vanished - reconcile restores
    // =========================================================================
    #[tokio::test]
    async fn test_reconcile_restores_grant_after_retry_item_lost() {
        let h = recovering_harness();
        let user = Uuid::new_v4();
        h.processor.add_session(owned_session("cs_test_lostitem", user, Tier::Pro)).await;

        h.store.fail_sets_with_prefix("entitlement:").await;
        let outcome = h.engine.sync_session(user, "cs_test_lostitem").await.unwrap();
        assert!(outcome.granted);
        assert!(outcome.retry_enqueued);
        h.store.clear_failures().await;

        // Crash between pop and re-push
        let popped = h.store.pop_front(keys::RETRY_QUEUE).await.unwrap();
        assert!(popped.is_some());
        assert_eq!(h.engine.retry_queue().inspect(10).await.unwrap().pending_len, 0);

        let outcome = h.engine.reconcile(user, Some(EMAIL)).await.unwrap();
        assert!(outcome.granted);
        assert_eq!(outcome.tier, Tier::Pro);

        let record = h.engine.entitlements().read(user).await.unwrap();
        assert_eq!(record.tier, Tier::Pro);
        assert!(record.has_session("cs_test_lostitem"));
        let audit = h.engine.audit().recent(user, 10).await.unwrap();
        assert!(audit.iter().any(|e| e.action == AuditAction::GrantRecovered));

        // Once restored, a second reconcile is a plain no-op
        let again = h.engine.reconcile(user, Some(EMAIL)).await.unwrap();
        assert!(!again.granted);
        assert!(again.already_granted);
    }

    // =========================================================================
    // GRANT-R02: Same lost write, recovered transparently on read
    // =========================================================================
    #[tokio::test]
    async fn test_self_heal_restores_grant_after_retry_item_lost() {
        let h = recovering_harness();
        let user = Uuid::new_v4();
        h.processor.add_session(owned_session("cs_test_lostread", user, Tier::Starter)).await;

        h.store.fail_sets_with_prefix("entitlement:").await;
        h.engine.sync_session(user, "cs_test_lostread").await.unwrap();
        h.store.clear_failures().await;
        h.store.pop_front(keys::RETRY_QUEUE).await.unwrap();

        let record = h.engine.read_with_self_heal(user, Some(EMAIL)).await.unwrap();
        assert_eq!(record.tier, Tier::Starter);
    }

    // =========================================================================
    // GRANT-R03: Stale full-record overwrite after a grant - reconcile restores
    // =========================================================================
    #[tokio::test]
    async fn test_reconcile_restores_grant_erased_by_stale_overwrite() {
        let h = recovering_harness();
        let user = Uuid::new_v4();
        h.processor.add_session(owned_session("cs_test_stale", user, Tier::Pro)).await;
        h.engine.sync_session(user, "cs_test_stale").await.unwrap();

        // A writer that read the record before the grant lands last
        h.engine
            .entitlements()
            .write(&EntitlementRecord::free(user))
            .await
            .unwrap();
        assert_eq!(h.engine.entitlements().read(user).await.unwrap().tier, Tier::Free);

        let diagnosis = h.engine.diagnose(user, Some(EMAIL)).await.unwrap();
        assert!(!diagnosis.already_granted);
        assert!(diagnosis.would_help);

        let outcome = h.engine.reconcile(user, Some(EMAIL)).await.unwrap();
        assert!(outcome.granted);
        assert_eq!(outcome.tier, Tier::Pro);
        assert_eq!(h.engine.entitlements().read(user).await.unwrap().tier, Tier::Pro);
    }

    #[tokio::test]
    async fn test_fresh_lock_is_not_recovered_within_grace() {
        let h = harness();
        let user = Uuid::new_v4();
        h.processor.add_session(owned_session("cs_test_inflight", user, Tier::Pro)).await;

        h.store.fail_sets_with_prefix("entitlement:").await;
        h.engine.sync_session(user, "cs_test_inflight").await.unwrap();
        h.store.clear_failures().await;

        let outcome = h.engine.reconcile(user, Some(EMAIL)).await.unwrap();
        assert!(!outcome.granted);
        assert!(outcome.already_granted);
        assert_eq!(h.store.write_count(&keys::entitlement(user)).await, 0);
    }

    #[tokio::test]
    async fn test_redirect_resync_does_not_restore() {
        let h = recovering_harness();
        let user = Uuid::new_v4();
        h.processor.add_session(owned_session("cs_test_resync", user, Tier::Pro)).await;
        h.engine.sync_session(user, "cs_test_resync").await.unwrap();
        h.engine
            .entitlements()
            .write(&EntitlementRecord::free(user))
            .await
            .unwrap();

        let outcome = h.engine.sync_session(user, "cs_test_resync").await.unwrap();
        assert!(outcome.already_granted);
        assert_eq!(outcome.tier, Tier::Free);
    }
}

#[cfg(test)]
mod proration_tests {
    use uuid::Uuid;

    use super::support::harness;
    use crate::audit::AuditLog;
    use crate::catalog::{Product, Quota, Tier, ANALYSES};
    use crate::proration::{quote, ProrationError};
    use crate::testing::paid_session;
    use crate::usage::EntitlementService;

    // =========================================================================
    // GRANT-P01: $39 tier, upgrade to $89 tier costs $50, then already owned
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_charge_then_already_owned() {
        let h = harness();
        let user = Uuid::new_v4();
        h.processor
            .add_session(paid_session("cs_test_t1", user, Product::Tier(Tier::Starter)))
            .await;
        h.engine.sync_session(user, "cs_test_t1").await.unwrap();

        let record = h.engine.entitlements().read(user).await.unwrap();
        let upgrade = quote(&record, Tier::Pro).unwrap();
        assert_eq!(upgrade.charge_cents, 5_000);

        let mut session = paid_session("cs_test_t2", user, Product::Tier(Tier::Pro));
        session.amount_total_cents = Some(upgrade.charge_cents);
        h.processor.add_session(session).await;
        let outcome = h.engine.sync_session(user, "cs_test_t2").await.unwrap();
        assert!(outcome.granted);

        let meta = outcome.entitlement.purchase_meta.clone().unwrap();
        assert!(meta.is_upgrade);
        assert_eq!(meta.upgraded_from, Some(Tier::Starter));
        assert_eq!(meta.amount_paid_cents, 8_900);

        assert_eq!(
            quote(&outcome.entitlement, Tier::Pro),
            Err(ProrationError::AlreadyOwned { tier: Tier::Pro })
        );
    }

    // =========================================================================
    // GRANT-P02: 2 of 3 remaining, upgrade to unlimited tier - unlimited
    // =========================================================================
    #[tokio::test]
    async fn test_unlimited_tier_absorbs_usage() {
        let h = harness();
        let user = Uuid::new_v4();
        let usage = EntitlementService::new(h.store.clone(), AuditLog::new(h.store.clone(), 50));

        h.processor
            .add_session(paid_session("cs_test_s", user, Product::Tier(Tier::Starter)))
            .await;
        h.engine.sync_session(user, "cs_test_s").await.unwrap();

        let spent = usage.consume(user, ANALYSES).await.unwrap();
        assert_eq!(spent.remaining, Some(Quota::Limited(2)));

        let mut session = paid_session("cs_test_u", user, Product::Tier(Tier::Ultimate));
        session.amount_total_cents = Some(11_000);
        h.processor.add_session(session).await;
        let outcome = h.engine.sync_session(user, "cs_test_u").await.unwrap();

        let counter = &outcome.entitlement.usage_counters[ANALYSES];
        assert_eq!(counter.remaining, Quota::Unlimited);
        assert_eq!(counter.used, 1);
    }
}

#[cfg(test)]
mod ownership_tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::support::harness;
    use crate::catalog::{Product, Tier};
    use crate::error::BillingError;
    use crate::keys;
    use crate::processor::PaymentSession;
    use crate::testing::paid_session;

    // =========================================================================
    // GRANT-O01: Reconcile finds a session whose user and email both mismatch
    // =========================================================================
    #[tokio::test]
    async fn test_reconcile_rejects_unowned_session() {
        let h = harness();
        let caller = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        h.engine
            .entitlements()
            .remember_customer(caller, "cus_shared")
            .await
            .unwrap();

        let mut session = paid_session("cs_test_theirs", stranger, Product::Tier(Tier::Ultimate));
        session.customer_id = Some("cus_shared".into());
        session.customer_email = Some("stranger@example.com".into());
        h.processor.add_session(session).await;

        let result = h.engine.reconcile(caller, Some("caller@example.com")).await;
        assert!(matches!(result, Err(BillingError::SessionOwnershipUnverifiable)));

        assert!(h.engine.locks().get_lock_info("cs_test_theirs").await.unwrap().is_none());
        assert_eq!(h.store.write_count(&keys::entitlement(caller)).await, 0);
    }

    // =========================================================================
    // GRANT-O02: Customer id plus email match is enough without embedded user
    // =========================================================================
    #[tokio::test]
    async fn test_reconcile_accepts_customer_and_email_match() {
        let h = harness();
        let user = Uuid::new_v4();
        h.engine
            .entitlements()
            .remember_customer(user, "cus_mine")
            .await
            .unwrap();

        let mut session = paid_session("cs_test_mine", Uuid::new_v4(), Product::Tier(Tier::Pro));
        session.metadata.remove("user_id");
        session.customer_id = Some("cus_mine".into());
        session.customer_email = Some("Me@Example.com".into());
        h.processor.add_session(session).await;

        let outcome = h.engine.reconcile(user, Some("me@example.com")).await.unwrap();
        assert!(outcome.granted);
        assert_eq!(outcome.tier, Tier::Pro);
    }

    // =========================================================================
    // GRANT-O03: Redirect sync with someone else's session id
    // =========================================================================
    #[tokio::test]
    async fn test_sync_rejects_harvested_session() {
        let h = harness();
        let victim = Uuid::new_v4();
        h.processor
            .add_session(paid_session("cs_test_victim", victim, Product::Tier(Tier::Pro)))
            .await;

        let result = h.engine.sync_session(Uuid::new_v4(), "cs_test_victim").await;
        assert!(matches!(result, Err(BillingError::SessionOwnershipUnverifiable)));
        assert!(h.engine.locks().get_lock_info("cs_test_victim").await.unwrap().is_none());
    }

    // =========================================================================
    // GRANT-O04: Slow processor - reconcile soft-fails, sync reports the failure
    // =========================================================================
    #[tokio::test]
    async fn test_processor_timeout_soft_fails_reconcile() {
        let h = harness();
        let user = Uuid::new_v4();
        h.processor
            .add_session(paid_session("cs_test_slow", user, Product::Tier(Tier::Pro)))
            .await;
        h.processor.set_latency(Duration::from_millis(500)).await;

        let outcome = h.engine.reconcile(user, Some("x@example.com")).await.unwrap();
        assert!(!outcome.granted);
        assert_eq!(outcome.tier, Tier::Free);

        let result = h.engine.sync_session(user, "cs_test_slow").await;
        assert!(matches!(result, Err(BillingError::ExternalQueryFailed(_))));

        let healed = h.engine.read_with_self_heal(user, Some("x@example.com")).await.unwrap();
        assert_eq!(healed.tier, Tier::Free);
    }

    // =========================================================================
    // GRANT-O05: Missing metadata and unknown amount - indeterminate, no lock
    // =========================================================================
    #[tokio::test]
    async fn test_indeterminate_product_takes_no_lock() {
        let h = harness();
        let user = Uuid::new_v4();
        let mut session: PaymentSession =
            paid_session("cs_test_odd", user, Product::Tier(Tier::Pro));
        session.metadata.remove("product_type");
        session.metadata.remove("product_id");
        session.amount_total_cents = Some(12_345);
        h.processor.add_session(session).await;

        let result = h.engine.sync_session(user, "cs_test_odd").await;
        assert!(matches!(result, Err(BillingError::IndeterminateProduct(_))));
        assert!(h.engine.locks().get_lock_info("cs_test_odd").await.unwrap().is_none());
    }

    // =========================================================================
    // Self-heal respects its cooldown
    // =========================================================================
    #[tokio::test]
    async fn test_self_heal_runs_once_per_cooldown() {
        let h = harness();
        let user = Uuid::new_v4();

        h.engine.read_with_self_heal(user, Some("nobody@example.com")).await.unwrap();
        let calls = h.processor.calls();
        assert_eq!(calls, 1);

        h.engine.read_with_self_heal(user, Some("nobody@example.com")).await.unwrap();
        assert_eq!(h.processor.calls(), calls);
    }

    #[tokio::test]
    async fn test_self_heal_recovers_missed_webhook() {
        let h = harness();
        let user = Uuid::new_v4();
        let mut session = paid_session("cs_test_missed", user, Product::Tier(Tier::Starter));
        session.customer_email = Some("late@example.com".into());
        h.processor.add_session(session).await;

        let record = h
            .engine
            .read_with_self_heal(user, Some("late@example.com"))
            .await
            .unwrap();
        assert_eq!(record.tier, Tier::Starter);
    }

    #[tokio::test]
    async fn test_diagnosis_does_not_mutate() {
        let h = harness();
        let user = Uuid::new_v4();
        let mut session = paid_session("cs_test_diag", user, Product::Tier(Tier::Pro));
        session.customer_email = Some("d@example.com".into());
        h.processor.add_session(session).await;

        let diagnosis = h.engine.diagnose(user, Some("d@example.com")).await.unwrap();
        assert!(diagnosis.paid_session_found);
        assert!(diagnosis.would_help);
        assert_eq!(diagnosis.product, Some(Product::Tier(Tier::Pro)));

        assert!(h.engine.locks().get_lock_info("cs_test_diag").await.unwrap().is_none());
        assert!(h.engine.entitlements().find(user).await.unwrap().is_none());
    }
}

#[cfg(test)]
mod webhook_tests {
    use std::sync::Arc;

    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::support::harness;
    use crate::audit::AuditAction;
    use crate::catalog::Tier;
    use crate::error::BillingError;
    use crate::testing::sign_payload;
    use crate::webhooks::{WebhookDisposition, WebhookHandler};

    const SECRET: &str = "whsec_edge";

    fn checkout_payload(event_id: &str, session_id: &str, user: Uuid) -> String {
        serde_json::json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": session_id,
                "payment_status": "paid",
                "amount_total": 8900,
                "customer": "cus_wh",
                "metadata": {
                    "user_id": user.to_string(),
                    "product_type": "tier",
                    "product_id": "pro"
                }
            }}
        })
        .to_string()
    }

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    // =========================================================================
    // GRANT-W01: Signed checkout grants; redelivery is already granted
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_webhook_grants_once() {
        let h = harness();
        let handler = WebhookHandler::new(Arc::clone(&h.engine), SECRET);
        let user = Uuid::new_v4();
        let payload = checkout_payload("evt_1", "cs_test_wh", user);

        let event = handler
            .verify_event(&payload, &sign_payload(&payload, SECRET, now()))
            .unwrap();
        assert_eq!(
            handler.handle_event(event.clone()).await.unwrap(),
            WebhookDisposition::Granted
        );
        assert_eq!(
            handler.handle_event(event).await.unwrap(),
            WebhookDisposition::AlreadyGranted
        );

        assert_eq!(h.engine.entitlements().read(user).await.unwrap().tier, Tier::Pro);
        assert_eq!(
            h.engine.entitlements().customer_for(user).await.unwrap().as_deref(),
            Some("cus_wh")
        );
    }

    // =========================================================================
    // GRANT-W02: Bad signature - rejected before anything is read
    // =========================================================================
    #[tokio::test]
    async fn test_forged_webhook_rejected() {
        let h = harness();
        let handler = WebhookHandler::new(Arc::clone(&h.engine), SECRET);
        let user = Uuid::new_v4();
        let payload = checkout_payload("evt_forged", "cs_test_forged", user);

        let result = handler.verify_event(&payload, &sign_payload(&payload, "whsec_wrong", now()));
        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
        assert!(h.engine.entitlements().find(user).await.unwrap().is_none());
    }

    // =========================================================================
    // GRANT-W03: Subscription events are ignored
    // =========================================================================
    #[tokio::test]
    async fn test_subscription_event_ignored() {
        let h = harness();
        let handler = WebhookHandler::new(Arc::clone(&h.engine), SECRET);
        let payload = serde_json::json!({
            "id": "evt_sub",
            "type": "customer.subscription.created",
            "data": { "object": { "id": "sub_1" } }
        })
        .to_string();

        let event = handler
            .verify_event(&payload, &sign_payload(&payload, SECRET, now()))
            .unwrap();
        assert_eq!(
            handler.handle_event(event).await.unwrap(),
            WebhookDisposition::Ignored
        );
    }

    // =========================================================================
    // GRANT-W04: Refunds are audited, access untouched
    // =========================================================================
    #[tokio::test]
    async fn test_refund_is_logged_not_enforced() {
        let h = harness();
        let handler = WebhookHandler::new(Arc::clone(&h.engine), SECRET);
        let user = Uuid::new_v4();

        let checkout = checkout_payload("evt_buy", "cs_test_refunded", user);
        let event = handler
            .verify_event(&checkout, &sign_payload(&checkout, SECRET, now()))
            .unwrap();
        handler.handle_event(event).await.unwrap();

        let refund = serde_json::json!({
            "id": "evt_refund",
            "type": "charge.refunded",
            "data": { "object": {
                "id": "ch_1",
                "customer": "cus_wh",
                "amount_refunded": 8900,
                "metadata": { "user_id": user.to_string() }
            }}
        })
        .to_string();
        let event = handler
            .verify_event(&refund, &sign_payload(&refund, SECRET, now()))
            .unwrap();
        assert_eq!(
            handler.handle_event(event).await.unwrap(),
            WebhookDisposition::Logged
        );

        let record = h.engine.entitlements().read(user).await.unwrap();
        assert_eq!(record.tier, Tier::Pro);
        assert!(!record.access_revoked);

        let audit = h.engine.audit().recent(user, 10).await.unwrap();
        assert!(audit.iter().any(|e| e.action == AuditAction::RefundObserved));
    }
}
