//! Store key layout
//!
//! All persisted state lives under these namespaces.

use uuid::Uuid;

/// One EntitlementRecord per user
pub fn entitlement(user_id: Uuid) -> String {
    format!("entitlement:{}", user_id)
}

/// One GrantLock per payment session
pub fn grant_lock(session_id: &str) -> String {
    format!("grant:lock:{}", session_id)
}

/// Append-only audit list per user
pub fn audit(user_id: Uuid) -> String {
    format!("audit:{}", user_id)
}

/// Processor customer id remembered for a user
pub fn customer(user_id: Uuid) -> String {
    format!("customer:{}", user_id)
}

/// Cooldown marker for self-heal lookups
pub fn self_heal_cooldown(user_id: Uuid) -> String {
    format!("selfheal:cooldown:{}", user_id)
}

pub const RETRY_QUEUE: &str = "grant:retry:queue";
pub const DEAD_LETTER_QUEUE: &str = "grant:retry:dead";

/// Marks an event id as currently queued for retry
pub fn retry_marker(event_id: &str) -> String {
    format!("grant:retry:queued:{}", event_id)
}
