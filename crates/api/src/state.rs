//! Application state

use std::sync::Arc;

use tierlock_billing::BillingService;
use tierlock_shared::{RateLimiter, SharedStore};

use crate::auth::JwtManager;
use crate::config::Config;

/// Shared application state, built once at startup and cloned per request
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: SharedStore,
    pub billing: Arc<BillingService>,
    pub jwt: Arc<JwtManager>,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub fn new(config: Config, store: SharedStore, billing: BillingService) -> Self {
        tracing::info!("Initializing JWT manager...");
        let jwt = Arc::new(JwtManager::new(&config.jwt_secret));

        tracing::info!(
            sync_limit = config.rate_limit.sync_per_window,
            reconcile_limit = config.rate_limit.reconcile_per_window,
            window_secs = config.rate_limit.window.as_secs(),
            "Initializing rate limiter..."
        );
        let rate_limiter = RateLimiter::new(store.clone(), "billing");

        Self {
            config: Arc::new(config),
            store,
            billing: Arc::new(billing),
            jwt,
            rate_limiter,
        }
    }
}
