//! Stripe client wrapper

use async_trait::async_trait;
use stripe::{
    CheckoutSession, CheckoutSessionId, CheckoutSessionPaymentStatus, Client, Customer,
    CustomerId, ListCheckoutSessions, ListCustomers,
};

use crate::config::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::processor::{bounded, PaymentProcessor, PaymentSession, SessionQuery};

/// Customers matched per email lookup; emails are rarely shared by more
const CUSTOMERS_PER_EMAIL: u64 = 5;

/// Stripe API client with our configuration attached
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    async fn sessions_for_customer(
        &self,
        customer_id: &str,
        limit: u64,
    ) -> BillingResult<Vec<PaymentSession>> {
        let customer = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID: {}", e)))?;

        let params = ListCheckoutSessions {
            customer: Some(customer),
            limit: Some(limit),
            expand: &["data.line_items"],
            ..Default::default()
        };

        let list = bounded(self.config.api_timeout, "list_checkout_sessions", async {
            Ok(CheckoutSession::list(&self.client, &params).await?)
        })
        .await?;

        Ok(list.data.into_iter().map(to_payment_session).collect())
    }

    async fn customers_by_email(&self, email: &str) -> BillingResult<Vec<String>> {
        let params = ListCustomers {
            email: Some(email),
            limit: Some(CUSTOMERS_PER_EMAIL),
            ..Default::default()
        };

        let list = bounded(self.config.api_timeout, "list_customers", async {
            Ok(Customer::list(&self.client, &params).await?)
        })
        .await?;

        Ok(list.data.into_iter().map(|c| c.id.to_string()).collect())
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn retrieve_session(&self, session_id: &str) -> BillingResult<Option<PaymentSession>> {
        let id = session_id
            .parse::<CheckoutSessionId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid session ID: {}", e)))?;

        let result = bounded(self.config.api_timeout, "retrieve_checkout_session", async {
            match CheckoutSession::retrieve(&self.client, &id, &["line_items"]).await {
                Ok(session) => Ok(Some(session)),
                Err(stripe::StripeError::Stripe(err)) if err.http_status == 404 => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await?;

        Ok(result.map(to_payment_session))
    }

    async fn list_sessions(&self, query: &SessionQuery) -> BillingResult<Vec<PaymentSession>> {
        let limit = query.limit.clamp(1, 100);
        let mut customers = Vec::new();

        if let Some(customer_id) = &query.customer_id {
            customers.push(customer_id.clone());
        }
        if let Some(email) = &query.email {
            for id in self.customers_by_email(email).await? {
                if !customers.contains(&id) {
                    customers.push(id);
                }
            }
        }

        let mut sessions = Vec::new();
        for customer_id in &customers {
            sessions.extend(self.sessions_for_customer(customer_id, limit).await?);
        }
        sessions.sort_by(|a, b| b.created.cmp(&a.created));

        tracing::debug!(
            customers = customers.len(),
            sessions = sessions.len(),
            "Listed checkout sessions"
        );

        Ok(sessions)
    }
}

fn to_payment_session(session: CheckoutSession) -> PaymentSession {
    let customer_id = match &session.customer {
        Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
        Some(stripe::Expandable::Object(c)) => Some(c.id.to_string()),
        None => None,
    };
    let customer_email = session
        .customer_details
        .as_ref()
        .and_then(|d| d.email.clone())
        .or_else(|| session.customer_email.clone());
    let price_ids = session
        .line_items
        .as_ref()
        .map(|items| {
            items
                .data
                .iter()
                .filter_map(|item| item.price.as_ref().map(|p| p.id.to_string()))
                .collect()
        })
        .unwrap_or_default();

    PaymentSession {
        id: session.id.to_string(),
        paid: session.payment_status == CheckoutSessionPaymentStatus::Paid,
        customer_id,
        customer_email,
        amount_total_cents: session.amount_total,
        currency: session.currency.map(|c| c.to_string()),
        created: session.created,
        metadata: session.metadata.clone().unwrap_or_default(),
        price_ids,
        client_reference_id: session.client_reference_id.clone(),
    }
}
