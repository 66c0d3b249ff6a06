// 💳 Billing Client - Ledger + plan catalog from the billing provider
//
// Failure signals the rest of the engine depends on:
//   401 / 403          → SyncError::AuthExpired (fatal, session must be renewed)
//   404                → Ok(None), the subscriber is unknown to the provider
//   any other non-2xx  → SyncError::Transient
//
// Every request goes through the shared RateLimiter.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::BillingConfig;
use crate::error::{Result, SyncError};
use crate::ledger::SupporterRecord;
use crate::plan::{PlanFeeMap, PlanId};
use crate::rate_limiter::RateLimiter;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        SubscriberId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of the creator's current plan catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogPlan {
    pub fee: i64,
    #[serde(rename = "id")]
    pub plan_id: PlanId,
}

pub fn catalog_to_fee_map(catalog: &[CatalogPlan]) -> PlanFeeMap {
    catalog
        .iter()
        .map(|plan| (plan.fee, plan.plan_id.clone()))
        .collect()
}

#[async_trait]
pub trait BillingClient: Send + Sync {
    /// None when the provider does not know the subscriber.
    async fn get_ledger(&self, subscriber: &SubscriberId) -> Result<Option<SupporterRecord>>;

    async fn get_catalog(&self) -> Result<Vec<CatalogPlan>>;
}

// ============================================================================
// FANBOX HTTP CLIENT
// ============================================================================

/// Responses are wrapped as `{"body": ...}`
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    body: T,
}

pub struct FanboxClient {
    client: Client,
    base_url: String,
    creator_id: String,
    cookie_header: Option<String>,
    session_headers: Vec<(String, String)>,
    limiter: Arc<RateLimiter>,
}

impl FanboxClient {
    pub fn new(config: &BillingConfig, limiter: Arc<RateLimiter>) -> Result<FanboxClient> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        let cookie_header = if config.session_cookies.is_empty() {
            None
        } else {
            Some(
                config
                    .session_cookies
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        };

        let base_url = if config.base_url.ends_with('/') {
            config.base_url.clone()
        } else {
            format!("{}/", config.base_url)
        };

        Ok(FanboxClient {
            client,
            base_url,
            creator_id: config.creator_id.clone(),
            cookie_header,
            session_headers: config
                .session_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            limiter,
        })
    }

    fn request(&self, path: &str, query: &[(&str, &str)]) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .header(header::ACCEPT, "application/json");

        if let Some(cookie) = &self.cookie_header {
            builder = builder.header(header::COOKIE, cookie);
        }
        for (name, value) in &self.session_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    /// GET through the rate limiter, unwrapping the envelope. 404 → None.
    async fn fetch<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<Option<T>> {
        let response = self.limiter.limit(self.request(path, query).send()).await?;
        let status = response.status();

        debug!(path = path, status = %status, "billing response");

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::AuthExpired(format!(
                "billing API answered {} for {}; session_cookies must be renewed",
                status, path
            )));
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(path = path, status = %status, "unexpected billing status");
            return Err(SyncError::Transient(format!("HTTP {}: {}", status, body)));
        }

        let envelope: Envelope<T> = serde_json::from_str(&response.text().await?)?;
        Ok(Some(envelope.body))
    }
}

#[async_trait]
impl BillingClient for FanboxClient {
    async fn get_ledger(&self, subscriber: &SubscriberId) -> Result<Option<SupporterRecord>> {
        self.fetch("legacy/manage/supporter/user", &[("userId", subscriber.as_str())])
            .await
    }

    async fn get_catalog(&self) -> Result<Vec<CatalogPlan>> {
        let plans: Option<Vec<CatalogPlan>> = self
            .fetch("plan.listCreator", &[("creatorId", self.creator_id.as_str())])
            .await?;
        Ok(plans.unwrap_or_default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
