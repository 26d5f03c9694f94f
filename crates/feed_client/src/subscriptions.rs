use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::domain::{Credential, EventCategory, SessionId, SubscriptionId};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscription request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feed rejected {category}: HTTP {status}: {body}")]
    Rejected {
        category: &'static str,
        status: u16,
        body: String,
    },
    #[error("feed accepted {category} but returned no subscription id")]
    MissingId { category: &'static str },
    #[error("feed refused to remove {id}: HTTP {status}")]
    RemovalRejected { id: SubscriptionId, status: u16 },
}

/// Registration endpoint of the feed.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    async fn create(
        &self,
        credential: &Credential,
        session_id: &SessionId,
        category: EventCategory,
    ) -> Result<SubscriptionId, SubscriptionError>;

    async fn remove(
        &self,
        credential: &Credential,
        id: &SubscriptionId,
    ) -> Result<(), SubscriptionError>;
}

#[derive(Debug, Serialize)]
struct CreateSubscriptionRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    version: &'static str,
    condition: Condition<'a>,
    transport: TransportBinding<'a>,
}

#[derive(Debug, Serialize)]
struct Condition<'a> {
    broadcaster_user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct TransportBinding<'a> {
    method: &'static str,
    session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateSubscriptionResponse {
    #[serde(default)]
    data: Vec<CreatedSubscription>,
}

#[derive(Debug, Deserialize)]
struct CreatedSubscription {
    id: SubscriptionId,
}

/// [`SubscriptionApi`] over the feed's HTTP registration endpoint.
pub struct HttpSubscriptionApi {
    http: Client,
    base_url: String,
}

impl HttpSubscriptionApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/eventsub/subscriptions", self.base_url)
    }
}

#[async_trait]
impl SubscriptionApi for HttpSubscriptionApi {
    async fn create(
        &self,
        credential: &Credential,
        session_id: &SessionId,
        category: EventCategory,
    ) -> Result<SubscriptionId, SubscriptionError> {
        let res = self
            .http
            .post(self.endpoint())
            .header("Client-ID", &credential.client_id)
            .bearer_auth(&credential.access_token)
            .json(&CreateSubscriptionRequest {
                kind: category.as_str(),
                version: category.version(),
                condition: Condition {
                    broadcaster_user_id: &credential.broadcaster_id,
                },
                transport: TransportBinding {
                    method: "websocket",
                    session_id: session_id.as_str(),
                },
            })
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SubscriptionError::Rejected {
                category: category.as_str(),
                status: status.as_u16(),
                body,
            });
        }

        let body: CreateSubscriptionResponse = res.json().await?;
        body.data
            .into_iter()
            .next()
            .map(|created| created.id)
            .ok_or(SubscriptionError::MissingId {
                category: category.as_str(),
            })
    }

    async fn remove(
        &self,
        credential: &Credential,
        id: &SubscriptionId,
    ) -> Result<(), SubscriptionError> {
        let res = self
            .http
            .delete(self.endpoint())
            .query(&[("id", id.as_str())])
            .header("Client-ID", &credential.client_id)
            .bearer_auth(&credential.access_token)
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            return Err(SubscriptionError::RemovalRejected {
                id: id.clone(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub category: EventCategory,
    pub broadcaster_id: String,
    pub session_id: SessionId,
}

/// Outcome of registering a batch of categories against one session.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub session_id: Option<SessionId>,
    pub created: Vec<Subscription>,
    pub failed: Vec<(EventCategory, String)>,
}

/// Issues one registration per category. A rejected category is logged and
/// the rest still go through.
pub async fn register(
    api: &dyn SubscriptionApi,
    credential: &Credential,
    session_id: &SessionId,
    categories: &[EventCategory],
) -> Registration {
    let mut registration = Registration {
        session_id: Some(session_id.clone()),
        ..Registration::default()
    };
    for &category in categories {
        match api.create(credential, session_id, category).await {
            Ok(id) => {
                info!(%session_id, category = category.as_str(), %id, "subscribed");
                registration.created.push(Subscription {
                    id,
                    category,
                    broadcaster_id: credential.broadcaster_id.clone(),
                    session_id: session_id.clone(),
                });
            }
            Err(error) => {
                warn!(%session_id, category = category.as_str(), %error, "subscription rejected");
                registration.failed.push((category, error.to_string()));
            }
        }
    }
    registration
}

/// Owns the set of live subscriptions for the current session.
pub struct SubscriptionManager {
    api: Arc<dyn SubscriptionApi>,
    active: HashMap<SubscriptionId, Subscription>,
}

impl SubscriptionManager {
    pub fn new(api: Arc<dyn SubscriptionApi>) -> Self {
        Self {
            api,
            active: HashMap::new(),
        }
    }

    pub fn api(&self) -> Arc<dyn SubscriptionApi> {
        Arc::clone(&self.api)
    }

    pub fn record(&mut self, registration: Registration) {
        for subscription in registration.created {
            self.active.insert(subscription.id.clone(), subscription);
        }
    }

    /// Drops exactly `id` from the active set.
    pub fn revoke(&mut self, id: &SubscriptionId) -> bool {
        self.active.remove(id).is_some()
    }

    /// Forgets every subscription without contacting the feed, for sessions
    /// that are already gone.
    pub fn forget_all(&mut self) {
        if !self.active.is_empty() {
            info!(count = self.active.len(), "discarding subscriptions of closed session");
        }
        self.active.clear();
    }

    /// Requests removal of every recorded subscription once, concurrently.
    /// Failures are logged and not retried. Removals still pending after
    /// `budget` are abandoned; the set is empty either way.
    pub async fn teardown(&mut self, credential: &Credential, budget: Duration) {
        let active: Vec<_> = self.active.drain().collect();
        if active.is_empty() {
            return;
        }
        let count = active.len();
        let api = self.api.as_ref();
        let removals = join_all(active.into_iter().map(|(id, subscription)| async move {
            match api.remove(credential, &id).await {
                Ok(()) => info!(%id, category = subscription.category.as_str(), "unsubscribed"),
                Err(error) => warn!(%id, %error, "failed to remove subscription"),
            }
        }));
        if tokio::time::timeout(budget, removals).await.is_err() {
            warn!(
                count,
                budget_ms = budget.as_millis() as u64,
                "subscription removal still pending; abandoning"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/subscriptions_tests.rs"]
mod tests;
