//! Session token cache / provider.
//!
//! Wraps the negotiation engine behind a provider interface that returns a
//! currently-valid token, negotiating only on a cache miss or an explicit
//! renewal.
//!
//! The cache is a single slot. `get_token` checks it under the provider
//! mutex, but RELEASES the mutex before negotiating: concurrent misses are
//! therefore NOT de-duplicated - each caller negotiates independently and
//! the last writer owns the slot. That behavior is deliberate to preserve
//! here and is pinned down by tests rather than assumed away.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::debug;

use crate::budget::TimeBudget;
use crate::config::TokenPolicy;
use crate::error::{Error, Result};
use crate::negotiate::{NegotiationEngine, TrustDriver};
use crate::token::{effective_expiration, SecurityToken};

/// Boxed future returned by provider trait methods
pub type ProviderFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// Provider surface consumed by session channels.
pub trait SecurityTokenProvider: Send + Sync {
    /// Return a currently-valid token, negotiating if necessary.
    fn get_token(&self, timeout: Duration) -> ProviderFuture<'_, Arc<SecurityToken>>;

    /// Drop the cached token if it is the given one; unrelated tokens are
    /// a no-op.
    fn cancel_token<'a>(
        &'a self,
        token: &'a SecurityToken,
        timeout: Duration,
    ) -> ProviderFuture<'a, ()>;

    /// Obtain a replacement for `current`. Always negotiates; never served
    /// from the cache. Fails if no current token is supplied.
    fn renew_token<'a>(
        &'a self,
        timeout: Duration,
        current: Option<&'a SecurityToken>,
    ) -> ProviderFuture<'a, Arc<SecurityToken>>;
}

/// The provider's single cache slot.
#[derive(Debug, Clone)]
struct CachedToken {
    token: Arc<SecurityToken>,
    effective_expiration: DateTime<Utc>,
}

/// Token provider backed by the negotiation engine.
pub struct NegotiatingTokenProvider<D: TrustDriver> {
    engine: NegotiationEngine<D>,
    target: String,
    policy: TokenPolicy,
    cache: Mutex<Option<CachedToken>>,
}

impl<D: TrustDriver> NegotiatingTokenProvider<D> {
    /// Create a provider negotiating against `target`.
    pub fn new(engine: NegotiationEngine<D>, target: impl Into<String>, policy: TokenPolicy) -> Self {
        Self {
            engine,
            target: target.into(),
            policy,
            cache: Mutex::new(None),
        }
    }

    /// Target address tokens are negotiated for.
    pub fn target(&self) -> &str {
        &self.target
    }

    async fn negotiate_and_store(&self, budget: &TimeBudget) -> Result<Arc<SecurityToken>> {
        let token = Arc::new(self.engine.negotiate(&self.target, budget).await?);
        let expiration = effective_expiration(
            &token,
            self.policy.cache_threshold_pct,
            self.policy.max_caching(),
        );

        let mut cache = self.cache.lock().await;
        *cache = Some(CachedToken {
            token: token.clone(),
            effective_expiration: expiration,
        });
        debug!(target = %self.target, token = %token.id(), %expiration, "token cached");
        Ok(token)
    }
}

impl<D: TrustDriver + 'static> SecurityTokenProvider for NegotiatingTokenProvider<D> {
    fn get_token(&self, timeout: Duration) -> ProviderFuture<'_, Arc<SecurityToken>> {
        Box::pin(async move {
            let budget = TimeBudget::new(timeout);

            {
                let mut cache = self.cache.lock().await;
                if let Some(cached) = cache.as_ref() {
                    if Utc::now() <= cached.effective_expiration {
                        // Hit: no network I/O
                        return Ok(cached.token.clone());
                    }
                }
                // The slot may only hold a currently-valid token
                *cache = None;
                // Lock released here; concurrent misses each negotiate
            }

            self.negotiate_and_store(&budget).await
        })
    }

    fn cancel_token<'a>(
        &'a self,
        token: &'a SecurityToken,
        timeout: Duration,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let budget = TimeBudget::new(timeout);
            budget
                .run("token cancellation", async {
                    let mut cache = self.cache.lock().await;
                    let matches = cache
                        .as_ref()
                        .is_some_and(|cached| cached.token.id() == token.id());
                    if matches {
                        *cache = None;
                        debug!(target = %self.target, token = %token.id(), "cached token cancelled");
                    }
                    Ok(())
                })
                .await
        })
    }

    fn renew_token<'a>(
        &'a self,
        timeout: Duration,
        current: Option<&'a SecurityToken>,
    ) -> ProviderFuture<'a, Arc<SecurityToken>> {
        Box::pin(async move {
            let current = current.ok_or_else(|| Error::Negotiation {
                issuer: self.target.clone(),
                reason: "renewal requires the current session token".to_string(),
            })?;

            let budget = TimeBudget::new(timeout);
            debug!(target = %self.target, renewing = %current.id(), "renewing session token");
            self.negotiate_and_store(&budget).await
        })
    }
}
