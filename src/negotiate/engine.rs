//! The generic negotiation engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{NegotiationState, TrustDriver};
use crate::budget::TimeBudget;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::token::{KeyPolicy, SecurityToken};
use crate::transport::{TransportBinder, TransportChannel};

/// Drives a [`TrustDriver`]'s exchange over a transport channel until one
/// token is issued.
///
/// The engine opens a fresh channel per run, walks the legs strictly
/// sequentially under a shrinking [`TimeBudget`], validates the issued
/// token's key against the local policy, and releases the channel and the
/// negotiation state unconditionally, success or failure.
pub struct NegotiationEngine<D: TrustDriver> {
    driver: D,
    binder: Arc<dyn TransportBinder>,
    key_policy: KeyPolicy,
    message_ids: Arc<AtomicU64>,
}

impl<D: TrustDriver> NegotiationEngine<D> {
    /// Create an engine.
    ///
    /// `message_ids` is the process-scoped monotonic counter stamped onto
    /// outgoing legs; callers share one counter across components.
    pub fn new(
        driver: D,
        binder: Arc<dyn TransportBinder>,
        key_policy: KeyPolicy,
        message_ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            driver,
            binder,
            key_policy,
            message_ids,
        }
    }

    /// Run one negotiation against `target`.
    pub async fn negotiate(&self, target: &str, budget: &TimeBudget) -> Result<SecurityToken> {
        let mut state = self.driver.create_state(target)?;
        let issuer = state.remote_address().to_string();

        let channel = self
            .binder
            .create_channel(state.remote_address())
            .map_err(|e| e.with_issuer_context(&issuer))?;

        let result = self.run_exchange(&mut state, channel.as_ref(), budget).await;

        // Release the channel whatever happened; the state is dropped when
        // this function returns.
        match &result {
            Ok(_) => {
                if let Err(e) = channel.close(budget).await {
                    warn!(issuer = %issuer, error = %e, "closing negotiation channel failed, aborting");
                    channel.abort();
                }
            },
            Err(_) => channel.abort(),
        }

        let token = result.map_err(|e| match e {
            // Attach leg progress to timeout reports
            Error::Timeout {
                operation,
                remaining,
                ..
            } => Error::Timeout {
                operation,
                legs: state.legs(),
                remaining,
            },
            other => other.with_issuer_context(&issuer),
        })?;

        self.key_policy.validate(&token)?;
        debug!(issuer = %issuer, token = %token.id(), legs = state.legs(), "negotiation complete");
        Ok(token)
    }

    async fn run_exchange(
        &self,
        state: &mut NegotiationState<D::State>,
        channel: &dyn TransportChannel,
        budget: &TimeBudget,
    ) -> Result<SecurityToken> {
        channel.open(budget).await?;

        let mut incoming: Option<Message> = None;
        loop {
            let outgoing = match &incoming {
                None => Some(self.driver.first_message(state)?),
                Some(reply) => self.driver.next_message(state, reply)?,
            };

            let outgoing = match outgoing {
                Some(message) => message,
                None if self.driver.is_complete(state) => break,
                None => {
                    return Err(Error::Negotiation {
                        issuer: state.remote_address().to_string(),
                        reason: "driver produced no next message while the exchange is incomplete"
                            .to_string(),
                    })
                },
            };

            let outgoing =
                outgoing.with_message_id(self.message_ids.fetch_add(1, Ordering::Relaxed));
            debug!(
                leg = state.legs(),
                issuer = %state.remote_address(),
                "sending negotiation leg"
            );

            let reply = channel.request(outgoing, budget).await?;
            // The previous incoming message is replaced (and thereby closed)
            // here; a missing reply is a protocol failure, not a timeout.
            incoming = Some(reply.ok_or_else(|| Error::NoReply {
                issuer: state.remote_address().to_string(),
            })?);
            state.add_round_trip();
        }

        state.take_issued().ok_or_else(|| Error::Negotiation {
            issuer: state.remote_address().to_string(),
            reason: "exchange completed without an issued token".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{NegotiationBody, TokenAssertion};
    use crate::token::{SymmetricKey, TokenId};
    use crate::transport::MemoryListener;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    /// Driver that completes after one round trip, or never asks for
    /// anything when `stalls` is set.
    struct TestDriver {
        stalls: bool,
    }

    impl TrustDriver for TestDriver {
        type State = ();

        fn create_state(&self, target: &str) -> Result<NegotiationState<()>> {
            Ok(NegotiationState::new(target, ()))
        }

        fn first_message(&self, _state: &mut NegotiationState<()>) -> Result<Message> {
            Ok(Message::negotiation(NegotiationBody {
                context_id: None,
                round: 1,
                payload: serde_json::json!({"request": "issue"}),
                token: None,
            }))
        }

        fn next_message(
            &self,
            state: &mut NegotiationState<()>,
            incoming: &Message,
        ) -> Result<Option<Message>> {
            if self.stalls {
                return Ok(None);
            }
            let body = incoming
                .negotiation_body()
                .ok_or_else(|| Error::Protocol("reply is not a negotiation message".into()))?;
            let assertion = body
                .token
                .as_ref()
                .ok_or_else(|| Error::Protocol("reply carries no token".into()))?;

            let keys = assertion
                .keys
                .iter()
                .map(|k| Ok(SymmetricKey::new(BASE64.decode(k)?)))
                .collect::<Result<Vec<_>>>()?;
            state.complete_with(SecurityToken::new(
                TokenId::new(assertion.id.clone()),
                assertion.valid_from,
                assertion.valid_to,
                keys,
            ));
            Ok(None)
        }
    }

    fn issuer_reply(id: &str) -> Message {
        let now = Utc::now();
        Message::negotiation(NegotiationBody {
            context_id: None,
            round: 2,
            payload: serde_json::json!({}),
            token: Some(TokenAssertion {
                id: id.to_string(),
                valid_from: now,
                valid_to: now + ChronoDuration::hours(1),
                keys: vec![BASE64.encode([7u8; 32])],
                fingerprint: None,
            }),
        })
    }

    fn engine(driver: TestDriver, binder: Arc<dyn TransportBinder>) -> NegotiationEngine<TestDriver> {
        NegotiationEngine::new(
            driver,
            binder,
            KeyPolicy::default(),
            Arc::new(AtomicU64::new(1)),
        )
    }

    #[tokio::test]
    async fn test_single_round_trip_issue() {
        let (binder, mut listener) = MemoryListener::bind("mem://issuer");

        tokio::spawn(async move {
            let server = listener.accept().await.unwrap();
            let budget = TimeBudget::new(Duration::from_secs(1));
            let request = server.try_receive(&budget).await.unwrap().unwrap();
            assert_eq!(request.negotiation_body().unwrap().round, 1);
            server.send(issuer_reply("tok-1"), &budget).await.unwrap();
        });

        let engine = engine(TestDriver { stalls: false }, Arc::new(binder));
        let budget = TimeBudget::new(Duration::from_secs(2));
        let token = engine.negotiate("mem://issuer", &budget).await.unwrap();
        assert_eq!(token.id().as_str(), "tok-1");
    }

    #[tokio::test]
    async fn test_stalled_driver_is_protocol_failure() {
        let (binder, mut listener) = MemoryListener::bind("mem://issuer");

        tokio::spawn(async move {
            let server = listener.accept().await.unwrap();
            let budget = TimeBudget::new(Duration::from_secs(1));
            let _request = server.try_receive(&budget).await.unwrap().unwrap();
            server.send(issuer_reply("tok-1"), &budget).await.unwrap();
        });

        let engine = engine(TestDriver { stalls: true }, Arc::new(binder));
        let budget = TimeBudget::new(Duration::from_secs(2));
        let err = engine.negotiate("mem://issuer", &budget).await.unwrap_err();
        assert!(matches!(err, Error::Negotiation { .. }));
        assert!(err.to_string().contains("incomplete"));
    }

    #[tokio::test]
    async fn test_no_reply_is_distinct_failure() {
        let (binder, mut listener) = MemoryListener::bind("mem://issuer");

        tokio::spawn(async move {
            // Receive the request, then drop the channel without replying
            let server = listener.accept().await.unwrap();
            let budget = TimeBudget::new(Duration::from_secs(1));
            let _request = server.try_receive(&budget).await.unwrap().unwrap();
            drop(server);
        });

        let engine = engine(TestDriver { stalls: false }, Arc::new(binder));
        let budget = TimeBudget::new(Duration::from_secs(2));
        let err = engine.negotiate("mem://issuer", &budget).await.unwrap_err();
        assert!(matches!(err, Error::NoReply { .. }));
    }

    #[tokio::test]
    async fn test_timeout_reports_completed_legs() {
        let (binder, mut listener) = MemoryListener::bind("mem://issuer");

        tokio::spawn(async move {
            // Accept and stay silent: the client must time out
            let server = listener.accept().await.unwrap();
            let budget = TimeBudget::new(Duration::from_secs(5));
            let _request = server.try_receive(&budget).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let engine = engine(TestDriver { stalls: false }, Arc::new(binder));
        let budget = TimeBudget::new(Duration::from_millis(50));
        let err = engine.negotiate("mem://issuer", &budget).await.unwrap_err();
        match err {
            Error::Timeout { legs, .. } => assert_eq!(legs, 1),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_key_size_rejected() {
        let (binder, mut listener) = MemoryListener::bind("mem://issuer");

        tokio::spawn(async move {
            let server = listener.accept().await.unwrap();
            let budget = TimeBudget::new(Duration::from_secs(1));
            let _request = server.try_receive(&budget).await.unwrap().unwrap();
            let now = Utc::now();
            let reply = Message::negotiation(NegotiationBody {
                context_id: None,
                round: 2,
                payload: serde_json::json!({}),
                token: Some(TokenAssertion {
                    id: "tok-short".to_string(),
                    valid_from: now,
                    valid_to: now + ChronoDuration::hours(1),
                    keys: vec![BASE64.encode([7u8; 5])],
                    fingerprint: None,
                }),
            });
            server.send(reply, &budget).await.unwrap();
        });

        let engine = engine(TestDriver { stalls: false }, Arc::new(binder));
        let budget = TimeBudget::new(Duration::from_secs(2));
        let err = engine.negotiate("mem://issuer", &budget).await.unwrap_err();
        assert!(matches!(err, Error::SecurityPolicy(_)));
    }
}
