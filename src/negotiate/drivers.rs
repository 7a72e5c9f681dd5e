//! Reference trust drivers.
//!
//! Two protocol flavors over the shared [`Message`] envelope:
//!
//! - [`SimpleIssueDriver`]: one round trip, the issuer returns a token
//!   directly. No correlation context is created.
//! - [`ChallengeResponseDriver`]: the issuer replies with a nonce that the
//!   client must echo before the token is released. Multi-leg, so a
//!   correlation context ID ties the legs together.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;

use super::{NegotiationState, TrustDriver};
use crate::error::{Error, Result};
use crate::message::{Message, NegotiationBody, TokenAssertion};
use crate::token::{SecurityToken, SymmetricKey, TokenId};

/// Convert a wire token assertion into a [`SecurityToken`].
pub(crate) fn token_from_assertion(assertion: &TokenAssertion) -> Result<SecurityToken> {
    let keys = assertion
        .keys
        .iter()
        .map(|k| Ok(SymmetricKey::new(BASE64.decode(k)?)))
        .collect::<Result<Vec<_>>>()?;

    let mut token = SecurityToken::new(
        TokenId::new(assertion.id.clone()),
        assertion.valid_from,
        assertion.valid_to,
        keys,
    );
    if let Some(fp) = &assertion.fingerprint {
        token = token.with_fingerprint(fp.clone());
    }
    Ok(token)
}

fn assertion_from_reply(incoming: &Message) -> Result<&TokenAssertion> {
    incoming
        .negotiation_body()
        .ok_or_else(|| Error::Protocol("negotiation reply carries no negotiation body".into()))?
        .token
        .as_ref()
        .ok_or_else(|| Error::Protocol("negotiation reply carries no issued token".into()))
}

/// Single-round-trip issuance: request in, token out.
#[derive(Debug, Clone)]
pub struct SimpleIssueDriver {
    /// Key size to request, in bits
    key_bits: u16,
}

impl SimpleIssueDriver {
    /// Create a driver requesting keys of `key_bits` bits.
    pub fn new(key_bits: u16) -> Self {
        Self { key_bits }
    }
}

impl Default for SimpleIssueDriver {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TrustDriver for SimpleIssueDriver {
    type State = ();

    fn create_state(&self, target: &str) -> Result<NegotiationState<()>> {
        Ok(NegotiationState::new(target, ()))
    }

    fn first_message(&self, state: &mut NegotiationState<()>) -> Result<Message> {
        Ok(Message::negotiation(NegotiationBody {
            context_id: None,
            round: 1,
            payload: serde_json::json!({
                "request": "issue",
                "target": state.target_address(),
                "key_bits": self.key_bits,
            }),
            token: None,
        }))
    }

    fn next_message(
        &self,
        state: &mut NegotiationState<()>,
        incoming: &Message,
    ) -> Result<Option<Message>> {
        let assertion = assertion_from_reply(incoming)?;
        state.complete_with(token_from_assertion(assertion)?);
        Ok(None)
    }
}

/// Per-run state of the challenge exchange
#[derive(Debug, Default)]
pub struct ChallengeState {
    /// Server nonce received on leg 2, echoed on leg 3
    server_nonce: Option<String>,
}

/// Two-round-trip issuance: the issuer challenges with a nonce before
/// releasing the token.
#[derive(Debug, Clone)]
pub struct ChallengeResponseDriver {
    key_bits: u16,
}

impl ChallengeResponseDriver {
    /// Create a driver requesting keys of `key_bits` bits.
    pub fn new(key_bits: u16) -> Self {
        Self { key_bits }
    }
}

impl Default for ChallengeResponseDriver {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TrustDriver for ChallengeResponseDriver {
    type State = ChallengeState;

    fn create_state(&self, target: &str) -> Result<NegotiationState<ChallengeState>> {
        let mut state = NegotiationState::new(target, ChallengeState::default());
        // Multi-leg exchange: a correlation context ties the legs together
        state.set_context_id(uuid::Uuid::new_v4().to_string());
        Ok(state)
    }

    fn first_message(&self, state: &mut NegotiationState<ChallengeState>) -> Result<Message> {
        let mut client_nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut client_nonce);

        Ok(Message::negotiation(NegotiationBody {
            context_id: state.context_id().map(String::from),
            round: 1,
            payload: serde_json::json!({
                "request": "challenge-issue",
                "target": state.target_address(),
                "key_bits": self.key_bits,
                "client_nonce": BASE64.encode(client_nonce),
            }),
            token: None,
        }))
    }

    fn next_message(
        &self,
        state: &mut NegotiationState<ChallengeState>,
        incoming: &Message,
    ) -> Result<Option<Message>> {
        let body = incoming
            .negotiation_body()
            .ok_or_else(|| Error::Protocol("negotiation reply carries no negotiation body".into()))?;

        if body.context_id.as_deref() != state.context_id() {
            return Err(Error::Protocol(format!(
                "negotiation reply correlates to context {:?}, expected {:?}",
                body.context_id,
                state.context_id()
            )));
        }

        if state.inner().server_nonce.is_none() {
            // Leg 2: the challenge. Echo the nonce back on leg 3.
            let nonce = body
                .payload
                .get("nonce")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Protocol("challenge reply carries no nonce".into()))?
                .to_string();

            let reply = Message::negotiation(NegotiationBody {
                context_id: state.context_id().map(String::from),
                round: body.round + 1,
                payload: serde_json::json!({ "nonce_echo": nonce }),
                token: None,
            });
            state.inner_mut().server_nonce = Some(nonce);
            return Ok(Some(reply));
        }

        // Leg 4: the issued token
        let assertion = assertion_from_reply(incoming)?;
        state.complete_with(token_from_assertion(assertion)?);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn assertion(id: &str) -> TokenAssertion {
        let now = Utc::now();
        TokenAssertion {
            id: id.to_string(),
            valid_from: now,
            valid_to: now + ChronoDuration::hours(1),
            keys: vec![BASE64.encode([3u8; 32])],
            fingerprint: Some("ab12".to_string()),
        }
    }

    #[test]
    fn test_simple_issue_completes_on_first_reply() {
        let driver = SimpleIssueDriver::default();
        let mut state = driver.create_state("mem://svc").unwrap();

        let first = driver.first_message(&mut state).unwrap();
        let body = first.negotiation_body().unwrap();
        assert_eq!(body.round, 1);
        // Single round trip: no correlation context
        assert!(body.context_id.is_none());

        let reply = Message::negotiation(NegotiationBody {
            context_id: None,
            round: 2,
            payload: serde_json::json!({}),
            token: Some(assertion("tok-1")),
        });
        let next = driver.next_message(&mut state, &reply).unwrap();
        assert!(next.is_none());
        assert!(driver.is_complete(&state));
    }

    #[test]
    fn test_token_from_assertion_decodes_keys_and_fingerprint() {
        let token = token_from_assertion(&assertion("tok-9")).unwrap();
        assert_eq!(token.id().as_str(), "tok-9");
        assert_eq!(token.keys().len(), 1);
        assert_eq!(token.keys()[0].bit_len(), 256);
        assert_eq!(token.fingerprint(), Some("ab12"));
    }

    #[test]
    fn test_challenge_driver_echoes_nonce() {
        let driver = ChallengeResponseDriver::default();
        let mut state = driver.create_state("mem://svc").unwrap();
        // Multi-leg exchange: a correlation context is generated
        let context = state.context_id().map(String::from);
        assert!(context.is_some());

        let first = driver.first_message(&mut state).unwrap();
        assert_eq!(first.negotiation_body().unwrap().context_id, context);

        let challenge = Message::negotiation(NegotiationBody {
            context_id: context.clone(),
            round: 2,
            payload: serde_json::json!({"nonce": "c2VydmVyLW5vbmNl"}),
            token: None,
        });
        let echo = driver
            .next_message(&mut state, &challenge)
            .unwrap()
            .expect("leg 3 expected");
        let body = echo.negotiation_body().unwrap();
        assert_eq!(body.payload["nonce_echo"], "c2VydmVyLW5vbmNl");
        assert!(!driver.is_complete(&state));

        let issue = Message::negotiation(NegotiationBody {
            context_id: context,
            round: 4,
            payload: serde_json::json!({}),
            token: Some(assertion("tok-2")),
        });
        let done = driver.next_message(&mut state, &issue).unwrap();
        assert!(done.is_none());
        assert!(driver.is_complete(&state));
    }

    #[test]
    fn test_challenge_driver_rejects_wrong_context() {
        let driver = ChallengeResponseDriver::default();
        let mut state = driver.create_state("mem://svc").unwrap();
        let _first = driver.first_message(&mut state).unwrap();

        let stray = Message::negotiation(NegotiationBody {
            context_id: Some("some-other-context".to_string()),
            round: 2,
            payload: serde_json::json!({"nonce": "x"}),
            token: None,
        });
        let err = driver.next_message(&mut state, &stray).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
