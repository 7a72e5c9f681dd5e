//! Protocol messages for the secure-conversation control plane.
//!
//! Defines the envelope exchanged over a session channel and during token
//! negotiation. The envelope carries a logical action, an optional session
//! context, an optional security header stamped by the message-security
//! engine, and an action-specific body.

use serde::{Deserialize, Serialize};

/// Logical actions a message can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Token negotiation leg (request or response)
    Negotiation,
    /// Application payload
    Application,
    /// Session close request
    Close,
    /// Answer to a close this side received
    CloseResponse,
    /// Session fault raised by the peer
    Fault,
}

/// Message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Logical action
    pub action: Action,
    /// Session context ID (absent before a session is established)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Monotonic message ID assigned by the sender
    #[serde(default)]
    pub message_id: u64,
    /// Security header stamped by the message-security engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityHeader>,
    /// Action-specific body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    /// Timestamp (Unix millis)
    pub timestamp: u64,
}

/// Body variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Body {
    /// Negotiation leg payload
    Negotiation(NegotiationBody),
    /// Close / close-response target
    Close(CloseBody),
    /// Fault report
    Fault(FaultInfo),
    /// Application content
    Application(ApplicationBody),
}

/// Security header attached to a secured message.
///
/// The message-security engine fills this in on the outgoing path and
/// checks it on the incoming path; the control plane treats the tag as
/// opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityHeader {
    /// ID of the session token the message was secured with
    pub token_id: String,
    /// Integrity tag (base64)
    pub tag: String,
}

/// One leg of a token negotiation exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationBody {
    /// Correlation context ID (present only for multi-leg exchanges)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    /// Round number within the exchange, starting at 1
    pub round: u32,
    /// Driver-specific payload
    pub payload: serde_json::Value,
    /// Issued token, present on the final response leg
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenAssertion>,
}

/// Wire form of an issued session token.
///
/// Key material travels base64-encoded; validity instants are RFC 3339.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenAssertion {
    /// Token identifier
    pub id: String,
    /// Start of the validity interval
    pub valid_from: chrono::DateTime<chrono::Utc>,
    /// End of the validity interval
    pub valid_to: chrono::DateTime<chrono::Utc>,
    /// Symmetric keys (base64)
    pub keys: Vec<String>,
    /// Issuer certificate fingerprint (hex), for the legacy comparison path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Close / close-response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseBody {
    /// Session the close targets
    pub target: String,
}

/// Fault report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultInfo {
    /// Fault code
    pub code: FaultCode,
    /// Human-readable detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Session fault codes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultCode {
    /// The peer wants this side to renew the session key before sending again
    KeyRenewalNeeded,
    /// The peer aborted the session; the channel must fault
    SessionAborted,
    /// Any other fault; passed through to the caller unchanged
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for FaultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultCode::KeyRenewalNeeded => write!(f, "KEY_RENEWAL_NEEDED"),
            FaultCode::SessionAborted => write!(f, "SESSION_ABORTED"),
            FaultCode::Other(code) => write!(f, "{code}"),
        }
    }
}

/// Application payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationBody {
    /// Caller-provided content
    pub content: String,
}

impl Message {
    /// Create a negotiation leg message
    pub fn negotiation(body: NegotiationBody) -> Self {
        Self {
            action: Action::Negotiation,
            session_id: None,
            message_id: 0,
            security: None,
            body: Some(Body::Negotiation(body)),
            timestamp: current_timestamp(),
        }
    }

    /// Create an application message
    pub fn application(session_id: &str, content: impl Into<String>) -> Self {
        Self {
            action: Action::Application,
            session_id: Some(session_id.to_string()),
            message_id: 0,
            security: None,
            body: Some(Body::Application(ApplicationBody {
                content: content.into(),
            })),
            timestamp: current_timestamp(),
        }
    }

    /// Create a CLOSE message targeting a session
    pub fn close(session_id: &str) -> Self {
        Self {
            action: Action::Close,
            session_id: Some(session_id.to_string()),
            message_id: 0,
            security: None,
            body: Some(Body::Close(CloseBody {
                target: session_id.to_string(),
            })),
            timestamp: current_timestamp(),
        }
    }

    /// Create a CLOSE_RESPONSE message answering a close
    pub fn close_response(session_id: &str) -> Self {
        Self {
            action: Action::CloseResponse,
            session_id: Some(session_id.to_string()),
            message_id: 0,
            security: None,
            body: Some(Body::Close(CloseBody {
                target: session_id.to_string(),
            })),
            timestamp: current_timestamp(),
        }
    }

    /// Create a FAULT message
    pub fn fault(session_id: &str, code: FaultCode, detail: Option<String>) -> Self {
        Self {
            action: Action::Fault,
            session_id: Some(session_id.to_string()),
            message_id: 0,
            security: None,
            body: Some(Body::Fault(FaultInfo { code, detail })),
            timestamp: current_timestamp(),
        }
    }

    /// Set the sender-assigned message ID
    pub fn with_message_id(mut self, id: u64) -> Self {
        self.message_id = id;
        self
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Get the negotiation body
    pub fn negotiation_body(&self) -> Option<&NegotiationBody> {
        match &self.body {
            Some(Body::Negotiation(body)) => Some(body),
            _ => None,
        }
    }

    /// Get the close target, for CLOSE and CLOSE_RESPONSE messages
    pub fn close_target(&self) -> Option<&str> {
        match &self.body {
            Some(Body::Close(body)) => Some(&body.target),
            _ => None,
        }
    }

    /// Get the fault info
    pub fn fault_info(&self) -> Option<&FaultInfo> {
        match &self.body {
            Some(Body::Fault(info)) => Some(info),
            _ => None,
        }
    }

    /// Get the application content
    pub fn application_content(&self) -> Option<&str> {
        match &self.body {
            Some(Body::Application(body)) => Some(&body.content),
            _ => None,
        }
    }
}

/// Get current timestamp in milliseconds
fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_message() {
        let msg = Message::close("session-123");
        assert_eq!(msg.action, Action::Close);
        assert_eq!(msg.session_id, Some("session-123".to_string()));
        assert_eq!(msg.close_target(), Some("session-123"));
    }

    #[test]
    fn test_close_response_targets_session() {
        let msg = Message::close_response("session-123");
        assert_eq!(msg.action, Action::CloseResponse);
        assert_eq!(msg.close_target(), Some("session-123"));
    }

    #[test]
    fn test_fault_codes_roundtrip() {
        let msg = Message::fault(
            "session-123",
            FaultCode::KeyRenewalNeeded,
            Some("key generation exhausted".to_string()),
        );

        let json = msg.to_json().unwrap();
        assert!(json.contains("KEY_RENEWAL_NEEDED"));

        let parsed = Message::from_json(&json).unwrap();
        let info = parsed.fault_info().unwrap();
        assert_eq!(info.code, FaultCode::KeyRenewalNeeded);
    }

    #[test]
    fn test_unknown_fault_code_passes_through() {
        let json = r#"{"action":"FAULT","session_id":"s","body":{"code":"QUOTA_EXCEEDED"},"timestamp":0}"#;
        let parsed = Message::from_json(json).unwrap();
        assert_eq!(
            parsed.fault_info().unwrap().code,
            FaultCode::Other("QUOTA_EXCEEDED".to_string())
        );
    }

    #[test]
    fn test_serialization_roundtrip() {
        let msg = Message::application("session-9", "hello").with_message_id(42);
        let json = msg.to_json().unwrap();
        let parsed = Message::from_json(&json).unwrap();

        assert_eq!(parsed.action, Action::Application);
        assert_eq!(parsed.message_id, 42);
        assert_eq!(parsed.application_content(), Some("hello"));
    }

    #[test]
    fn test_negotiation_body_roundtrip() {
        let body = NegotiationBody {
            context_id: Some("ctx-1".to_string()),
            round: 3,
            payload: serde_json::json!({"nonce": "abc"}),
            token: None,
        };
        let msg = Message::negotiation(body);
        let parsed = Message::from_json(&msg.to_json().unwrap()).unwrap();

        let body = parsed.negotiation_body().unwrap();
        assert_eq!(body.round, 3);
        assert_eq!(body.context_id.as_deref(), Some("ctx-1"));
    }
}
