//! # SecConv - Secure-Conversation Session Control Plane
//!
//! Session-security control plane for a secure-messaging stack: negotiates
//! a shared cryptographic session token with a remote peer, keeps that
//! token valid over the lifetime of a long-lived channel, and performs the
//! graceful bilateral handshake that tears the session down.
//!
//! ## Features
//!
//! - **Token negotiation**: a generic engine drives any multi-leg
//!   challenge/response exchange behind a small driver trait
//! - **Token caching**: single-slot provider cache with threshold-based
//!   effective expiration and a hard caching cap
//! - **Key renewal and rollover**: scheduled and peer-forced renewals,
//!   with a grace window where the superseded key still verifies
//! - **Bilateral close**: the two-message close / close-response handshake
//!   with strict role asymmetry
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │        Session Client Channel                   │
//! │  (renewal, rollover, close handshake)           │
//! └───────┬───────────────────────┬────────────────┘
//!         │                        │
//!         v                        v
//! ┌───────────────┐       ┌───────────────────┐
//! │ Token Provider │       │ Message Security  │
//! │ (single-slot   │       │ (secure / verify) │
//! │  cache)        │       └───────────────────┘
//! └───────┬───────┘
//!         │ cache miss / renewal
//!         v
//! ┌───────────────┐       ┌───────────────────┐
//! │  Negotiation  │──────>│    Transport      │
//! │    Engine     │       │ (memory / tcp)    │
//! └───────────────┘       └───────────────────┘
//! ```
//!
//! The validity calculator ([`token::effective_expiration`]) is consulted
//! by the provider on every lookup and by the channel when scheduling
//! renewals.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::{atomic::AtomicU64, Arc};
//! use std::time::Duration;
//! use secconv::{
//!     ChallengeResponseDriver, Config, DuplexSessionChannel, HmacMessageSecurity,
//!     NegotiatingTokenProvider, NegotiationEngine, TcpBinder,
//! };
//!
//! let config = Config::default();
//! let ids = Arc::new(AtomicU64::new(1));
//! let binder = Arc::new(TcpBinder::new(config.transport.clone()));
//!
//! // Provider negotiating against the issuer
//! let engine = NegotiationEngine::new(
//!     ChallengeResponseDriver::default(),
//!     binder.clone(),
//!     config.token_policy.key_policy(),
//!     ids.clone(),
//! );
//! let provider = Arc::new(NegotiatingTokenProvider::new(
//!     engine,
//!     "tcp://issuer:8081",
//!     config.token_policy.clone(),
//! ));
//!
//! // Long-lived session channel to the service
//! let transport = binder.create_channel("tcp://service:8080")?;
//! let channel = DuplexSessionChannel::new(
//!     transport,
//!     provider,
//!     Arc::new(HmacMessageSecurity::new()),
//!     &config,
//!     ids,
//! );
//! channel.open(Duration::from_secs(15)).await?;
//! channel.send("hello", Duration::from_secs(5)).await?;
//! channel.close(Duration::from_secs(60)).await?;
//! ```
//!
//! ## Modules
//!
//! - [`token`]: security tokens, key policy, validity calculator
//! - [`negotiate`]: the generic negotiation engine and trust drivers
//! - [`provider`]: the caching token provider
//! - [`channel`]: simplex and duplex session channels
//! - [`security`]: the message-security engine boundary
//! - [`transport`]: pluggable transports (memory, TCP)
//! - [`config`]: configuration management
//! - [`error`]: error types and result aliases

pub mod budget;
pub mod channel;
pub mod config;
pub mod error;
pub mod message;
pub mod negotiate;
pub mod provider;
pub mod security;
pub mod token;
pub mod transport;

// Re-exports for convenience
pub use budget::TimeBudget;
pub use channel::{
    ChannelState, ChannelStats, DuplexSessionChannel, RequestSessionChannel,
};
pub use config::Config;
pub use error::{Error, Result};
pub use message::{Action, FaultCode, Message};
pub use negotiate::{
    ChallengeResponseDriver, NegotiationEngine, NegotiationState, SimpleIssueDriver, TrustDriver,
};
pub use provider::{NegotiatingTokenProvider, SecurityTokenProvider};
pub use security::{CorrelationState, HmacMessageSecurity, MessageSecurity};
pub use token::{KeyPolicy, SecurityToken, SymmetricKey, TokenId};
pub use transport::{MemoryListener, TcpBinder, TransportBinder, TransportChannel};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Session protocol version
pub const PROTOCOL_VERSION: &str = "1.0";
