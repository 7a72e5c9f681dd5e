//! Session key schedule: renewal and rollover bookkeeping.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::RenewalConfig;
use crate::token::{infinite_expiration, SecurityToken};

/// Channel-owned token state.
///
/// Invariants: `previous` is present only while `now < key_rollover_time`;
/// `current` is present from open until the channel retires.
#[derive(Debug, Default)]
pub struct SessionKeyState {
    /// Token securing outgoing messages
    current: Option<Arc<SecurityToken>>,
    /// Superseded token, still accepted on incoming messages during the
    /// rollover grace window
    previous: Option<Arc<SecurityToken>>,
    /// When the next renewal is due
    key_renewal_time: Option<DateTime<Utc>>,
    /// When `previous` stops being accepted
    key_rollover_time: Option<DateTime<Utc>>,
}

impl SessionKeyState {
    /// Install the token obtained at open and schedule its renewal.
    pub fn install_initial(
        &mut self,
        token: Arc<SecurityToken>,
        now: DateTime<Utc>,
        config: &RenewalConfig,
    ) {
        self.key_renewal_time = Some(renewal_time(&token, now, config));
        self.current = Some(token);
        self.previous = None;
        self.key_rollover_time = None;
    }

    /// Replace the current token after a successful renewal.
    ///
    /// The superseded token stays in the accepted-incoming set until the
    /// rollover window closes.
    pub fn apply_renewal(
        &mut self,
        token: Arc<SecurityToken>,
        now: DateTime<Utc>,
        config: &RenewalConfig,
    ) {
        self.previous = self.current.take();
        self.key_rollover_time = Some(now + config.rollover_interval());
        self.key_renewal_time = Some(renewal_time(&token, now, config));
        self.current = Some(token);
    }

    /// Whether the renewal check should fire for a message sent at `now`.
    pub fn renewal_due(&self, now: DateTime<Utc>) -> bool {
        self.key_renewal_time.is_some_and(|at| now >= at)
    }

    /// Force renewal on the next send (key-renewal-needed session fault).
    pub fn force_renewal(&mut self, now: DateTime<Utc>) {
        self.key_renewal_time = Some(now);
    }

    /// Drop the superseded token once the rollover window has closed.
    ///
    /// Returns true when a token was retired.
    pub fn rollover_cleanup(&mut self, now: DateTime<Utc>) -> bool {
        if self.previous.is_some() && self.key_rollover_time.is_some_and(|at| now >= at) {
            self.previous = None;
            self.key_rollover_time = None;
            return true;
        }
        false
    }

    /// Token currently securing outgoing messages
    pub fn current(&self) -> Option<&Arc<SecurityToken>> {
        self.current.as_ref()
    }

    /// Superseded token still inside its rollover window
    pub fn previous(&self) -> Option<&Arc<SecurityToken>> {
        self.previous.as_ref()
    }

    /// Tokens accepted on incoming messages, current first.
    pub fn accepted(&self) -> Vec<Arc<SecurityToken>> {
        self.current
            .iter()
            .chain(self.previous.iter())
            .cloned()
            .collect()
    }

    /// Retire all tokens (close/fault/abort).
    pub fn retire(&mut self) {
        self.current = None;
        self.previous = None;
        self.key_renewal_time = None;
        self.key_rollover_time = None;
    }
}

/// Next renewal instant for a token installed at `now`: the smaller of the
/// percentage-of-validity estimate and a fixed ceiling from now.
fn renewal_time(token: &SecurityToken, now: DateTime<Utc>, config: &RenewalConfig) -> DateTime<Utc> {
    let ceiling = now + config.max_renewal_interval();

    let valid_to = token.valid_to();
    if valid_to >= infinite_expiration() {
        return ceiling;
    }

    let interval = valid_to - token.valid_from();
    let estimate =
        token.valid_from() + interval * i32::from(config.renewal_threshold_pct) / 100;
    estimate.min(ceiling)
}
