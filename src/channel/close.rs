//! Close handshake bookkeeping.

/// Channel-owned close handshake state.
///
/// The handshake is bilateral and role-asymmetric: whichever side closes
/// its output first sends one CLOSE and records `sent_close`; the other
/// side answers with one CLOSE_RESPONSE and records `received_close`.
/// Exactly one of the two flags becomes true per channel instance.
#[derive(Debug, Default)]
pub struct CloseHandshakeState {
    /// This side sent the CLOSE
    pub sent_close: bool,
    /// This side received the peer's CLOSE
    pub received_close: bool,
    /// No more messages will be accepted
    pub is_input_closed: bool,
    /// No more messages will be sent
    pub is_output_closed: bool,
}

impl CloseHandshakeState {
    /// Whether either side has started the handshake.
    pub fn handshake_started(&self) -> bool {
        self.sent_close || self.received_close
    }
}
