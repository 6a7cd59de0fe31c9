// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-peer subscription state.

use super::protocol::SLOT_COUNT;
use super::transport::{Transport, TransportKind};
use std::fmt;
use std::io;
use std::time::{Duration, Instant};

/// Opaque peer identity, unique for the lifetime of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A downstream consumer: a UDP plugin or a chained relay.
pub struct PeerConnection {
    id: PeerId,
    name: String,
    transport: Box<dyn Transport>,
    subscribed_interval_ms: u16,
    pending_car_info: [bool; SLOT_COUNT],
    pending_session_info: [bool; SLOT_COUNT],
    last_delivered: [Option<Instant>; SLOT_COUNT],
}

impl PeerConnection {
    /// Create a peer with no subscription and nothing pending.
    pub fn new(id: PeerId, name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            id,
            name: name.into(),
            transport,
            subscribed_interval_ms: 0,
            pending_car_info: [false; SLOT_COUNT],
            pending_session_info: [false; SLOT_COUNT],
            last_delivered: [None; SLOT_COUNT],
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    /// Car update interval this peer asked for (0 = not subscribed).
    pub fn subscribed_interval_ms(&self) -> u16 {
        self.subscribed_interval_ms
    }

    pub fn set_subscription(&mut self, interval_ms: u16) {
        self.subscribed_interval_ms = interval_ms;
    }

    pub fn request_car_info(&mut self, slot: usize) {
        self.pending_car_info[slot] = true;
    }

    pub fn request_session_info(&mut self, slot: usize) {
        self.pending_session_info[slot] = true;
    }

    /// Whether this peer is waiting for car info on `slot`; clears the flag.
    pub fn take_car_info(&mut self, slot: usize) -> bool {
        std::mem::take(&mut self.pending_car_info[slot])
    }

    /// Whether this peer is waiting for session info on `slot`; clears the flag.
    pub fn take_session_info(&mut self, slot: usize) -> bool {
        std::mem::take(&mut self.pending_session_info[slot])
    }

    /// Whether a car update for `slot` should go to this peer at `now`.
    ///
    /// Peers subscribed at the confirmed upstream rate get every update;
    /// slower peers get one once their own interval has elapsed.
    pub fn car_update_due(&self, slot: usize, now: Instant, confirmed_ms: u16) -> bool {
        let interval = self.subscribed_interval_ms;
        if interval == 0 {
            return false;
        }
        if interval == confirmed_ms {
            return true;
        }
        match self.last_delivered[slot] {
            None => true,
            Some(last) => {
                now.saturating_duration_since(last) >= Duration::from_millis(u64::from(interval))
            }
        }
    }

    pub fn mark_delivered(&mut self, slot: usize, now: Instant) {
        self.last_delivered[slot] = Some(now);
    }

    /// Best-effort, non-blocking send.
    pub fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.transport.send(packet)
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("endpoint", &self.transport.endpoint())
            .field("subscribed_interval_ms", &self.subscribed_interval_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::transport::MemoryTransport;

    fn peer() -> PeerConnection {
        let (transport, _sent) = MemoryTransport::new(TransportKind::Datagram);
        PeerConnection::new(PeerId(1), "timing", Box::new(transport))
    }

    #[test]
    fn test_pending_flags_are_per_slot() {
        let mut peer = peer();
        peer.request_car_info(3);
        peer.request_session_info(0);

        assert!(!peer.take_car_info(4));
        assert!(peer.take_car_info(3));
        assert!(!peer.take_car_info(3));
        assert!(!peer.take_car_info(0));
        assert!(peer.take_session_info(0));
        assert!(!peer.take_session_info(0));
    }

    #[test]
    fn test_unsubscribed_peer_never_due() {
        let peer = peer();
        assert!(!peer.car_update_due(0, Instant::now(), 0));
        assert!(!peer.car_update_due(0, Instant::now(), 20));
    }

    #[test]
    fn test_due_after_interval() {
        let mut peer = peer();
        peer.set_subscription(200);
        let start = Instant::now();

        assert!(peer.car_update_due(1, start, 20));
        peer.mark_delivered(1, start);

        assert!(!peer.car_update_due(1, start + Duration::from_millis(199), 20));
        assert!(peer.car_update_due(1, start + Duration::from_millis(200), 20));
        // Other slots are tracked separately.
        assert!(peer.car_update_due(2, start, 20));
    }

    #[test]
    fn test_confirmed_rate_always_due() {
        let mut peer = peer();
        peer.set_subscription(20);
        let now = Instant::now();
        peer.mark_delivered(1, now);
        assert!(peer.car_update_due(1, now, 20));
    }
}
