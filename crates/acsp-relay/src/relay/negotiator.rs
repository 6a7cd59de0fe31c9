// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Realtime update interval negotiation.
//!
//! Every peer asks for its own car update interval, but the upstream only
//! produces one stream. The negotiator keeps the upstream subscribed at the
//! smallest interval any peer asked for; slower peers are downsampled on
//! fan-out.
//!
//! The protocol has no acknowledgement for an interval change, so
//! confirmation is inferred: the first car update seen while a request is
//! pending means the request took effect. Until then, the pending request is
//! re-sent whenever the upstream shows it is alive.

/// Interval negotiation state shared by all peers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntervalNegotiator {
    /// Interval last asked of the upstream and not yet confirmed (0 = none).
    requested_ms: u16,
    /// Interval believed to be active upstream (0 = unconfirmed).
    confirmed_ms: u16,
}

impl IntervalNegotiator {
    /// Create an unconfirmed negotiator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interval waiting for confirmation (0 = none).
    pub fn requested_ms(&self) -> u16 {
        self.requested_ms
    }

    /// Interval believed to be active upstream (0 = unconfirmed).
    pub fn confirmed_ms(&self) -> u16 {
        self.confirmed_ms
    }

    /// Whether the upstream is believed to have applied an interval.
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_ms != 0
    }

    /// Record a peer's interval request.
    ///
    /// Returns the interval to send upstream right away, if any. Before
    /// confirmation nothing is sent: the request is remembered and goes out
    /// on the next upstream liveness signal.
    pub fn on_peer_request(&mut self, interval_ms: u16) -> Option<u16> {
        if interval_ms == 0 {
            return None;
        }

        if !self.is_confirmed() {
            if self.requested_ms == 0 || interval_ms < self.requested_ms {
                self.requested_ms = interval_ms;
            }
            return None;
        }

        if interval_ms < self.confirmed_ms {
            self.confirmed_ms = interval_ms;
            self.requested_ms = interval_ms;
            return Some(interval_ms);
        }

        None
    }

    /// Interval to re-send upstream because a change is still pending.
    pub fn pending_request(&self) -> Option<u16> {
        (self.requested_ms != 0).then_some(self.requested_ms)
    }

    /// Observe a packet from upstream after any pending request was re-sent.
    ///
    /// A car update while a request is pending confirms it.
    pub fn on_upstream_packet(&mut self, is_car_update: bool) {
        if is_car_update && self.requested_ms != 0 {
            self.confirmed_ms = self.requested_ms;
            self.requested_ms = 0;
        }
    }
}
