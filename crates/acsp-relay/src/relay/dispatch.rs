// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet routing between the upstream and the peers.
//!
//! The dispatcher owns every piece of mutable relay state: the peer table,
//! the interval negotiator and the statistics. It is driven by a single task,
//! so none of it needs locking. All methods are synchronous and take the
//! current time explicitly.

use super::negotiator::IntervalNegotiator;
use super::peer::{PeerConnection, PeerId};
use super::protocol::{classify, hex_dump, interval_request, Direction, Packet};
use super::transport::{Transport, TransportKind};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Relay statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayStats {
    /// Packets read from the upstream.
    pub upstream_packets: u64,
    /// Packets read from peers.
    pub peer_packets: u64,
    /// Packets written to the upstream.
    pub forwarded_upstream: u64,
    /// Packets written to peers (one per recipient).
    pub delivered_to_peers: u64,
    /// Packets rejected by classification.
    pub dropped: u64,
    /// Sends that failed or would have blocked.
    pub send_errors: u64,
}

/// Routing state of one relay.
pub struct Dispatcher {
    upstream: Box<dyn Transport>,
    peers: HashMap<PeerId, PeerConnection>,
    next_peer_id: u64,
    negotiator: IntervalNegotiator,
    stats: RelayStats,
}

impl Dispatcher {
    /// Create a dispatcher forwarding to `upstream`.
    pub fn new(upstream: Box<dyn Transport>) -> Self {
        Self {
            upstream,
            peers: HashMap::new(),
            next_peer_id: 1,
            negotiator: IntervalNegotiator::new(),
            stats: RelayStats::default(),
        }
    }

    /// Reserve an identity for a peer about to be added.
    pub fn allocate_peer_id(&mut self) -> PeerId {
        let id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;
        id
    }

    /// Register a peer.
    pub fn add_peer(&mut self, peer: PeerConnection) {
        info!(
            "Adding peer {} {} ({}, {:?})",
            peer.id(),
            peer.name(),
            peer.endpoint(),
            peer.kind()
        );
        self.peers.insert(peer.id(), peer);
    }

    /// Remove a peer; dropping the returned value closes its transport.
    pub fn remove_peer(&mut self, id: PeerId) -> Option<PeerConnection> {
        let peer = self.peers.remove(&id)?;
        info!("Removed peer {} {} ({})", id, peer.name(), peer.endpoint());
        Some(peer)
    }

    pub fn peer(&self, id: PeerId) -> Option<&PeerConnection> {
        self.peers.get(&id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn upstream_kind(&self) -> TransportKind {
        self.upstream.kind()
    }

    pub fn negotiator(&self) -> &IntervalNegotiator {
        &self.negotiator
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// A peer's reader reported end of stream or a read failure.
    ///
    /// Stream peers are removed; datagram peers have no connection to lose,
    /// so the report is ignored.
    pub fn handle_peer_closed(&mut self, id: PeerId, reason: &str) -> Option<PeerConnection> {
        match self.peers.get(&id).map(PeerConnection::kind) {
            Some(TransportKind::Stream) => {
                debug!("Peer {} closed: {}", id, reason);
                self.remove_peer(id)
            }
            Some(TransportKind::Datagram) => {
                debug!("Ignoring read failure on datagram peer {}: {}", id, reason);
                None
            }
            None => None,
        }
    }

    /// Route one packet read from the upstream.
    pub fn handle_upstream_packet(&mut self, data: &[u8], now: Instant) {
        self.stats.upstream_packets += 1;
        trace!("Packet from upstream ({} bytes)\n{}", data.len(), hex_dump(data));

        // Any upstream traffic proves the upstream is alive: retry a pending
        // interval change before anything else.
        if let Some(interval_ms) = self.negotiator.pending_request() {
            debug!("Re-sending realtime interval {} ms upstream", interval_ms);
            self.send_upstream(&interval_request(interval_ms));
        }

        let packet = match classify(data, Direction::FromServer) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping packet from upstream: {}", e);
                self.stats.dropped += 1;
                return;
            }
        };

        let was_confirmed = self.negotiator.is_confirmed();
        self.negotiator
            .on_upstream_packet(matches!(packet, Packet::CarUpdate { .. }));
        if !was_confirmed && self.negotiator.is_confirmed() {
            info!(
                "Upstream realtime interval confirmed at {} ms",
                self.negotiator.confirmed_ms()
            );
        }

        let stats = &mut self.stats;
        match packet {
            Packet::CarUpdate { slot } => {
                let confirmed_ms = self.negotiator.confirmed_ms();
                for peer in self.peers.values_mut() {
                    if peer.car_update_due(slot, now, confirmed_ms) {
                        deliver(stats, peer, data);
                        peer.mark_delivered(slot, now);
                    }
                }
            }
            Packet::CarInfo { slot } => {
                for peer in self.peers.values_mut() {
                    if peer.take_car_info(slot) {
                        deliver(stats, peer, data);
                    }
                }
            }
            Packet::SessionInfo { slot } => {
                for peer in self.peers.values_mut() {
                    if peer.take_session_info(slot) {
                        deliver(stats, peer, data);
                    }
                }
            }
            other => {
                debug!("Broadcasting {:?} to {} peers", other.packet_type(), self.peers.len());
                for peer in self.peers.values() {
                    deliver(stats, peer, data);
                }
            }
        }
    }

    /// Route one packet read from a peer.
    pub fn handle_peer_packet(&mut self, id: PeerId, data: &[u8]) {
        let Some(peer) = self.peers.get_mut(&id) else {
            debug!("Packet from unknown peer {}", id);
            return;
        };
        self.stats.peer_packets += 1;
        trace!(
            "Packet from {} ({} bytes)\n{}",
            peer.name(),
            data.len(),
            hex_dump(data)
        );

        let packet = match classify(data, Direction::FromPeer) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping packet from {}: {}", peer.name(), e);
                self.stats.dropped += 1;
                return;
            }
        };

        match packet {
            Packet::IntervalRequest { interval_ms } => {
                debug!("{} subscribes at {} ms", peer.name(), interval_ms);
                peer.set_subscription(interval_ms);
                if let Some(forward_ms) = self.negotiator.on_peer_request(interval_ms) {
                    debug!("Requesting realtime interval {} ms upstream", forward_ms);
                    self.send_upstream(&interval_request(forward_ms));
                }
            }
            Packet::GetCarInfo { slot } => {
                peer.request_car_info(slot);
                self.send_upstream(data);
            }
            Packet::GetSessionInfo { slot } => {
                peer.request_session_info(slot);
                self.send_upstream(data);
            }
            _ => self.send_upstream(data),
        }
    }

    fn send_upstream(&mut self, packet: &[u8]) {
        match self.upstream.send(packet) {
            Ok(()) => self.stats.forwarded_upstream += 1,
            Err(e) => {
                warn!("Upstream unreachable ({}): {}", self.upstream.endpoint(), e);
                self.stats.send_errors += 1;
            }
        }
    }
}

fn deliver(stats: &mut RelayStats, peer: &PeerConnection, packet: &[u8]) {
    match peer.send(packet) {
        Ok(()) => stats.delivered_to_peers += 1,
        Err(e) => {
            debug!("Send to {} failed: {}", peer.name(), e);
            stats.send_errors += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::{PacketType, CAR_UPDATE_LEN};
    use crate::relay::transport::MemoryTransport;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Sent = Arc<Mutex<Vec<Vec<u8>>>>;

    fn sent(log: &Sent) -> Vec<Vec<u8>> {
        log.lock().unwrap().clone()
    }

    fn dispatcher() -> (Dispatcher, Sent) {
        let (upstream, log) = MemoryTransport::new(TransportKind::Datagram);
        (Dispatcher::new(Box::new(upstream)), log)
    }

    fn add_peer(dispatcher: &mut Dispatcher, name: &str, kind: TransportKind) -> (PeerId, Sent) {
        let (transport, log) = MemoryTransport::new(kind);
        let id = dispatcher.allocate_peer_id();
        dispatcher.add_peer(PeerConnection::new(id, name, Box::new(transport)));
        (id, log)
    }

    fn car_update(slot: u8) -> Vec<u8> {
        let mut buf = vec![0u8; CAR_UPDATE_LEN];
        buf[0] = PacketType::CarUpdate.tag();
        buf[1] = slot;
        buf
    }

    fn subscribe(dispatcher: &mut Dispatcher, id: PeerId, interval_ms: u16) {
        dispatcher.handle_peer_packet(id, &interval_request(interval_ms));
    }

    #[test]
    fn test_peer_allow_list_enforced() {
        let (mut dispatcher, upstream) = dispatcher();
        let (plugin, _) = add_peer(&mut dispatcher, "plugin", TransportKind::Datagram);

        let allowed = [200u8, 201, 202, 203, 204, 205, 206];
        let mut expected_drops = 0;
        for tag in (0..=u8::MAX).filter(|t| !allowed.contains(t)) {
            let mut packet = vec![0u8; CAR_UPDATE_LEN];
            packet[0] = tag;
            dispatcher.handle_peer_packet(plugin, &packet);
            expected_drops += 1;
            assert_eq!(dispatcher.stats().dropped, expected_drops);
        }
        assert!(sent(&upstream).is_empty());
    }

    #[test]
    fn test_lowest_interval_sent_once_on_confirmation() {
        let (mut dispatcher, upstream) = dispatcher();
        let peers: Vec<_> = (0..3)
            .map(|i| add_peer(&mut dispatcher, &format!("p{}", i), TransportKind::Datagram).0)
            .collect();

        for (peer, interval) in peers.iter().zip([50, 20, 100]) {
            subscribe(&mut dispatcher, *peer, interval);
        }
        assert_eq!(dispatcher.negotiator().requested_ms(), 20);
        assert!(sent(&upstream).is_empty());

        let now = Instant::now();
        dispatcher.handle_upstream_packet(&car_update(0), now);
        dispatcher.handle_upstream_packet(&car_update(0), now + Duration::from_millis(20));
        dispatcher.handle_upstream_packet(&[56, 4], now + Duration::from_millis(30));

        let interval_packets: Vec<_> = sent(&upstream)
            .into_iter()
            .filter(|p| p[0] == PacketType::RealtimeInterval.tag())
            .collect();
        assert_eq!(interval_packets, vec![interval_request(20).to_vec()]);
    }

    #[test]
    fn test_first_car_update_confirms_interval() {
        let (mut dispatcher, _) = dispatcher();
        let (plugin, _) = add_peer(&mut dispatcher, "plugin", TransportKind::Datagram);
        subscribe(&mut dispatcher, plugin, 20);

        dispatcher.handle_upstream_packet(&[PacketType::NewSession.tag(), 4], Instant::now());
        assert!(!dispatcher.negotiator().is_confirmed());

        dispatcher.handle_upstream_packet(&car_update(2), Instant::now());
        assert_eq!(dispatcher.negotiator().confirmed_ms(), 20);
        assert_eq!(dispatcher.negotiator().requested_ms(), 0);
    }

    #[test]
    fn test_liveness_retries_until_confirmed() {
        let (mut dispatcher, upstream) = dispatcher();
        let (plugin, _) = add_peer(&mut dispatcher, "plugin", TransportKind::Datagram);
        subscribe(&mut dispatcher, plugin, 100);

        let now = Instant::now();
        dispatcher.handle_upstream_packet(&[56, 4], now);
        dispatcher.handle_upstream_packet(&[50, 4], now);
        assert_eq!(sent(&upstream).len(), 2);

        dispatcher.handle_upstream_packet(&car_update(0), now);
        dispatcher.handle_upstream_packet(&[56, 4], now);
        assert_eq!(sent(&upstream).len(), 3);
    }

    #[test]
    fn test_downsampled_fan_out() {
        let (mut dispatcher, _) = dispatcher();
        let (fast, fast_log) = add_peer(&mut dispatcher, "fast", TransportKind::Datagram);
        let (slow, slow_log) = add_peer(&mut dispatcher, "slow", TransportKind::Datagram);
        subscribe(&mut dispatcher, fast, 20);
        subscribe(&mut dispatcher, slow, 200);

        let start = Instant::now();
        let mut slow_times = Vec::new();
        for tick in 0..50u64 {
            let now = start + Duration::from_millis(tick * 20);
            let before = sent(&slow_log).len();
            dispatcher.handle_upstream_packet(&car_update(5), now);
            if sent(&slow_log).len() > before {
                slow_times.push(tick * 20);
            }
        }

        assert_eq!(dispatcher.negotiator().confirmed_ms(), 20);
        assert_eq!(sent(&fast_log).len(), 50);
        assert_eq!(slow_times, vec![0, 200, 400, 600, 800]);
    }

    #[test]
    fn test_unsubscribed_peer_gets_no_car_updates() {
        let (mut dispatcher, _) = dispatcher();
        let (subscriber, _) = add_peer(&mut dispatcher, "subscriber", TransportKind::Datagram);
        let (_idle, idle_log) = add_peer(&mut dispatcher, "idle", TransportKind::Datagram);
        subscribe(&mut dispatcher, subscriber, 50);

        dispatcher.handle_upstream_packet(&car_update(1), Instant::now());
        assert!(sent(&idle_log).is_empty());
    }

    #[test]
    fn test_car_info_only_to_requesters() {
        let (mut dispatcher, upstream) = dispatcher();
        let (asker, asker_log) = add_peer(&mut dispatcher, "asker", TransportKind::Datagram);
        let (_other, other_log) = add_peer(&mut dispatcher, "other", TransportKind::Datagram);

        dispatcher.handle_peer_packet(asker, &[201, 3]);
        assert_eq!(sent(&upstream), vec![vec![201, 3]]);

        let response = [54, 3, 1, 0];
        dispatcher.handle_upstream_packet(&response, Instant::now());
        dispatcher.handle_upstream_packet(&response, Instant::now());

        assert_eq!(sent(&asker_log), vec![response.to_vec()]);
        assert!(sent(&other_log).is_empty());
    }

    #[test]
    fn test_session_info_only_to_requesters() {
        let (mut dispatcher, _) = dispatcher();
        let (asker, asker_log) = add_peer(&mut dispatcher, "asker", TransportKind::Datagram);
        let (_other, other_log) = add_peer(&mut dispatcher, "other", TransportKind::Datagram);

        dispatcher.handle_peer_packet(asker, &[204, 0, 0]);
        dispatcher.handle_upstream_packet(&[59, 1, 0], Instant::now());
        assert!(sent(&asker_log).is_empty());

        dispatcher.handle_upstream_packet(&[59, 0, 0], Instant::now());
        assert_eq!(sent(&asker_log).len(), 1);
        assert!(sent(&other_log).is_empty());
    }

    #[test]
    fn test_other_packets_broadcast() {
        let (mut dispatcher, _) = dispatcher();
        let (_a, a_log) = add_peer(&mut dispatcher, "a", TransportKind::Datagram);
        let (_b, b_log) = add_peer(&mut dispatcher, "b", TransportKind::Stream);

        let chat = [57, 2, 1, b'g', 0, 0, 0];
        dispatcher.handle_upstream_packet(&chat, Instant::now());
        assert_eq!(sent(&a_log), vec![chat.to_vec()]);
        assert_eq!(sent(&b_log), vec![chat.to_vec()]);
        assert_eq!(dispatcher.stats().delivered_to_peers, 2);
    }

    #[test]
    fn test_peer_commands_forwarded_verbatim() {
        let (mut dispatcher, upstream) = dispatcher();
        let (plugin, _) = add_peer(&mut dispatcher, "plugin", TransportKind::Datagram);

        let kick = [206, 4];
        let broadcast = [203, 2, b'h', 0, 0, 0, b'i', 0, 0, 0];
        dispatcher.handle_peer_packet(plugin, &kick);
        dispatcher.handle_peer_packet(plugin, &broadcast);

        assert_eq!(sent(&upstream), vec![kick.to_vec(), broadcast.to_vec()]);
        assert_eq!(dispatcher.stats().forwarded_upstream, 2);
    }

    #[test]
    fn test_out_of_range_slot_dropped() {
        let (mut dispatcher, upstream) = dispatcher();
        let (plugin, _) = add_peer(&mut dispatcher, "plugin", TransportKind::Datagram);

        dispatcher.handle_peer_packet(plugin, &[201, 64]);
        dispatcher.handle_upstream_packet(&car_update(255), Instant::now());

        assert!(sent(&upstream).is_empty());
        assert_eq!(dispatcher.stats().dropped, 2);
    }

    #[test]
    fn test_stream_peer_teardown() {
        let (mut dispatcher, upstream) = dispatcher();
        let (udp, _) = add_peer(&mut dispatcher, "udp", TransportKind::Datagram);
        let (relay, _) = add_peer(&mut dispatcher, "relay", TransportKind::Stream);
        let (other_relay, _) = add_peer(&mut dispatcher, "relay2", TransportKind::Stream);

        let removed = dispatcher.handle_peer_closed(relay, "end of stream");
        assert_eq!(removed.map(|p| p.id()), Some(relay));
        assert_eq!(dispatcher.peer_count(), 2);
        assert!(dispatcher.peer(udp).is_some());
        assert!(dispatcher.peer(other_relay).is_some());
        assert!(sent(&upstream).is_empty());

        // Datagram peers survive read failures.
        assert!(dispatcher.handle_peer_closed(udp, "connection reset").is_none());
        assert_eq!(dispatcher.peer_count(), 2);

        // Packets from a removed peer are ignored.
        dispatcher.handle_peer_packet(relay, &[206, 1]);
        assert!(sent(&upstream).is_empty());
    }

    #[test]
    fn test_two_plugins_end_to_end() {
        let (mut dispatcher, upstream) = dispatcher();
        let (a, a_log) = add_peer(&mut dispatcher, "A", TransportKind::Datagram);
        let (b, b_log) = add_peer(&mut dispatcher, "B", TransportKind::Datagram);

        subscribe(&mut dispatcher, a, 50);
        subscribe(&mut dispatcher, b, 10);

        let t0 = Instant::now();
        dispatcher.handle_upstream_packet(&car_update(1), t0);
        assert_eq!(dispatcher.negotiator().confirmed_ms(), 10);
        assert_eq!(sent(&upstream), vec![interval_request(10).to_vec()]);
        assert_eq!(sent(&a_log).len(), 1);
        assert_eq!(sent(&b_log).len(), 1);

        dispatcher.handle_upstream_packet(&car_update(1), t0 + Duration::from_millis(10));
        assert_eq!(sent(&b_log).len(), 2);
        assert_eq!(sent(&a_log).len(), 1);

        dispatcher.handle_upstream_packet(&car_update(1), t0 + Duration::from_millis(40));
        assert_eq!(sent(&b_log).len(), 3);
        assert_eq!(sent(&a_log).len(), 1);

        dispatcher.handle_upstream_packet(&car_update(1), t0 + Duration::from_millis(50));
        assert_eq!(sent(&b_log).len(), 4);
        assert_eq!(sent(&a_log).len(), 2);
    }

    #[test]
    fn test_confirmed_lower_request_forwarded_immediately() {
        let (mut dispatcher, upstream) = dispatcher();
        let (a, _) = add_peer(&mut dispatcher, "A", TransportKind::Datagram);
        let (b, _) = add_peer(&mut dispatcher, "B", TransportKind::Datagram);

        subscribe(&mut dispatcher, a, 100);
        dispatcher.handle_upstream_packet(&car_update(0), Instant::now());
        assert_eq!(sent(&upstream).len(), 1);

        subscribe(&mut dispatcher, b, 200);
        assert_eq!(sent(&upstream).len(), 1);

        subscribe(&mut dispatcher, b, 25);
        assert_eq!(sent(&upstream).last().unwrap(), &interval_request(25).to_vec());
        assert_eq!(dispatcher.negotiator().confirmed_ms(), 25);
    }
}
