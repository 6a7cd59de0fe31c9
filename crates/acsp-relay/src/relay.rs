// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay runtime.
//!
//! [`Relay::bind`] opens every socket up front; [`Relay::run`] then feeds the
//! events of all reader tasks to a single [`Dispatcher`].

use crate::config::{ConfigError, RelayConfig, UpstreamMode};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tracing::{debug, error, info, warn};

pub mod dispatch;
pub mod negotiator;
pub mod peer;
pub mod protocol;
pub mod transport;

pub use dispatch::{Dispatcher, RelayStats};
pub use negotiator::IntervalNegotiator;
pub use peer::{PeerConnection, PeerId};
use transport::{DatagramTransport, RelayEvent, Source, StreamTransport, Transport, TransportError};

/// Events buffered between the reader tasks and the dispatcher.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// Name given to accepted downstream relays.
const DOWNSTREAM_RELAY_NAME: &str = "relay";

/// Relay error types.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Lost connection to upstream relay: {0}")]
    UpstreamClosed(String),
}

impl RelayError {
    /// Whether the relay failed because it was never configured.
    pub fn is_unconfigured(&self) -> bool {
        matches!(self, Self::Config(ConfigError::Unconfigured(_)))
    }
}

/// Addresses the relay is bound to.
#[derive(Debug, Clone, Default)]
pub struct LocalAddrs {
    /// Local UDP port the server sends to (direct mode only).
    pub upstream: Option<SocketAddr>,
    /// TCP listener for downstream relays.
    pub listener: Option<SocketAddr>,
    /// Local UDP port of each plugin, by name.
    pub plugins: Vec<(String, SocketAddr)>,
}

/// A bound relay, ready to run.
pub struct Relay {
    dispatcher: Dispatcher,
    events_tx: mpsc::Sender<RelayEvent>,
    events_rx: mpsc::Receiver<RelayEvent>,
    local_addrs: LocalAddrs,
    stats_interval: Option<Duration>,
    tasks: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Validate `config` and open the upstream, the plugin sockets and the
    /// downstream listener.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let mut tasks = Vec::new();
        let mut local_addrs = LocalAddrs::default();

        let server_addr = config.server_addr()?;
        let upstream: Box<dyn Transport> = match config.server.mode {
            UpstreamMode::Direct => {
                let udp = DatagramTransport::bind(any_addr(config.server.local_port), Some(server_addr)).await?;
                local_addrs.upstream = Some(udp.local_addr().map_err(TransportError::from)?);
                tasks.push(udp.spawn_reader(Source::Upstream, events_tx.clone()));
                info!("Server at {} (UDP, local port {})", server_addr, config.server.local_port);
                Box::new(udp)
            }
            UpstreamMode::Chained => {
                info!("Connecting to upstream relay {}", server_addr);
                let stream = transport::connect(server_addr, config.connect_timeout()).await?;
                let (tcp, reader) =
                    StreamTransport::spawn(stream, server_addr, Source::Upstream, events_tx.clone());
                tasks.push(reader);
                info!("Connected to upstream relay {}", server_addr);
                Box::new(tcp)
            }
        };

        let mut dispatcher = Dispatcher::new(upstream);

        for plugin in &config.plugins {
            let remote = plugin.remote_addr()?;
            let udp = DatagramTransport::bind(any_addr(plugin.local_port), Some(remote)).await?;
            let id = dispatcher.allocate_peer_id();
            local_addrs
                .plugins
                .push((plugin.name.clone(), udp.local_addr().map_err(TransportError::from)?));
            tasks.push(udp.spawn_reader(Source::Peer(id), events_tx.clone()));
            dispatcher.add_peer(PeerConnection::new(id, plugin.name.clone(), Box::new(udp)));
        }

        if config.relay.listen_port != 0 {
            let addr = any_addr(config.relay.listen_port);
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| TransportError::Bind { addr, source })?;
            local_addrs.listener = Some(listener.local_addr().map_err(TransportError::from)?);
            info!("Accepting downstream relays on {}", addr);
            tasks.push(spawn_acceptor(listener, events_tx.clone()));
        }

        let stats_interval =
            (config.stats_interval_secs > 0).then(|| Duration::from_secs(config.stats_interval_secs));

        Ok(Self {
            dispatcher,
            events_tx,
            events_rx,
            local_addrs,
            stats_interval,
            tasks,
        })
    }

    /// Run until `shutdown` is notified or the upstream relay goes away.
    pub async fn run(&mut self, shutdown: Arc<Notify>) -> Result<(), RelayError> {
        let shutdown_signal = shutdown.notified();
        tokio::pin!(shutdown_signal);

        let mut stats_tick = self.stats_interval.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event)?,
                        None => break,
                    }
                }
                _ = tick(&mut stats_tick) => {
                    self.log_stats();
                }
                _ = &mut shutdown_signal => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.log_stats();
        Ok(())
    }

    fn handle_event(&mut self, event: RelayEvent) -> Result<(), RelayError> {
        match event {
            RelayEvent::Packet {
                source: Source::Upstream,
                data,
            } => self.dispatcher.handle_upstream_packet(&data, Instant::now()),

            RelayEvent::Packet {
                source: Source::Peer(id),
                data,
            } => self.dispatcher.handle_peer_packet(id, &data),

            RelayEvent::Closed {
                source: Source::Upstream,
                reason,
            } => {
                if self.dispatcher.upstream_kind() == transport::TransportKind::Stream {
                    error!("Upstream relay disconnected: {}", reason);
                    return Err(RelayError::UpstreamClosed(reason));
                }
                debug!("Ignoring upstream read failure: {}", reason);
            }

            RelayEvent::Closed {
                source: Source::Peer(id),
                reason,
            } => {
                self.dispatcher.handle_peer_closed(id, &reason);
            }

            RelayEvent::Accepted { stream, addr } => {
                let id = self.dispatcher.allocate_peer_id();
                let (tcp, reader) =
                    StreamTransport::spawn(stream, addr, Source::Peer(id), self.events_tx.clone());
                self.tasks.retain(|task| !task.is_finished());
                self.tasks.push(reader);
                self.dispatcher
                    .add_peer(PeerConnection::new(id, DOWNSTREAM_RELAY_NAME, Box::new(tcp)));
            }
        }
        Ok(())
    }

    fn log_stats(&self) {
        let stats = self.dispatcher.stats();
        let negotiator = self.dispatcher.negotiator();
        info!(
            "Stats: {} peers, upstream {} in / {} out, peers {} in / {} out, {} dropped, {} send errors, interval {} ms",
            self.dispatcher.peer_count(),
            stats.upstream_packets,
            stats.forwarded_upstream,
            stats.peer_packets,
            stats.delivered_to_peers,
            stats.dropped,
            stats.send_errors,
            negotiator.confirmed_ms()
        );
    }

    pub fn local_addrs(&self) -> &LocalAddrs {
        &self.local_addrs
    }

    pub fn stats(&self) -> &RelayStats {
        self.dispatcher.stats()
    }

    pub fn peer_count(&self) -> usize {
        self.dispatcher.peer_count()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn spawn_acceptor(listener: TcpListener, events: mpsc::Sender<RelayEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("New relay connection from {}", addr);
                    if events.send(RelayEvent::Accepted { stream, addr }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use tokio::net::UdpSocket;

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_bind_unconfigured() {
        let err = Relay::bind(RelayConfig::default()).await.err().unwrap();
        assert!(err.is_unconfigured());
    }

    #[tokio::test]
    async fn test_bind_reports_addresses() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = RelayConfig::default();
        config.server.server_port = server.local_addr().unwrap().port();
        config.server.local_port = free_udp_port();
        config.add_plugin(PluginConfig::new("timing", "127.0.0.1", 11000, free_udp_port()));

        let relay = Relay::bind(config.clone()).await.unwrap();
        let addrs = relay.local_addrs();
        assert_eq!(addrs.upstream.unwrap().port(), config.server.local_port);
        assert_eq!(addrs.plugins[0].0, "timing");
        assert_eq!(addrs.plugins[0].1.port(), config.plugins[0].local_port);
        assert!(addrs.listener.is_none());
        assert_eq!(relay.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = RelayConfig::default();
        config.server.server_port = server.local_addr().unwrap().port();
        config.server.local_port = free_udp_port();
        config.stats_interval_secs = 1;

        let mut relay = Relay::bind(config).await.unwrap();
        let shutdown = Arc::new(Notify::new());
        shutdown.notify_one();

        let result = tokio::time::timeout(Duration::from_secs(2), relay.run(shutdown)).await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_chained_connect_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = RelayConfig::default();
        config.server.mode = UpstreamMode::Chained;
        config.server.server_port = port;

        let err = Relay::bind(config).await.err().unwrap();
        assert!(matches!(err, RelayError::Transport(_)));
        assert!(!err.is_unconfigured());
    }
}
