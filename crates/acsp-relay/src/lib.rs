// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ACSP Relay
//!
//! Shares the single UDP plugin port of a racing-simulation server between
//! several plugins, and lets relays be chained over TCP.
//!
//! # Features
//!
//! - **Fan-out**: server events reach every plugin, car updates downsampled
//!   to each plugin's own interval
//! - **Interval negotiation**: the server is asked for the fastest interval
//!   any plugin wants
//! - **Request pairing**: car info and session info responses only go to the
//!   plugin that asked
//! - **Chaining**: a relay can sit behind another relay over TCP
//!
//! # Quick Start
//!
//! ```bash
//! # Server sends plugin events to UDP 12001 and listens on 12000
//! acsp-relay --local-port 12001 --server-port 12000 \
//!     --add-plugin timing:127.0.0.1:11000:11001
//!
//! # Accept downstream relays on TCP 12100
//! acsp-relay --config acsp-relay.toml --relay-port 12100
//!
//! # Chain behind another relay
//! acsp-relay --chained --host 10.0.0.5 --server-port 12100
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! [server]
//! mode = "direct"
//! host = "127.0.0.1"
//! server_port = 12000
//! local_port = 12001
//!
//! [relay]
//! listen_port = 12100
//!
//! [[plugins]]
//! name = "timing"
//! remote_port = 11000
//! local_port = 11001
//! ```

pub mod config;
pub mod relay;

pub use config::{ConfigError, PluginConfig, RelayConfig, UpstreamMode};
pub use relay::{LocalAddrs, Relay, RelayError, RelayStats};
