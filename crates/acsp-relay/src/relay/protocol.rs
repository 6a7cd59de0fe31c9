// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ACSP packet classification.
//!
//! Every ACSP packet starts with a one-byte type tag. The relay only decodes
//! the handful of fields it needs for routing; everything else is forwarded
//! as opaque bytes.
//!
//! Routing-relevant layouts:
//! ```text
//! REALTIMEPOS_INTERVAL  [200][interval: u16 LE]
//! GET_CAR_INFO          [201][car slot: u8]
//! GET_SESSION_INFO      [204][session slot: u8]...
//! CAR_UPDATE            [53][car slot: u8][pos: 3xf32][vel: 3xf32][gear: u8][rpm: u16][spline: f32]
//! CAR_INFO              [54][car slot: u8]...
//! SESSION_INFO          [59][session slot: u8]...
//! ```
//!
//! Each direction has its own allow-list, so a plugin cannot inject server
//! events and the server cannot inject plugin commands.

use std::fmt::Write as _;
use thiserror::Error;

/// Number of addressable car / session slots.
pub const SLOT_COUNT: usize = 64;

/// Largest packet the relay reads in one go. Car info and chat carry UTF-32
/// strings, so this is well above the size of any routing-relevant packet.
pub const MAX_PACKET_SIZE: usize = 2048;

/// Length of a car update: tag, slot, position, velocity, gear, rpm, spline.
pub const CAR_UPDATE_LEN: usize = 1 + 1 + 3 * 4 + 3 * 4 + 1 + 2 + 4;

/// Length of a realtime interval request.
pub const INTERVAL_REQUEST_LEN: usize = 3;

/// ACSP packet type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    NewSession = 50,
    NewConnection = 51,
    ConnectionClosed = 52,
    CarUpdate = 53,
    CarInfo = 54,
    EndSession = 55,
    Version = 56,
    Chat = 57,
    ClientLoaded = 58,
    SessionInfo = 59,
    Error = 60,
    LapCompleted = 73,
    ClientEvent = 130,
    RealtimeInterval = 200,
    GetCarInfo = 201,
    SendChat = 202,
    BroadcastChat = 203,
    GetSessionInfo = 204,
    SetSessionInfo = 205,
    KickUser = 206,
}

impl TryFrom<u8> for PacketType {
    type Error = ClassifyError;

    fn try_from(tag: u8) -> Result<Self, ClassifyError> {
        let packet_type = match tag {
            50 => PacketType::NewSession,
            51 => PacketType::NewConnection,
            52 => PacketType::ConnectionClosed,
            53 => PacketType::CarUpdate,
            54 => PacketType::CarInfo,
            55 => PacketType::EndSession,
            56 => PacketType::Version,
            57 => PacketType::Chat,
            58 => PacketType::ClientLoaded,
            59 => PacketType::SessionInfo,
            60 => PacketType::Error,
            73 => PacketType::LapCompleted,
            130 => PacketType::ClientEvent,
            200 => PacketType::RealtimeInterval,
            201 => PacketType::GetCarInfo,
            202 => PacketType::SendChat,
            203 => PacketType::BroadcastChat,
            204 => PacketType::GetSessionInfo,
            205 => PacketType::SetSessionInfo,
            206 => PacketType::KickUser,
            other => return Err(ClassifyError::UnknownTag(other)),
        };
        Ok(packet_type)
    }
}

impl PacketType {
    /// Wire tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Direction this packet type is allowed to travel in.
    pub fn direction(self) -> Direction {
        match self {
            Self::RealtimeInterval
            | Self::GetCarInfo
            | Self::SendChat
            | Self::BroadcastChat
            | Self::GetSessionInfo
            | Self::SetSessionInfo
            | Self::KickUser => Direction::FromPeer,
            _ => Direction::FromServer,
        }
    }

    /// Minimum length needed to hold the mandatory fixed fields.
    pub fn min_len(self) -> usize {
        match self {
            Self::CarUpdate => CAR_UPDATE_LEN,
            Self::RealtimeInterval => INTERVAL_REQUEST_LEN,
            Self::GetCarInfo
            | Self::GetSessionInfo
            | Self::SendChat
            | Self::KickUser
            | Self::CarInfo
            | Self::SessionInfo => 2,
            _ => 1,
        }
    }
}

/// Which side of the relay a packet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the upstream (simulation server or upstream relay).
    FromServer,
    /// From a plugin or a downstream relay.
    FromPeer,
}

/// A classified packet with the fields needed for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    IntervalRequest { interval_ms: u16 },
    GetCarInfo { slot: usize },
    GetSessionInfo { slot: usize },
    CarUpdate { slot: usize },
    CarInfo { slot: usize },
    SessionInfo { slot: usize },
    /// Any other allowed packet, forwarded verbatim.
    Other(PacketType),
}

impl Packet {
    /// Packet type of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::IntervalRequest { .. } => PacketType::RealtimeInterval,
            Self::GetCarInfo { .. } => PacketType::GetCarInfo,
            Self::GetSessionInfo { .. } => PacketType::GetSessionInfo,
            Self::CarUpdate { .. } => PacketType::CarUpdate,
            Self::CarInfo { .. } => PacketType::CarInfo,
            Self::SessionInfo { .. } => PacketType::SessionInfo,
            Self::Other(packet_type) => *packet_type,
        }
    }
}

/// Reasons a packet is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    #[error("empty packet")]
    Empty,

    #[error("unknown packet tag {0}")]
    UnknownTag(u8),

    #[error("{0:?} not allowed in this direction")]
    WrongDirection(PacketType),

    #[error("{packet_type:?} truncated: {len} bytes, need {min}")]
    Truncated {
        packet_type: PacketType,
        len: usize,
        min: usize,
    },

    #[error("{packet_type:?} slot {slot} out of range")]
    SlotOutOfRange { packet_type: PacketType, slot: u8 },
}

/// Classify a raw packet travelling in `direction`.
pub fn classify(buf: &[u8], direction: Direction) -> Result<Packet, ClassifyError> {
    let tag = *buf.first().ok_or(ClassifyError::Empty)?;
    let packet_type = PacketType::try_from(tag)?;

    if packet_type.direction() != direction {
        return Err(ClassifyError::WrongDirection(packet_type));
    }

    let min = packet_type.min_len();
    if buf.len() < min {
        return Err(ClassifyError::Truncated {
            packet_type,
            len: buf.len(),
            min,
        });
    }

    let packet = match packet_type {
        PacketType::RealtimeInterval => Packet::IntervalRequest {
            interval_ms: u16::from_le_bytes([buf[1], buf[2]]),
        },
        PacketType::GetCarInfo => Packet::GetCarInfo {
            slot: slot(buf, packet_type)?,
        },
        PacketType::GetSessionInfo => Packet::GetSessionInfo {
            slot: slot(buf, packet_type)?,
        },
        PacketType::CarUpdate => Packet::CarUpdate {
            slot: slot(buf, packet_type)?,
        },
        PacketType::CarInfo => Packet::CarInfo {
            slot: slot(buf, packet_type)?,
        },
        PacketType::SessionInfo => Packet::SessionInfo {
            slot: slot(buf, packet_type)?,
        },
        other => Packet::Other(other),
    };

    Ok(packet)
}

fn slot(buf: &[u8], packet_type: PacketType) -> Result<usize, ClassifyError> {
    let raw = buf[1];
    let slot = usize::from(raw);
    if slot >= SLOT_COUNT {
        return Err(ClassifyError::SlotOutOfRange {
            packet_type,
            slot: raw,
        });
    }
    Ok(slot)
}

/// Build a realtime interval request.
pub fn interval_request(interval_ms: u16) -> [u8; INTERVAL_REQUEST_LEN] {
    let [lo, hi] = interval_ms.to_le_bytes();
    [PacketType::RealtimeInterval.tag(), lo, hi]
}

/// Hex dump for trace logging, 16 bytes per line.
pub fn hex_dump(buf: &[u8]) -> String {
    let mut out = String::with_capacity(buf.len() * 3 + buf.len() / 16 * 7);
    for (i, chunk) in buf.chunks(16).enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{:04x}:", i * 16);
        for byte in chunk {
            let _ = write!(out, " {:02x}", byte);
        }
    }
    out
}
