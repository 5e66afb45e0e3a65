//! src/membership/wire.rs
//!
//! Fixed-layout, little-endian codec for the three membership messages:
//! JOIN_REQUEST, JOIN_REPLY and GOSSIP. This is a hand-packed binary format,
//! not a serde derive — the layout is dictated by the wire spec, not by
//! whatever `bincode` would otherwise choose.

use crate::domain::Address;
use crate::error::Error;

const KIND_JOIN_REQUEST: u8 = 0;
const KIND_JOIN_REPLY: u8 = 1;
const KIND_GOSSIP: u8 = 2;

/// One entry in a GOSSIP digest: an address plus the heartbeat the sender
/// last observed for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GossipEntry {
    pub address: Address,
    pub heartbeat: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipMessage {
    JoinRequest { from: Address, heartbeat: i64 },
    JoinReply { from: Address, heartbeat: i64 },
    Gossip { from: Address, entries: Vec<GossipEntry> },
}

impl MembershipMessage {
    pub fn sender(&self) -> Address {
        match self {
            MembershipMessage::JoinRequest { from, .. } => *from,
            MembershipMessage::JoinReply { from, .. } => *from,
            MembershipMessage::Gossip { from, .. } => *from,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (kind, from) = match self {
            MembershipMessage::JoinRequest { from, .. } => (KIND_JOIN_REQUEST, *from),
            MembershipMessage::JoinReply { from, .. } => (KIND_JOIN_REPLY, *from),
            MembershipMessage::Gossip { from, .. } => (KIND_GOSSIP, *from),
        };

        let mut buf = Vec::with_capacity(8);
        buf.push(kind);
        buf.extend_from_slice(&from.to_bytes());
        buf.push(0); // reserved

        match self {
            MembershipMessage::JoinRequest { heartbeat, .. }
            | MembershipMessage::JoinReply { heartbeat, .. } => {
                buf.extend_from_slice(&heartbeat.to_le_bytes());
            }
            MembershipMessage::Gossip { entries, .. } => {
                buf.extend_from_slice(&(entries.len() as i64).to_le_bytes());
                for entry in entries {
                    buf.extend_from_slice(&entry.address.id.to_le_bytes());
                    buf.extend_from_slice(&entry.address.port.to_le_bytes());
                    buf.extend_from_slice(&entry.heartbeat.to_le_bytes());
                }
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 8 {
            return Err(Error::MembershipWire(format!(
                "frame too short: {} bytes",
                bytes.len()
            )));
        }
        let kind = bytes[0];
        let mut addr_bytes = [0u8; 6];
        addr_bytes.copy_from_slice(&bytes[1..7]);
        let from = Address::from_bytes(addr_bytes);
        // bytes[7] is the reserved byte.
        let rest = &bytes[8..];

        match kind {
            KIND_JOIN_REQUEST | KIND_JOIN_REPLY => {
                if rest.len() < 8 {
                    return Err(Error::MembershipWire(
                        "join message missing heartbeat".to_string(),
                    ));
                }
                let heartbeat = i64::from_le_bytes(rest[0..8].try_into().unwrap());
                Ok(if kind == KIND_JOIN_REQUEST {
                    MembershipMessage::JoinRequest { from, heartbeat }
                } else {
                    MembershipMessage::JoinReply { from, heartbeat }
                })
            }
            KIND_GOSSIP => {
                if rest.len() < 8 {
                    return Err(Error::MembershipWire(
                        "gossip message missing entry count".to_string(),
                    ));
                }
                let n = i64::from_le_bytes(rest[0..8].try_into().unwrap());
                if n < 0 {
                    return Err(Error::MembershipWire("negative entry count".to_string()));
                }
                let n = n as usize;
                let mut offset = 8;
                let mut entries = Vec::with_capacity(n);
                for _ in 0..n {
                    if rest.len() < offset + 14 {
                        return Err(Error::MembershipWire(
                            "gossip message truncated mid-entry".to_string(),
                        ));
                    }
                    let id = u32::from_le_bytes(rest[offset..offset + 4].try_into().unwrap());
                    let port =
                        u16::from_le_bytes(rest[offset + 4..offset + 6].try_into().unwrap());
                    let heartbeat =
                        i64::from_le_bytes(rest[offset + 6..offset + 14].try_into().unwrap());
                    entries.push(GossipEntry {
                        address: Address::new(id, port),
                        heartbeat,
                    });
                    offset += 14;
                }
                Ok(MembershipMessage::Gossip { from, entries })
            }
            other => Err(Error::MembershipWire(format!(
                "unrecognized message kind: {other}"
            ))),
        }
    }
}
