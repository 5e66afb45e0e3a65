//! src/domain.rs
//!
//! The core data model shared by every layer of the node: the 6-byte
//! `Address` identity and the `ReplicaRole` a node can hold for a key.
//! Larger per-layer state (the membership table, the ring, transactions)
//! lives in `membership` and `kv` respectively, close to the code that
//! owns it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A node's identity on the wire: a 32-bit id and a 16-bit port, packed
/// into 6 bytes. Equality, ordering and hashing are all over those bytes.
///
/// Serializes as its `"<id>:<port>"` string form rather than the derived
/// `{id, port}` map shape, so it round-trips through TOML config fields
/// (`identity = "7:9000"`) and reads as a single scalar in JSON snapshots.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub id: u32,
    pub port: u16,
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}

impl Address {
    pub const INTRODUCER: Address = Address { id: 1, port: 0 };

    pub fn new(id: u32, port: u16) -> Self {
        Self { id, port }
    }

    /// Packs the address into its 6-byte wire representation, little-endian.
    pub fn to_bytes(self) -> [u8; 6] {
        let mut buf = [0u8; 6];
        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..6].copy_from_slice(&self.port.to_le_bytes());
        buf
    }

    /// Unpacks an address from its 6-byte wire representation.
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        let id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let port = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        Self { id, port }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.port)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.port)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id_str, port_str) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        let id: u32 = id_str
            .parse()
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        Ok(Address { id, port })
    }
}

/// The role a replica holds for a particular key, assigned by the key's
/// ring position at the time of (re-)replication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    Primary,
    Secondary,
    Tertiary,
}

impl ReplicaRole {
    /// Maps a 0-based replica index (as returned by ring placement) to its role.
    pub fn from_index(idx: usize) -> Self {
        match idx {
            0 => ReplicaRole::Primary,
            1 => ReplicaRole::Secondary,
            2 => ReplicaRole::Tertiary,
            _ => panic!("replica index out of range: {idx}"),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ReplicaRole::Primary => 0,
            ReplicaRole::Secondary => 1,
            ReplicaRole::Tertiary => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ReplicaRole::Primary),
            1 => Some(ReplicaRole::Secondary),
            2 => Some(ReplicaRole::Tertiary),
            _ => None,
        }
    }
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicaRole::Primary => "PRIMARY",
            ReplicaRole::Secondary => "SECONDARY",
            ReplicaRole::Tertiary => "TERTIARY",
        };
        write!(f, "{s}")
    }
}
