//! src/kv/wire.rs
//!
//! ASCII, `::`-delimited codec for the KV protocol (§6):
//!
//! ```text
//! <transID>::<fromAddr=id:port>::<type>::<payload>
//! payload by type:
//!   CREATE|UPDATE : key::value::replicaRole
//!   READ|DELETE   : key
//!   WRITE_REPLY   : "1" or "0"
//!   READ_REPLY    : value            (possibly empty)
//! ```
//!
//! The numeric `<type>` token matches the order CREATE, READ, UPDATE,
//! DELETE, WRITE_REPLY, READ_REPLY; `replicaRole` matches PRIMARY,
//! SECONDARY, TERTIARY. Transaction id `-1` marks a stabilization
//! bypass message (§4.4).

use crate::domain::{Address, ReplicaRole};
use crate::error::Error;

const DELIMITER: char = ':';

const TYPE_CREATE: u8 = 0;
const TYPE_READ: u8 = 1;
const TYPE_UPDATE: u8 = 2;
const TYPE_DELETE: u8 = 3;
const TYPE_WRITE_REPLY: u8 = 4;
const TYPE_READ_REPLY: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvMessage {
    Create {
        trans_id: i64,
        from: Address,
        key: String,
        value: String,
        role: ReplicaRole,
    },
    Update {
        trans_id: i64,
        from: Address,
        key: String,
        value: String,
        role: ReplicaRole,
    },
    Read {
        trans_id: i64,
        from: Address,
        key: String,
    },
    Delete {
        trans_id: i64,
        from: Address,
        key: String,
    },
    WriteReply {
        trans_id: i64,
        from: Address,
        success: bool,
    },
    ReadReply {
        trans_id: i64,
        from: Address,
        value: String,
    },
}

impl KvMessage {
    pub fn trans_id(&self) -> i64 {
        match self {
            KvMessage::Create { trans_id, .. }
            | KvMessage::Update { trans_id, .. }
            | KvMessage::Read { trans_id, .. }
            | KvMessage::Delete { trans_id, .. }
            | KvMessage::WriteReply { trans_id, .. }
            | KvMessage::ReadReply { trans_id, .. } => *trans_id,
        }
    }

    pub fn from(&self) -> Address {
        match self {
            KvMessage::Create { from, .. }
            | KvMessage::Update { from, .. }
            | KvMessage::Read { from, .. }
            | KvMessage::Delete { from, .. }
            | KvMessage::WriteReply { from, .. }
            | KvMessage::ReadReply { from, .. } => *from,
        }
    }

    pub fn encode(&self) -> String {
        // Note: `::` as field separator means a `::` delimiter appears
        // between every pair of fields below — writing them out with a
        // single `:` joined by DELIMITER twice, matching the source's
        // `"::"` literal exactly.
        let sep = format!("{DELIMITER}{DELIMITER}");
        let (type_code, payload) = match self {
            KvMessage::Create { key, value, role, .. } => {
                (TYPE_CREATE, format!("{key}{sep}{value}{sep}{}", role.as_u8()))
            }
            KvMessage::Update { key, value, role, .. } => {
                (TYPE_UPDATE, format!("{key}{sep}{value}{sep}{}", role.as_u8()))
            }
            KvMessage::Read { key, .. } => (TYPE_READ, key.clone()),
            KvMessage::Delete { key, .. } => (TYPE_DELETE, key.clone()),
            KvMessage::WriteReply { success, .. } => {
                (TYPE_WRITE_REPLY, if *success { "1".to_string() } else { "0".to_string() })
            }
            KvMessage::ReadReply { value, .. } => (TYPE_READ_REPLY, value.clone()),
        };

        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.trans_id(),
            self.from(),
            type_code,
            payload
        )
    }

    pub fn decode(s: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = s.split("::").collect();
        if parts.len() < 4 {
            return Err(Error::KvWire(format!("too few fields: {s}")));
        }

        let trans_id: i64 = parts[0]
            .parse()
            .map_err(|_| Error::KvWire(format!("bad transaction id: {}", parts[0])))?;
        let from: Address = parts[1]
            .parse()
            .map_err(|_| Error::KvWire(format!("bad from address: {}", parts[1])))?;
        let type_code: u8 = parts[2]
            .parse()
            .map_err(|_| Error::KvWire(format!("bad type code: {}", parts[2])))?;

        match type_code {
            TYPE_CREATE | TYPE_UPDATE => {
                if parts.len() < 6 {
                    return Err(Error::KvWire("create/update message missing fields".to_string()));
                }
                let key = parts[3].to_string();
                let value = parts[4].to_string();
                let role = parts[5]
                    .parse::<u8>()
                    .ok()
                    .and_then(ReplicaRole::from_u8)
                    .ok_or_else(|| Error::KvWire(format!("bad replica role: {}", parts[5])))?;
                Ok(if type_code == TYPE_CREATE {
                    KvMessage::Create { trans_id, from, key, value, role }
                } else {
                    KvMessage::Update { trans_id, from, key, value, role }
                })
            }
            TYPE_READ | TYPE_DELETE => {
                if parts.len() < 4 {
                    return Err(Error::KvWire("read/delete message missing key".to_string()));
                }
                let key = parts[3..].join("::");
                Ok(if type_code == TYPE_READ {
                    KvMessage::Read { trans_id, from, key }
                } else {
                    KvMessage::Delete { trans_id, from, key }
                })
            }
            TYPE_WRITE_REPLY => {
                let success = parts.get(3).copied() == Some("1");
                Ok(KvMessage::WriteReply { trans_id, from, success })
            }
            TYPE_READ_REPLY => {
                let value = parts[3..].join("::");
                Ok(KvMessage::ReadReply { trans_id, from, value })
            }
            other => Err(Error::KvWire(format!("unrecognized message type: {other}"))),
        }
    }
}
