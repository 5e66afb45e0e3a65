//! tests/component/mod.rs
//!
//! In-memory component tests, driving the `MembershipDetector` and `KvStore`
//! actors directly over their channels rather than through real QUIC
//! connections.

mod kv;
