//! Temporal connection and session identifiers.
//!
//! Both identifier kinds embed the start timestamp in their high bits so
//! that lexicographic order of the rendered form equals creation order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const MASK_48: u128 = (1 << 48) - 1;

/// A 96-bit connection identifier.
///
/// Layout: `start_ts_millis (48 bits) | per-run counter (48 bits)`. The
/// timestamp prefix makes ids sort temporally; the counter breaks ties.
/// Rendered as a fixed-width 24-digit lowercase hex string.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ConnectionId(u128);

impl ConnectionId {
    /// Builds an id from a start timestamp and counter value.
    pub fn new(ts: DateTime<Utc>, counter: u64) -> Self {
        let millis = ts.timestamp_millis().max(0) as u128;
        ConnectionId((millis & MASK_48) << 48 | (counter as u128 & MASK_48))
    }

    /// Parses the 24-digit hex rendering.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 24 {
            return None;
        }
        u128::from_str_radix(s, 16).ok().map(ConnectionId)
    }

    /// Millisecond timestamp embedded in the id.
    pub fn timestamp_millis(&self) -> i64 {
        (self.0 >> 48) as i64
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:024x}", self.0)
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConnectionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ConnectionId::parse(&s).ok_or_else(|| D::Error::custom("malformed connection id"))
    }
}

/// Allocates [ConnectionId]s from a shared monotonic counter.
#[derive(Debug, Default)]
pub struct ConnIdGen {
    counter: AtomicU64,
}

impl ConnIdGen {
    pub fn new() -> Self {
        ConnIdGen::default()
    }

    /// Returns the next id for a connection first observed at `ts`.
    pub fn next(&self, ts: DateTime<Utc>) -> ConnectionId {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        ConnectionId::new(ts, counter)
    }
}

/* --------------------------------------------------------------------------------- */

/// A session identifier: one PCAP import or one live-capture window.
///
/// Layout: `start_ts_millis (48 bits) | counter (16 bits)`, rendered as 16
/// hex digits. Used as the on-disk PCAP file stem.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(ts: DateTime<Utc>, counter: u64) -> Self {
        let millis = ts.timestamp_millis().max(0) as u64;
        SessionId((millis & MASK_48 as u64) << 16 | (counter & 0xffff))
    }

    /// Parses the 16-digit hex rendering.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 16 {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(SessionId)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SessionId::parse(&s).ok_or_else(|| D::Error::custom("malformed session id"))
    }
}

/// Allocates [SessionId]s.
#[derive(Debug, Default)]
pub struct SessionIdGen {
    counter: AtomicU64,
}

impl SessionIdGen {
    pub fn new() -> Self {
        SessionIdGen::default()
    }

    pub fn next(&self) -> SessionId {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        SessionId::new(Utc::now(), counter)
    }
}

/* --------------------------------------------------------------------------------- */

/// Allocates generic hex object ids (rules, searches). Same temporal layout
/// as [ConnectionId].
#[derive(Debug, Default)]
pub struct ObjectIdGen {
    counter: AtomicU64,
}

impl ObjectIdGen {
    pub fn new() -> Self {
        ObjectIdGen::default()
    }

    pub fn next(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        ConnectionId::new(Utc::now(), counter).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_conn_id_orders_by_time_then_counter() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::milliseconds(5);
        let a = ConnectionId::new(t0, 7);
        let b = ConnectionId::new(t0, 8);
        let c = ConnectionId::new(t1, 0);
        assert!(a < b);
        assert!(b < c);
        // rendered form preserves the order
        assert!(a.to_string() < b.to_string());
        assert!(b.to_string() < c.to_string());
    }

    #[test]
    fn core_conn_id_round_trips_through_hex() {
        let id = ConnectionId::new(Utc::now(), 42);
        assert_eq!(ConnectionId::parse(&id.to_string()), Some(id));
    }

    #[test]
    fn core_session_id_round_trips_through_hex() {
        let id = SessionIdGen::new().next();
        assert_eq!(SessionId::parse(&id.to_string()), Some(id));
    }
}
