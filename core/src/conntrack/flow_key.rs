//! Bidirectional flow identifiers.
//!
//! A [FlowKey] identifies a TCP conversation independent of packet
//! direction: both directions of one conversation canonicalize to the same
//! key. The resolved client/server endpoints of a tracked conversation are
//! carried separately as [Endpoints].

use std::cmp;
use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

/// A direction-agnostic flow identifier.
///
/// Holds the unordered endpoint pair of a TCP conversation, stored as
/// `(low, high)` under the standard socket-address ordering (IP first, port
/// second). Exactly one `FlowKey` exists for any conversation; packets of
/// both directions map to it.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct FlowKey {
    /// The smaller endpoint.
    pub lo: SocketAddr,
    /// The larger endpoint.
    pub hi: SocketAddr,
}

impl FlowKey {
    /// Returns the flow key of a packet with `src` and `dst` IP/port pairs.
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        FlowKey {
            lo: cmp::min(src, dst),
            hi: cmp::max(src, dst),
        }
    }

    /// Returns the side bit of a packet sent from `src`: `0` for the low
    /// endpoint, `1` for the high endpoint.
    #[inline]
    pub fn side_of(&self, src: SocketAddr) -> u8 {
        u8::from(src != self.lo)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <> {}", self.lo, self.hi)
    }
}

/// Resolved client/server endpoints of a tracked conversation.
///
/// The client is the side that sent the first SYN; for mid-stream captures
/// it is the side of the first observed packet (see
/// [Conn::new](crate::conntrack::conn::Conn)).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct Endpoints {
    /// The client connection endpoint.
    pub client: SocketAddr,
    /// The server connection endpoint.
    pub server: SocketAddr,
}

impl Endpoints {
    /// Returns `true` if a packet sent from `src` travels client -> server.
    #[inline]
    pub fn dir_of(&self, src: SocketAddr) -> bool {
        src == self.client
    }

    /// Swaps the client and server roles.
    pub(crate) fn flipped(&self) -> Endpoints {
        Endpoints {
            client: self.server,
            server: self.client,
        }
    }
}

impl fmt::Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.client, self.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn core_flow_key_direction_agnostic() {
        let a = addr("10.0.0.1:40000");
        let b = addr("10.0.0.2:80");
        assert_eq!(FlowKey::new(a, b), FlowKey::new(b, a));
    }

    #[test]
    fn core_flow_key_sides_differ() {
        let a = addr("10.0.0.1:40000");
        let b = addr("10.0.0.2:80");
        let key = FlowKey::new(a, b);
        assert_ne!(key.side_of(a), key.side_of(b));
    }

    #[test]
    fn core_flow_key_port_breaks_tie() {
        let a = addr("10.0.0.1:4000");
        let b = addr("10.0.0.1:80");
        let key = FlowKey::new(a, b);
        assert_eq!(key.lo, b);
        assert_eq!(key.hi, a);
    }
}
