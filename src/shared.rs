use std::fmt;

use rand::RngCore;

use crate::token::ResetToken;
use crate::MAX_CID_SIZE;

/// Protocol-level identifier for a connection.
///
/// Mainly useful for identifying this connection's packets on the wire with tools like Wireshark.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    /// length of CID
    len: u8,
    /// CID in byte array
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct cid from byte array
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Constructs cid by reading `len` bytes from a `Buf`
    ///
    /// Callers need to assure that `buf.remaining() >= len`
    pub(crate) fn from_buf(buf: &mut impl bytes::Buf, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        buf.copy_to_slice(&mut res[..len]);
        res
    }

    /// Construct cid of length `len` from cryptographically strong randomness
    pub(crate) fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }

    /// Decode from long header format
    pub(crate) fn decode_long(buf: &mut impl bytes::Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let len = buf.get_u8() as usize;
        match len > MAX_CID_SIZE || buf.remaining() < len {
            false => Some(Self::from_buf(buf, len)),
            true => None,
        }
    }

    /// Encode in long header format
    pub(crate) fn encode_long(&self, buf: &mut impl bytes::BufMut) {
        buf.put_u8(self.len() as u8);
        buf.put_slice(self);
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl ::std::ops::DerefMut for ConnectionId {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Explicit congestion notification codepoint
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EcnCodepoint {
    /// The ECT(0) codepoint, indicating that an endpoint is ECN-capable
    Ect0 = 0b10,
    /// The ECT(1) codepoint, for endpoints that wish to verify the path
    Ect1 = 0b01,
    /// The CE codepoint, signalling that congestion was experienced
    Ce = 0b11,
}

impl EcnCodepoint {
    /// Create new object from the given bits
    pub fn from_bits(x: u8) -> Option<Self> {
        use EcnCodepoint::*;
        Some(match x & 0b11 {
            0b10 => Ect0,
            0b01 => Ect1,
            0b11 => Ce,
            _ => {
                return None;
            }
        })
    }

    /// Whether the codepoint indicates that congestion was experienced
    pub fn is_ce(self) -> bool {
        matches!(self, Self::Ce)
    }
}

/// A locally issued connection ID, with the metadata the peer needs to use it
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct IssuedCid {
    pub(crate) sequence: u64,
    pub(crate) retire_prior_to: u64,
    pub(crate) id: ConnectionId,
    pub(crate) reset_token: ResetToken,
}

/// Instructions a connection issues to the endpoint that owns the demultiplexer
///
/// The endpoint drains these from [`Connection::poll_endpoint_events`] and updates its
/// connection-ID routing table accordingly.
///
/// [`Connection::poll_endpoint_events`]: crate::connection::Connection::poll_endpoint_events
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// Start routing `id` to this connection, and answer orphan datagrams bearing
    /// `reset_token` with a stateless reset
    AddCid {
        /// The newly issued connection ID
        id: ConnectionId,
        /// Stateless reset token to associate with `id`
        reset_token: ResetToken,
    },
    /// Stop routing `id` to this connection; the peer retired it
    RetireCid(ConnectionId),
    /// Forget `id` entirely as part of connection teardown
    RemoveCid(ConnectionId),
    /// Route every listed CID to a closed-connection responder for the drain period
    ///
    /// The responder replies to incoming packets with the supplied close packet.
    ReplaceWithClosed {
        /// All CIDs that were routed to this connection
        ids: Vec<ConnectionId>,
        /// Pre-assembled CONNECTION_CLOSE datagram payload to repeat
        packet: Vec<u8>,
    },
    /// The connection's drain period has ended and its state may be discarded
    Drained,
}
