//! Protocol state machine for the QUIC transport protocol (drafts 29 and 32)
//!
//! This crate contains the per-connection machinery of a QUIC endpoint: packet number
//! spaces with independent loss recovery, acknowledgement generation, the connection ID
//! lifecycle, stream and connection flow control, unreliable datagrams, address
//! validation tokens, and the wire codecs these are built from. It performs no I/O of
//! its own: datagrams, timers, and application calls are fed in, and outbound datagrams,
//! deadlines, and events come back out. The TLS handshake driver and the
//! packet-protection AEADs are likewise external, connected through the traits in
//! [`crypto`].

#![warn(missing_docs)]
#![warn(unreachable_pub)]

use std::{fmt, ops, time::Duration};

use bytes::{Buf, BufMut};

mod cid_generator;
mod coding;
mod config;
mod congestion;
mod connection;
pub mod crypto;
mod frame;
mod packet;
mod range_set;
mod shared;
mod token;
mod transport_error;
pub mod transport_parameters;
mod varint;

pub use crate::cid_generator::{ConnectionIdGenerator, RandomConnectionIdGenerator};
pub use crate::config::{
    ClientConfig, ConfigError, EndpointConfig, ServerConfig, TransportConfig,
};
pub use crate::congestion::{Controller, ControllerFactory, NewReno, NewRenoConfig};
pub use crate::connection::{
    Connection, ConnectionError, Event, RttEstimator, SendDatagramError, StreamEvent, Transmit,
};
pub use crate::frame::{ApplicationClose, ConnectionClose, Datagram, FrameType};
pub use crate::packet::SpaceId;
pub use crate::shared::{ConnectionId, EcnCodepoint, EndpointEvent};
pub use crate::token::{
    IncomingToken, InvalidRetryTokenError, NoneTokenStore, ResetToken, TokenGenerator, TokenStore,
};
pub use crate::transport_error::{TransportError, TransportErrorCode};
pub use crate::transport_parameters::TransportParameters;
pub use crate::varint::{VarInt, VarIntBoundsExceeded};

/// The QUIC protocol versions implemented, in order of preference
pub const DEFAULT_SUPPORTED_VERSIONS: &[u32] = &[0xff00_001d, 0xff00_0020];

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    /// Shorthand for `self == Side::Client`
    #[inline]
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    /// Shorthand for `self == Side::Server`
    #[inline]
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl Dir {
    fn iter() -> impl Iterator<Item = Self> {
        [Self::Bi, Self::Uni].iter().copied()
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Dir::*;
        f.pad(match *self {
            Bi => "bi",
            Uni => "uni",
        })
    }
}

/// Identifier for a stream within a particular connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub(crate) u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        write!(
            f,
            "{} {}directional stream {}",
            initiator,
            self.dir(),
            self.index()
        )
    }
}

impl StreamId {
    /// Create a new StreamId
    pub(crate) fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl From<StreamId> for VarInt {
    fn from(x: StreamId) -> Self {
        Self(x.0)
    }
}

impl From<VarInt> for StreamId {
    fn from(v: VarInt) -> Self {
        Self(v.0)
    }
}

impl coding::Codec for StreamId {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        VarInt::decode(buf).map(|x| Self(x.into_inner()))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        VarInt::from_u64(self.0).unwrap().encode(buf)
    }
}

//
// Useful internal constants
//

const RESET_TOKEN_SIZE: usize = 16;
const MAX_CID_SIZE: usize = 18;
const MIN_CID_SIZE: usize = 4;
/// Initial datagrams from a client must fill this many bytes
const MIN_INITIAL_SIZE: usize = 1200;
/// Lowest resolution at which timers fire
const TIMER_GRANULARITY: Duration = Duration::from_millis(1);
/// Maximum acknowledgement delay we apply locally, also advertised to the peer
const DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(25);
/// Stream counts are limited to this value by the transport parameter encoding
const MAX_STREAM_COUNT: u64 = 1 << 60;
