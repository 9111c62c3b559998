use std::{
    collections::VecDeque,
    mem,
    ops::{Index, IndexMut},
    time::{Duration, Instant},
};

use bytes::Bytes;
use rustc_hash::FxHashSet;

use super::assembler::Assembler;
use super::recv_packets::ReceivedPacketTracker;
use crate::{
    crypto::Keys,
    frame::{self, StreamMetaVec},
    packet::SpaceId,
    shared::IssuedCid,
    StreamId, VarInt,
};

/// Glue-level state for one packet number space: keys, inbound ACK bookkeeping, the
/// retransmission queue, and the portion of the cryptographic handshake stream that
/// travels at this encryption level
pub(crate) struct PacketSpace {
    pub(crate) crypto: Option<Keys>,
    /// Tracks received packets and decides when to acknowledge them
    pub(crate) pending_acks: ReceivedPacketTracker,

    /// Data to send
    pub(crate) pending: Retransmits,
    pub(crate) ping_pending: bool,

    /// Incoming cryptographic handshake stream
    pub(crate) crypto_stream: Assembler,
    /// Current offset of outgoing cryptographic handshake stream
    pub(crate) crypto_offset: u64,
}

impl PacketSpace {
    pub(crate) fn new(id: SpaceId, max_ack_delay: Duration) -> Self {
        Self {
            crypto: None,
            pending_acks: ReceivedPacketTracker::new(id, max_ack_delay),
            pending: Retransmits::default(),
            ping_pending: false,
            crypto_stream: Assembler::new(),
            crypto_offset: 0,
        }
    }

    /// Whether the space has anything to transmit besides acknowledgements
    pub(crate) fn can_send_other_than_acks(&self) -> bool {
        !self.pending.is_empty() || self.ping_pending
    }
}

impl Index<SpaceId> for [PacketSpace; 3] {
    type Output = PacketSpace;
    fn index(&self, space: SpaceId) -> &PacketSpace {
        &self.as_ref()[space as usize]
    }
}

impl IndexMut<SpaceId> for [PacketSpace; 3] {
    fn index_mut(&mut self, space: SpaceId) -> &mut PacketSpace {
        &mut self.as_mut()[space as usize]
    }
}

/// Bookkeeping for a packet that was transmitted and may still need to be acknowledged
///
/// The frames a packet carried are recorded as plain data, not callbacks: when the packet
/// is finally acknowledged or declared lost, the connection matches on the frame kinds
/// and notifies the owning component directly.
#[derive(Debug)]
pub(crate) struct SentPacket {
    /// The number the packet was sent with
    pub(crate) packet_number: u64,
    /// The time the packet was sent.
    pub(crate) time_sent: Instant,
    /// The number of bytes sent in the packet, not including UDP or IP overhead, but
    /// including QUIC framing overhead
    pub(crate) size: u16,
    /// Whether an acknowledgement is expected directly in response to this packet.
    pub(crate) ack_eliciting: bool,
    /// Whether the packet counts towards bytes in flight
    pub(crate) in_flight: bool,
    /// Whether the packet was protected with 0-RTT keys
    pub(crate) is_0rtt: bool,
    /// The largest packet number acknowledged by ACK frames carried in this packet, used
    /// to prune our own acknowledgement state once the peer has seen it
    pub(crate) largest_acked: Option<u64>,
    /// Data which needs to be retransmitted in case the packet is lost.
    /// The data is boxed to minimize `SentPacket` size for the typical case of
    /// packets only containing ACKs and STREAM frames.
    pub(crate) retransmits: ThinRetransmits,
    /// Metadata of stream frames in a packet
    ///
    /// The actual application data is stored with the stream state.
    pub(crate) stream_frames: StreamMetaVec,
}

/// Retransmittable data queue
#[derive(Debug, Default)]
pub(crate) struct Retransmits {
    pub(crate) max_data: bool,
    pub(crate) max_stream_id: [bool; 2],
    pub(crate) reset_stream: Vec<(StreamId, VarInt)>,
    pub(crate) stop_sending: Vec<frame::StopSending>,
    pub(crate) max_stream_data: FxHashSet<StreamId>,
    pub(crate) crypto: VecDeque<frame::Crypto>,
    pub(crate) new_cids: Vec<IssuedCid>,
    pub(crate) retire_cids: Vec<u64>,
    pub(crate) new_tokens: Vec<Bytes>,
    pub(crate) handshake_done: bool,
}

impl Retransmits {
    pub(crate) fn is_empty(&self) -> bool {
        !self.max_data
            && !self.max_stream_id[0]
            && !self.max_stream_id[1]
            && self.reset_stream.is_empty()
            && self.stop_sending.is_empty()
            && self.max_stream_data.is_empty()
            && self.crypto.is_empty()
            && self.new_cids.is_empty()
            && self.retire_cids.is_empty()
            && self.new_tokens.is_empty()
            && !self.handshake_done
    }
}

impl ::std::ops::BitOrAssign for Retransmits {
    fn bitor_assign(&mut self, rhs: Self) {
        // We reduce in-stream head-of-line blocking by queueing retransmits before other
        // data for CRYPTO frames.
        self.max_data |= rhs.max_data;
        self.max_stream_id[0] |= rhs.max_stream_id[0];
        self.max_stream_id[1] |= rhs.max_stream_id[1];
        self.reset_stream.extend_from_slice(&rhs.reset_stream);
        self.stop_sending.extend_from_slice(&rhs.stop_sending);
        self.max_stream_data.extend(&rhs.max_stream_data);
        for crypto in rhs.crypto.into_iter().rev() {
            self.crypto.push_front(crypto);
        }
        self.new_cids.extend(&rhs.new_cids);
        self.retire_cids.extend(rhs.retire_cids);
        self.new_tokens.extend(rhs.new_tokens);
        self.handshake_done |= rhs.handshake_done;
    }
}

impl ::std::ops::BitOrAssign<ThinRetransmits> for Retransmits {
    fn bitor_assign(&mut self, rhs: ThinRetransmits) {
        if let Some(retransmits) = rhs.retransmits {
            self.bitor_assign(*retransmits)
        }
    }
}

/// A variant of `Retransmits` which only allocates storage when required
#[derive(Debug, Default)]
pub(crate) struct ThinRetransmits {
    retransmits: Option<Box<Retransmits>>,
}

impl ThinRetransmits {
    /// Returns `true` if no retransmits are necessary
    pub(crate) fn is_empty(&self) -> bool {
        match &self.retransmits {
            Some(retransmits) => retransmits.is_empty(),
            None => true,
        }
    }

    /// Returns a reference to the retransmits stored in this box
    pub(crate) fn get(&self) -> Option<&Retransmits> {
        self.retransmits.as_deref()
    }

    /// Returns a mutable reference to the stored retransmits
    ///
    /// This function will allocate a backing storage if required.
    pub(crate) fn get_or_create(&mut self) -> &mut Retransmits {
        if self.retransmits.is_none() {
            self.retransmits = Some(Box::new(Retransmits::default()));
        }
        self.retransmits.as_deref_mut().unwrap()
    }

    /// Take the stored retransmits out, leaving this empty
    pub(crate) fn take(&mut self) -> Self {
        Self {
            retransmits: mem::take(&mut self.retransmits),
        }
    }
}
