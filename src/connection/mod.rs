use std::{
    collections::{BTreeMap, VecDeque},
    fmt, mem,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    coding::BufMutExt,
    config::{ClientConfig, EndpointConfig, ServerConfig, TransportConfig},
    crypto::Keys,
    frame::{self, ApplicationClose, Close, ConnectionClose, Frame, FrameStruct},
    packet::{Header, InitialHeader, LongType, Packet, PacketNumber, PartialDecode, SpaceId},
    shared::{ConnectionId, EndpointEvent},
    token::ResetToken,
    transport_error::TransportError,
    transport_parameters::TransportParameters,
    Dir, Side, StreamId, VarInt, MIN_INITIAL_SIZE, RESET_TOKEN_SIZE,
};

mod assembler;

mod cid_state;
use cid_state::CidState;

mod datagrams;
use datagrams::DatagramState;
pub use datagrams::SendDatagramError;

mod flow_control;
use flow_control::FlowController;

mod history;

mod packet_number;

mod pacing;
use pacing::Pacer;

mod recv_packets;

mod rtt;
pub use rtt::RttEstimator;

mod sent_packets;
use sent_packets::{SendMode, SentPacketHandler};

mod spaces;
use spaces::{PacketSpace, Retransmits, SentPacket, ThinRetransmits};

mod streams;
use streams::StreamsState;

mod timer;
use timer::{Timer, TimerTable};

/// Idle timeout tolerated during the handshake regardless of configuration
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// An outgoing UDP datagram produced by the connection
#[derive(Debug)]
pub struct Transmit {
    /// The address the datagram must be sent to
    pub destination: SocketAddr,
    /// The datagram payload, one or more coalesced QUIC packets
    pub contents: Vec<u8>,
}

/// Things the application or shell must react to
#[derive(Debug)]
pub enum Event {
    /// New data is readable from the handshake's CRYPTO stream
    ///
    /// The TLS driver should call [`Connection::read_crypto`].
    HandshakeDataReady,
    /// The connection was established
    Connected,
    /// A Retry packet arrived; initial protection must be re-derived from the new
    /// remote connection ID and queued handshake data retransmitted
    Retry,
    /// The connection was lost
    ConnectionLost {
        /// Why the connection ended
        reason: ConnectionError,
    },
    /// The server supplied an address validation token for future connections
    ///
    /// Clients should place it in their [`TokenStore`](crate::TokenStore).
    NewToken(Bytes),
    /// Something happened on a stream
    Stream(StreamEvent),
    /// One or more application datagrams were received
    DatagramReceived,
}

/// Stream-level happenings
#[derive(Debug)]
pub enum StreamEvent {
    /// Stream data arrived
    ///
    /// Ordering and reassembly are the receiver's concern; the transport has already
    /// enforced flow control for these bytes.
    Data {
        /// Which stream
        id: StreamId,
        /// Offset of `data` within the stream
        offset: u64,
        /// The payload
        data: Bytes,
        /// Whether the stream ends at `offset + data.len()`
        fin: bool,
    },
    /// The peer abandoned transmitting on the stream
    Reset {
        /// Which stream
        id: StreamId,
        /// Application-supplied reason
        error_code: VarInt,
    },
    /// The peer asked us to stop transmitting on the stream
    Stopped {
        /// Which stream
        id: StreamId,
        /// Application-supplied reason
        error_code: VarInt,
    },
    /// Previously transmitted stream data was declared lost and must be supplied again
    ///
    /// The affected offset ranges are available from
    /// [`Connection::stream_retransmit_ranges`].
    DataLost {
        /// Which stream
        id: StreamId,
    },
    /// Flow control credit became available for sending
    Writable,
}

/// Reasons why a connection might be lost
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer violated the QUIC specification as understood by this implementation
    #[error(transparent)]
    TransportError(#[from] TransportError),
    /// The peer's QUIC stack aborted the connection automatically
    #[error("closed by peer: {0}")]
    ConnectionClosed(ConnectionClose),
    /// The peer closed the connection
    #[error("closed by peer application: {0}")]
    ApplicationClosed(ApplicationClose),
    /// The peer is unable to continue processing this connection, usually due to having restarted
    #[error("reset by peer")]
    Reset,
    /// Communication with the peer has lapsed for longer than the negotiated idle timeout
    #[error("timed out")]
    TimedOut,
    /// The local application closed the connection
    #[error("closed")]
    LocallyClosed,
    /// The peer doesn't implement any supported version
    #[error("peer doesn't implement any supported version")]
    VersionMismatch,
}

/// Connection lifecycle
#[derive(Debug)]
enum State {
    Handshake,
    Established,
    /// A CONNECTION_CLOSE is being transmitted until the drain period ends
    Closed { reason: ConnectionError },
    /// The peer closed; we keep state only long enough to absorb stray packets
    Draining { reason: ConnectionError },
    Drained,
}

impl State {
    fn is_established(&self) -> bool {
        matches!(*self, Self::Established)
    }
    fn is_closed(&self) -> bool {
        matches!(
            *self,
            Self::Closed { .. } | Self::Draining { .. } | Self::Drained
        )
    }
}

/// Connection IDs the peer issued for us to address it with
struct RemoteCids {
    active: ConnectionId,
    active_seq: u64,
    active_reset_token: Option<ResetToken>,
    /// Unused CIDs, by sequence number
    stored: BTreeMap<u64, (ConnectionId, ResetToken)>,
    /// Everything below this has been or is being retired
    retire_prior_to: u64,
    /// How many CIDs we are willing to keep, as advertised
    limit: u64,
}

impl RemoteCids {
    fn new(active: ConnectionId, limit: u64) -> Self {
        Self {
            active,
            active_seq: 0,
            active_reset_token: None,
            stored: BTreeMap::new(),
            retire_prior_to: 0,
            limit,
        }
    }

    /// Handle a NEW_CONNECTION_ID frame; returns sequence numbers to retire
    fn insert(&mut self, frame: frame::NewConnectionId) -> Result<Vec<u64>, TransportError> {
        if self.active.is_empty() {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "NEW_CONNECTION_ID when using zero-length connection IDs",
            ));
        }
        let mut retired = Vec::new();
        if frame.sequence < self.retire_prior_to {
            // Already obsolete on arrival
            retired.push(frame.sequence);
            return Ok(retired);
        }
        if frame.sequence == self.active_seq {
            if frame.id != self.active {
                return Err(TransportError::PROTOCOL_VIOLATION(
                    "sequence number reused for a different connection ID",
                ));
            }
            self.active_reset_token = Some(frame.reset_token);
            return Ok(retired);
        }
        match self.stored.get(&frame.sequence) {
            Some((id, _)) if *id != frame.id => {
                return Err(TransportError::PROTOCOL_VIOLATION(
                    "sequence number reused for a different connection ID",
                ));
            }
            _ => {}
        }
        self.stored
            .insert(frame.sequence, (frame.id, frame.reset_token));

        if frame.retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = frame.retire_prior_to;
            let obsolete: Vec<u64> = self
                .stored
                .range(..frame.retire_prior_to)
                .map(|(&seq, _)| seq)
                .collect();
            for seq in obsolete {
                self.stored.remove(&seq);
                retired.push(seq);
            }
            if self.active_seq < frame.retire_prior_to {
                retired.push(self.active_seq);
                self.advance(frame.retire_prior_to)?;
            }
        }

        if self.stored.len() as u64 + 1 > self.limit {
            return Err(TransportError::CONNECTION_ID_LIMIT_ERROR(
                "more connection IDs issued than our active_connection_id_limit",
            ));
        }
        Ok(retired)
    }

    /// Switch to the lowest stored CID with sequence at least `min_seq`
    fn advance(&mut self, min_seq: u64) -> Result<(), TransportError> {
        let (&seq, _) = self.stored.range(min_seq..).next().ok_or_else(|| {
            TransportError::PROTOCOL_VIOLATION("all connection IDs retired with no replacement")
        })?;
        let (id, token) = self.stored.remove(&seq).unwrap();
        self.active = id;
        self.active_seq = seq;
        self.active_reset_token = Some(token);
        Ok(())
    }

    fn reset_tokens(&self) -> impl Iterator<Item = &ResetToken> {
        self.active_reset_token
            .iter()
            .chain(self.stored.values().map(|(_, token)| token))
    }
}

/// Protocol state machine for a single QUIC connection
///
/// Owns all per-connection state and is driven entirely from the outside: feed inbound
/// datagrams to [`handle_datagram`](Self::handle_datagram), deliver timer expirations to
/// [`handle_timeout`](Self::handle_timeout), collect outbound datagrams from
/// [`poll_transmit`](Self::poll_transmit), the next deadline from
/// [`poll_timeout`](Self::poll_timeout), and application / endpoint notifications from
/// [`poll`](Self::poll) and [`poll_endpoint_events`](Self::poll_endpoint_events).
/// Exactly one task should own a `Connection`; no internal synchronization exists.
pub struct Connection {
    side: Side,
    state: State,
    config: Arc<TransportConfig>,
    remote: SocketAddr,
    version: u32,
    supported_versions: Vec<u32>,
    local_cid_len: usize,

    spaces: [PacketSpace; 3],
    highest_space: SpaceId,
    sent: SentPacketHandler,
    pacer: Pacer,
    timers: TimerTable,

    cids: CidState,
    rem_cids: RemoteCids,
    streams: StreamsState,
    /// Connection-level flow control
    flow: FlowController,
    datagrams: DatagramState,

    peer_params: TransportParameters,
    local_params: TransportParameters,
    /// Retry token to include in future Initial packets (client)
    retry_token: Bytes,
    /// Source CID of a received Retry packet
    retry_src_cid: Option<ConnectionId>,
    /// Stateless reset token received in the peer's transport parameters
    peer_params_reset_token: Option<ResetToken>,

    /// Application data waiting to be packed into STREAM frames
    pending_stream_data: VecDeque<(StreamId, u64, Bytes, bool)>,
    /// A PATH_CHALLENGE value owed a PATH_RESPONSE
    path_response: Option<u64>,
    /// The connection ID issued during the handshake; our identity in long headers
    handshake_cid: ConnectionId,
    /// Destination CID of the most recently processed packet
    last_dst_cid: ConnectionId,
    /// Where NEW_TOKEN tokens are kept for future connections (client)
    token_store: Option<Arc<dyn crate::token::TokenStore>>,
    /// Name the server was addressed by, keying the token store (client)
    server_name: Option<String>,

    events: VecDeque<Event>,
    endpoint_events: VecDeque<EndpointEvent>,
    /// Close frame to transmit while in `State::Closed`
    close_frame: Option<Close>,
    close_pending: bool,
    /// Pre-assembled close datagram, replayed at most once per inbound packet
    close_packet: Option<Vec<u8>>,

    idle_deadline_extended_on_send: bool,
    handshake_complete: bool,
}

impl Connection {
    /// Initiate a connection to `server_name` at `remote`
    ///
    /// `local_cid` is the CID the endpoint routes to this connection;
    /// `initial_dst_cid` seeds the server's initial packet protection.
    pub fn new_client(
        config: &ClientConfig,
        endpoint_config: &EndpointConfig,
        local_cid: ConnectionId,
        initial_dst_cid: ConnectionId,
        remote: SocketAddr,
        server_name: Option<&str>,
        now: Instant,
    ) -> Self {
        let mut conn = Self::new(
            Side::Client,
            config.transport.clone(),
            endpoint_config,
            None,
            local_cid,
            initial_dst_cid,
            None,
            None,
            remote,
            config.version,
            now,
        );
        conn.token_store = config.token_store.clone();
        conn.server_name = server_name.map(str::to_owned);
        // Redeem a NEW_TOKEN token from an earlier connection, if one was kept
        if let (Some(store), Some(name)) = (&conn.token_store, &conn.server_name) {
            if let Some(token) = store.take(name) {
                trace!("using stored address validation token");
                conn.retry_token = token;
            }
        }
        conn
    }

    /// Accept a connection from `remote`
    ///
    /// `retry_src_cid` is the source CID of the Retry the endpoint sent, if any.
    #[allow(clippy::too_many_arguments)]
    pub fn new_server(
        server_config: &ServerConfig,
        endpoint_config: &EndpointConfig,
        local_cid: ConnectionId,
        orig_dst_cid: ConnectionId,
        remote_src_cid: ConnectionId,
        retry_src_cid: Option<ConnectionId>,
        remote: SocketAddr,
        version: u32,
        peer_validated: bool,
        now: Instant,
    ) -> Self {
        let mut conn = Self::new(
            Side::Server,
            server_config.transport.clone(),
            endpoint_config,
            Some(orig_dst_cid),
            local_cid,
            remote_src_cid,
            Some(orig_dst_cid),
            retry_src_cid,
            remote,
            version,
            now,
        );
        if peer_validated {
            conn.sent.set_peer_validated();
        }
        conn
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        side: Side,
        config: Arc<TransportConfig>,
        endpoint_config: &EndpointConfig,
        initial_client_dest_cid: Option<ConnectionId>,
        local_cid: ConnectionId,
        rem_cid: ConnectionId,
        orig_dst_cid: Option<ConnectionId>,
        retry_src_cid: Option<ConnectionId>,
        remote: SocketAddr,
        version: u32,
        now: Instant,
    ) -> Self {
        let congestion = config
            .congestion_controller_factory
            .clone()
            .build(now, config.initial_mtu);
        let initial_window = congestion.initial_window();
        let sent = SentPacketHandler::new(side, &config, congestion, now);
        let local_params = TransportParameters::new(
            &config,
            endpoint_config,
            local_cid,
            orig_dst_cid,
            retry_src_cid,
        );
        Self {
            side,
            state: State::Handshake,
            remote,
            version,
            supported_versions: endpoint_config.supported_versions.clone(),
            local_cid_len: endpoint_config.cid_len,
            spaces: [
                PacketSpace::new(SpaceId::Initial, crate::DEFAULT_MAX_ACK_DELAY),
                PacketSpace::new(SpaceId::Handshake, crate::DEFAULT_MAX_ACK_DELAY),
                PacketSpace::new(SpaceId::Data, crate::DEFAULT_MAX_ACK_DELAY),
            ],
            highest_space: SpaceId::Initial,
            sent,
            pacer: Pacer::new(initial_window, now),
            timers: TimerTable::default(),
            cids: CidState::new(
                local_cid,
                initial_client_dest_cid,
                (endpoint_config.cid_generator_factory)(),
                endpoint_config.reset_key.clone(),
                config.allow_retirement_of_current_cid,
            ),
            rem_cids: RemoteCids::new(rem_cid, crate::transport_parameters::CID_QUEUE_LEN as u64),
            streams: StreamsState::new(
                side,
                config.max_concurrent_bidi_streams.into_inner(),
                config.max_concurrent_uni_streams.into_inner(),
                config.stream_receive_window.into_inner(),
                config.max_stream_receive_window.into_inner(),
            ),
            flow: FlowController::new(
                config.receive_window.into_inner(),
                config.max_receive_window.into_inner(),
                0,
            ),
            datagrams: DatagramState::new(config.datagram_send_buffer_size),
            peer_params: TransportParameters::default(),
            local_params,
            retry_token: Bytes::new(),
            retry_src_cid: None,
            peer_params_reset_token: None,
            pending_stream_data: VecDeque::new(),
            path_response: None,
            handshake_cid: local_cid,
            last_dst_cid: local_cid,
            token_store: None,
            server_name: None,
            events: VecDeque::new(),
            endpoint_events: VecDeque::new(),
            close_frame: None,
            close_pending: false,
            close_packet: None,
            idle_deadline_extended_on_send: false,
            handshake_complete: false,
            config,
        }
    }

    //
    // Driving the state machine
    //

    /// Process an inbound UDP datagram
    pub fn handle_datagram(&mut self, now: Instant, remote: SocketAddr, data: BytesMut) {
        if remote != self.remote {
            // Migration is not negotiated by this implementation
            trace!(%remote, "discarding datagram from unknown address");
            return;
        }
        if matches!(self.state, State::Drained) {
            return;
        }
        self.sent.received_bytes(data.len() as u64);

        let mut remaining = Some(data);
        while let Some(data) = remaining.take() {
            if data.is_empty() {
                break;
            }
            match PartialDecode::new(data, self.local_cid_len, &self.supported_versions) {
                Ok((partial_decode, rest)) => {
                    remaining = rest;
                    self.handle_decode(now, partial_decode);
                }
                Err(e) => {
                    trace!("malformed header: {e}");
                    return;
                }
            }
        }
    }

    fn handle_decode(&mut self, now: Instant, partial_decode: PartialDecode) {
        let header_crypto = match partial_decode.space() {
            Some(space) => match self.spaces[space].crypto.as_ref() {
                Some(keys) => Some(&*keys.header.remote),
                None => {
                    trace!(?space, "dropping packet for space without keys");
                    return;
                }
            },
            // Retry and Version Negotiation are unprotected
            None => None,
        };
        match partial_decode.finish(header_crypto) {
            Ok(packet) => self.handle_packet(now, packet),
            Err(e) => trace!("unable to complete packet decoding: {e}"),
        }
    }

    fn handle_packet(&mut self, now: Instant, mut packet: Packet) {
        match packet.header {
            Header::Retry { src_cid, .. } => {
                self.handle_retry(now, src_cid, packet.payload.freeze());
                return;
            }
            Header::VersionNegotiate { .. } => {
                if self.side.is_client() && matches!(self.state, State::Handshake) {
                    self.kill(ConnectionError::VersionMismatch);
                }
                return;
            }
            _ => {}
        }

        let space = packet.header.space();
        self.last_dst_cid = *packet.header.dst_cid();
        let number = match packet.header.number() {
            Some(x) => x,
            None => return,
        };
        let expected = self.spaces[space]
            .pending_acks
            .largest_observed()
            .map_or(0, |x| x + 1);
        let pn = number.expand(expected);

        if self.spaces[space].pending_acks.is_potentially_duplicate(pn) {
            trace!(pn, "discarding possible duplicate packet");
            return;
        }
        if !packet.reserved_bits_valid() {
            self.close_on_error(
                now,
                TransportError::PROTOCOL_VIOLATION("reserved bits set"),
            );
            return;
        }

        // Remove packet protection
        let decrypted = {
            let keys = match self.spaces[space].crypto.as_ref() {
                Some(keys) => keys,
                None => return,
            };
            keys.packet
                .remote
                .decrypt(pn, &packet.header_data, &mut packet.payload)
        };
        if decrypted.is_err() {
            if self.is_stateless_reset(&packet) {
                debug!("stateless reset received");
                self.kill(ConnectionError::Reset);
            } else {
                trace!(pn, "failed to authenticate packet");
            }
            return;
        }

        if self.state.is_closed() {
            // Stray packets during the close period prompt one replay of the close
            self.close_pending = matches!(self.state, State::Closed { .. });
            return;
        }

        let ack_eliciting = self.process_payload(now, space, pn, packet.payload.freeze());
        self.spaces[space]
            .pending_acks
            .received_packet(pn, now, ack_eliciting);
        self.sent.received_packet(space);
        if space > self.highest_space {
            self.highest_space = space;
        }

        if self.side.is_server()
            && space == SpaceId::Handshake
            && self.spaces[SpaceId::Initial].crypto.is_some()
        {
            // A server stops sending and processing Initial packets when it receives
            // its first Handshake packet
            self.discard_space(SpaceId::Initial);
        }

        self.reset_idle_timeout(now);
        self.idle_deadline_extended_on_send = false;
        self.reset_keep_alive(now);
    }

    /// Returns whether the packet contained any ack-eliciting frame
    fn process_payload(&mut self, now: Instant, space: SpaceId, pn: u64, payload: Bytes) -> bool {
        let mut ack_eliciting = false;
        let iter = match frame::Iter::new(payload) {
            Ok(iter) => iter,
            Err(e) => {
                self.close_on_error(now, e);
                return false;
            }
        };
        for result in iter {
            let frame = match result {
                Ok(frame) => frame,
                Err(err) => {
                    self.close_on_error(now, err.into());
                    return ack_eliciting;
                }
            };
            trace!(?space, pn, "got frame {:?}", frame);
            ack_eliciting |= frame.is_ack_eliciting();
            if let Err(e) = self.handle_frame(now, space, frame) {
                self.close_on_error(now, e);
                return ack_eliciting;
            }
            if self.state.is_closed() {
                return ack_eliciting;
            }
        }
        ack_eliciting
    }

    fn handle_frame(
        &mut self,
        now: Instant,
        space: SpaceId,
        frame: Frame,
    ) -> Result<(), TransportError> {
        // Most frame types are restricted to the data space
        match frame {
            Frame::Padding
            | Frame::Ping
            | Frame::Ack(_)
            | Frame::Crypto(_)
            | Frame::Close(_) => {}
            _ if space == SpaceId::Data => {}
            _ => {
                let mut err =
                    TransportError::PROTOCOL_VIOLATION("frame type forbidden at this level");
                err.frame = Some(frame.ty());
                return Err(err);
            }
        }
        match frame {
            Frame::Padding | Frame::Ping => {}
            Frame::Ack(ack) => self.on_ack_received(now, space, ack)?,
            Frame::Crypto(crypto) => {
                self.spaces[space].crypto_stream.insert(
                    crypto.offset,
                    crypto.data,
                    self.config.crypto_buffer_size,
                )?;
                self.events.push_back(Event::HandshakeDataReady);
            }
            Frame::NewToken(new_token) => {
                if self.side.is_server() {
                    return Err(TransportError::PROTOCOL_VIOLATION("client sent NEW_TOKEN"));
                }
                match (&self.token_store, &self.server_name) {
                    (Some(store), Some(name)) => store.insert(name, new_token.token),
                    _ => self.events.push_back(Event::NewToken(new_token.token)),
                }
            }
            Frame::Stream(stream) => {
                let end = stream.offset + stream.data.len() as u64;
                let increment = self.streams.received_data(stream.id, end)?;
                self.flow.add_highest_received(increment)?;
                self.events.push_back(Event::Stream(StreamEvent::Data {
                    id: stream.id,
                    offset: stream.offset,
                    data: stream.data,
                    fin: stream.fin,
                }));
            }
            Frame::MaxData(limit) => {
                self.flow.update_send_window(limit.into_inner());
                self.events.push_back(Event::Stream(StreamEvent::Writable));
            }
            Frame::MaxStreamData { id, offset } => {
                self.streams.update_send_window(id, offset)?;
                self.events.push_back(Event::Stream(StreamEvent::Writable));
            }
            Frame::MaxStreams { dir, count } => {
                self.streams.update_max_streams(dir, count)?;
                self.events.push_back(Event::Stream(StreamEvent::Writable));
            }
            Frame::DataBlocked { offset } => {
                debug!(offset, "peer claims to be blocked at connection level");
            }
            Frame::StreamDataBlocked { id, offset } => {
                self.streams.validate_receive_stream(id)?;
                debug!(
                    offset,
                    "peer claims to be blocked at stream level on {id}"
                );
            }
            Frame::StreamsBlocked { dir, limit } => {
                debug!(
                    limit,
                    "peer claims to be blocked opening more than {limit} {dir} streams"
                );
            }
            Frame::NewConnectionId(new_cid) => {
                for seq in self.rem_cids.insert(new_cid)? {
                    self.spaces[SpaceId::Data].pending.retire_cids.push(seq);
                }
            }
            Frame::RetireConnectionId { sequence } => {
                let dest_cid = self.last_dst_cid;
                for issued in self.cids.retire(sequence, &dest_cid)? {
                    self.spaces[SpaceId::Data].pending.new_cids.push(issued);
                }
            }
            Frame::PathChallenge(token) => {
                self.path_response = Some(token);
            }
            Frame::PathResponse(token) => {
                // We never probe a new path, so any response is spurious
                debug!(token, "ignoring PATH_RESPONSE");
            }
            Frame::ResetStream(reset) => {
                let increment = self
                    .streams
                    .reset_received(reset.id, reset.final_offset.into_inner())?;
                self.flow.add_highest_received(increment)?;
                self.events.push_back(Event::Stream(StreamEvent::Reset {
                    id: reset.id,
                    error_code: reset.error_code,
                }));
            }
            Frame::StopSending(frame::StopSending { id, error_code }) => {
                self.streams.stop_sending_received(id)?;
                self.events
                    .push_back(Event::Stream(StreamEvent::Stopped { id, error_code }));
            }
            Frame::Datagram(datagram) => {
                let window = match self.config.datagram_receive_buffer_size {
                    None => {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "unexpected DATAGRAM frame",
                        ));
                    }
                    Some(x) => x,
                };
                if datagram.data.len() > window {
                    return Err(TransportError::PROTOCOL_VIOLATION("oversized datagram"));
                }
                self.datagrams.received(datagram.data);
                self.events.push_back(Event::DatagramReceived);
            }
            Frame::HandshakeDone => {
                if self.side.is_server() {
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "client sent HANDSHAKE_DONE",
                    ));
                }
                self.sent.set_handshake_confirmed();
                if self.spaces[SpaceId::Handshake].crypto.is_some() {
                    self.discard_space(SpaceId::Handshake);
                }
            }
            Frame::Close(close) => {
                let reason = match close {
                    Close::Connection(reason) => ConnectionError::ConnectionClosed(reason),
                    Close::Application(reason) => ConnectionError::ApplicationClosed(reason),
                };
                self.drain(now, reason);
            }
        }
        Ok(())
    }

    fn on_ack_received(
        &mut self,
        now: Instant,
        space: SpaceId,
        ack: frame::Ack,
    ) -> Result<(), TransportError> {
        let outcome = self.sent.on_ack_received(now, space, &ack)?;
        for packet in outcome.newly_acked {
            if let Some(largest_acked) = packet.largest_acked {
                // The peer has seen our ACK of its packets up to `largest_acked`;
                // stop reporting them
                self.spaces[space]
                    .pending_acks
                    .ignore_below(largest_acked + 1);
            }
            for meta in packet.stream_frames {
                self.streams.received_ack_of(meta);
            }
        }
        self.on_packets_lost(space, outcome.lost);
        Ok(())
    }

    /// Queue the contents of lost packets for retransmission
    fn on_packets_lost(&mut self, space: SpaceId, lost: Vec<SentPacket>) {
        for packet in lost {
            self.spaces[space].pending |= packet.retransmits;
            for meta in packet.stream_frames {
                let id = meta.id;
                self.streams.retransmit(meta);
                self.events
                    .push_back(Event::Stream(StreamEvent::DataLost { id }));
            }
        }
    }

    fn handle_retry(&mut self, now: Instant, src_cid: ConnectionId, payload: Bytes) {
        if self.side.is_server()
            || !matches!(self.state, State::Handshake)
            || self.retry_src_cid.is_some()
            || payload.len() <= RESET_TOKEN_SIZE
        {
            trace!("discarding unexpected Retry packet");
            return;
        }
        // The token is everything up to the 16 byte integrity tag, whose verification
        // belongs to the crypto layer
        self.retry_token = payload.slice(..payload.len() - RESET_TOKEN_SIZE);
        self.retry_src_cid = Some(src_cid);
        self.rem_cids = RemoteCids::new(src_cid, self.rem_cids.limit);
        let dropped = self.sent.reset_for_retry(now);
        for packet in dropped {
            self.spaces[SpaceId::Initial].pending |= packet.retransmits;
            for meta in packet.stream_frames {
                self.streams.retransmit(meta);
            }
        }
        // Initial protection is keyed by the destination CID, which just changed
        self.spaces[SpaceId::Initial].crypto = None;
        self.events.push_back(Event::Retry);
    }

    fn is_stateless_reset(&self, packet: &Packet) -> bool {
        if !packet.header.is_short() {
            return false;
        }
        let whole = packet.header_data.len() + packet.payload.len();
        if whole < RESET_TOKEN_SIZE + 1 {
            return false;
        }
        let tail: &[u8] = &packet.payload[packet.payload.len() - RESET_TOKEN_SIZE..];
        let candidate = ResetToken::from(<[u8; RESET_TOKEN_SIZE]>::try_from(tail).unwrap());
        self.peer_params_reset_token
            .as_ref()
            .into_iter()
            .chain(self.rem_cids.reset_tokens())
            .any(|token| *token == candidate)
    }

    //
    // Timers
    //

    /// The earliest instant at which [`handle_timeout`](Self::handle_timeout) must run
    pub fn poll_timeout(&mut self, now: Instant) -> Option<Instant> {
        match self.sent.get_loss_detection_timeout(now) {
            Some(deadline) => self.timers.set(Timer::LossDetection, deadline),
            None => self.timers.stop(Timer::LossDetection),
        }
        let ack_alarm = SpaceId::iter()
            .filter_map(|space| self.spaces[space].pending_acks.alarm())
            .min();
        match ack_alarm {
            Some(deadline) => self.timers.set(Timer::MaxAckDelay, deadline),
            None => self.timers.stop(Timer::MaxAckDelay),
        }
        self.timers.next_timeout()
    }

    /// Process timer expirations
    pub fn handle_timeout(&mut self, now: Instant) {
        // Refresh the computed timers before checking them
        let _ = self.poll_timeout(now);
        while let Some(timer) = self.timers.expire_before(now) {
            match timer {
                Timer::LossDetection => {
                    // Either packets crossed the time threshold, or probes are now
                    // owed; `send_mode` picks the latter up
                    if let Some((space, lost)) = self.sent.on_loss_detection_timeout(now) {
                        self.on_packets_lost(space, lost);
                    }
                }
                Timer::Idle => {
                    self.kill(ConnectionError::TimedOut);
                }
                Timer::KeepAlive => {
                    trace!("sending keep-alive");
                    self.spaces[SpaceId::Data].ping_pending = true;
                }
                Timer::Close => {
                    self.state = State::Drained;
                    self.cids.remove_all();
                    self.endpoint_events.push_back(EndpointEvent::Drained);
                }
                Timer::KeyDiscard => {}
                Timer::Pacing => {}
                Timer::MaxAckDelay => {
                    // Nothing to do but transmit the overdue ACK, which
                    // `poll_transmit` now will
                }
            }
        }
    }

    fn reset_idle_timeout(&mut self, now: Instant) {
        let timeout = match self.idle_timeout() {
            Some(x) => x,
            None => {
                self.timers.stop(Timer::Idle);
                return;
            }
        };
        self.timers.set(Timer::Idle, now + timeout);
    }

    fn idle_timeout(&self) -> Option<Duration> {
        if !self.state.is_established() {
            return Some(DEFAULT_HANDSHAKE_TIMEOUT.max(2 * self.config.handshake_idle_timeout));
        }
        let local = self
            .config
            .max_idle_timeout
            .map(|x| Duration::from_millis(x.into_inner()));
        let peer = match self.peer_params.max_idle_timeout.into_inner() {
            0 => None,
            x => Some(Duration::from_millis(x)),
        };
        match (local, peer) {
            (None, None) => None,
            (Some(x), None) | (None, Some(x)) => Some(x),
            (Some(x), Some(y)) => Some(x.min(y)),
        }
    }

    fn reset_keep_alive(&mut self, now: Instant) {
        let interval = match self.config.keep_alive_interval {
            Some(x) if self.state.is_established() => x,
            _ => return,
        };
        self.timers.set(Timer::KeepAlive, now + interval);
    }

    //
    // Packing outbound datagrams
    //

    /// Produce the next outgoing datagram, if anything needs to be sent
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        if matches!(self.state, State::Draining { .. } | State::Drained) {
            return None;
        }
        if let State::Closed { .. } = self.state {
            if !mem::take(&mut self.close_pending) {
                return None;
            }
            let contents = self.close_packet.clone()?;
            return Some(Transmit {
                destination: self.remote,
                contents,
            });
        }

        let mode = self.sent.send_mode();
        let space = match mode {
            SendMode::None => return None,
            SendMode::Pto(space) => {
                // Fill the probe with something useful if we can
                if let Some(retransmits) = self.sent.retransmits_for_probe(space) {
                    self.spaces[space].pending |= retransmits;
                }
                if !self.spaces[space].can_send_other_than_acks() {
                    self.spaces[space].ping_pending = true;
                }
                space
            }
            SendMode::Ack | SendMode::Any => {
                let found = SpaceId::iter()
                    .filter(|&space| self.spaces[space].crypto.is_some())
                    .find(|&space| match mode {
                        SendMode::Ack => self.spaces[space].pending_acks.ack_required(now),
                        _ => {
                            self.spaces[space].pending_acks.ack_required(now)
                                || self.spaces[space].can_send_other_than_acks()
                                || (space == SpaceId::Data && self.can_send_1rtt())
                        }
                    });
                match found {
                    Some(space) => space,
                    None => {
                        // Congestion feedback must know we ran out of things to say
                        self.sent.set_app_limited(true);
                        return None;
                    }
                }
            }
        };
        self.sent.set_app_limited(false);
        if self.spaces[space].crypto.is_none() {
            return None;
        }

        // Pacing applies to ack-eliciting 1-RTT traffic
        if mode == SendMode::Any && space == SpaceId::Data {
            if let Some(deadline) = self.pacer.delay(
                self.sent.rtt().get(),
                self.config.initial_mtu,
                self.sent.congestion_window(),
                now,
            ) {
                self.timers.set(Timer::Pacing, deadline);
                return None;
            }
        }

        let ack_only = mode == SendMode::Ack;
        let contents = self.build_packet(now, space, ack_only)?;
        Some(Transmit {
            destination: self.remote,
            contents,
        })
    }

    /// Assemble and protect one packet in `space`, recording it with loss recovery
    fn build_packet(&mut self, now: Instant, space: SpaceId, ack_only: bool) -> Option<Vec<u8>> {
        let mtu = self.config.initial_mtu as usize;
        let pn = self.sent.pop_packet_number(space);
        let largest_acked = self.sent.largest_acked(space).unwrap_or(0);
        let number = PacketNumber::new(pn, largest_acked);
        let dst_cid = self.rem_cids.active;
        let header = match space {
            SpaceId::Initial => Header::Initial(InitialHeader {
                dst_cid,
                src_cid: self.local_cid(),
                token: self.retry_token.clone(),
                number,
                version: self.version,
            }),
            SpaceId::Handshake => Header::Long {
                ty: LongType::Handshake,
                dst_cid,
                src_cid: self.local_cid(),
                number,
                version: self.version,
            },
            SpaceId::Data => Header::Short {
                spin: false,
                key_phase: false,
                dst_cid,
                number,
            },
        };

        let mut buf = Vec::with_capacity(mtu);
        let partial_encode = header.encode(&mut buf);
        let header_len = buf.len();
        let tag_len = self.spaces[space].crypto.as_ref()?.packet.local.tag_len();
        let max_payload = mtu.checked_sub(tag_len)?;

        let (sent, ack_largest) = self.populate_packet(now, space, &mut buf, max_payload, ack_only);

        if buf.len() == header_len {
            // Nothing useful fit; don't waste a packet number on emptiness
            return None;
        }

        // Clients must fill Initial datagrams, and header protection needs its sample
        let min_len = if space == SpaceId::Initial && self.side.is_client() {
            MIN_INITIAL_SIZE - tag_len
        } else {
            header_len + 4
        };
        while buf.len() < min_len {
            buf.push(0); // PADDING
        }

        buf.resize(buf.len() + tag_len, 0);
        let keys = self.spaces[space].crypto.as_ref()?;
        partial_encode.finish(
            &mut buf,
            &*keys.header.local,
            Some((pn, &*keys.packet.local)),
        );

        let size = buf.len() as u16;
        let ack_eliciting = sent.ack_eliciting;
        self.sent.on_packet_sent(
            now,
            space,
            SentPacket {
                packet_number: pn,
                time_sent: now,
                size,
                ack_eliciting,
                in_flight: ack_eliciting,
                is_0rtt: false,
                largest_acked: ack_largest,
                retransmits: sent.retransmits,
                stream_frames: sent.stream_frames,
            },
        );
        self.pacer.update_capacity(self.sent.congestion_window());
        self.pacer.on_transmit(size);

        // The first ack-eliciting send per idle period also refreshes the idle timer
        if ack_eliciting && !self.idle_deadline_extended_on_send {
            self.reset_idle_timeout(now);
            self.idle_deadline_extended_on_send = true;
        }
        Some(buf)
    }

    /// Write frames into `buf`, in priority order, up to `max_len` total bytes
    fn populate_packet(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        buf: &mut Vec<u8>,
        max_len: usize,
        ack_only: bool,
    ) -> (PreparedFrames, Option<u64>) {
        let mut sent = PreparedFrames::default();
        let mut ack_largest = None;

        // ACK
        if self.spaces[space_id].pending_acks.can_send_ack()
            && (ack_only || self.spaces[space_id].pending_acks.ack_required(now))
        {
            if let Some((ranges, delay)) = self.spaces[space_id].pending_acks.take_ack(now) {
                let delay_micros = delay.as_micros() as u64 >> ACK_DELAY_EXPONENT;
                frame::Ack::encode(delay_micros, &ranges, None, buf);
                ack_largest = ranges.max();
            }
        }
        if ack_only {
            return (sent, ack_largest);
        }

        let space = &mut self.spaces[space_id];

        // PING
        if mem::take(&mut space.ping_pending) {
            trace!("PING");
            buf.write_var(0x01);
            sent.ack_eliciting = true;
        }

        // CRYPTO
        while buf.len() + frame::Crypto::SIZE_BOUND < max_len {
            let mut frame = match space.pending.crypto.pop_front() {
                Some(x) => x,
                None => break,
            };
            let remaining = max_len - buf.len() - frame::Crypto::SIZE_BOUND;
            if frame.data.len() > remaining {
                let rest = frame.data.split_off(remaining);
                space.pending.crypto.push_front(frame::Crypto {
                    offset: frame.offset + remaining as u64,
                    data: rest,
                });
            }
            trace!(offset = frame.offset, len = frame.data.len(), "CRYPTO");
            frame.encode(buf);
            sent.retransmits.get_or_create().crypto.push_back(frame);
            sent.ack_eliciting = true;
        }

        if space_id == SpaceId::Data {
            self.populate_data_space_frames(now, buf, max_len, &mut sent);
        }

        (sent, ack_largest)
    }

    fn populate_data_space_frames(
        &mut self,
        now: Instant,
        buf: &mut Vec<u8>,
        max_len: usize,
        sent: &mut PreparedFrames,
    ) {
        let space = &mut self.spaces[SpaceId::Data];

        // HANDSHAKE_DONE
        if mem::take(&mut space.pending.handshake_done) && buf.len() + 1 < max_len {
            trace!("HANDSHAKE_DONE");
            buf.write_var(0x1e);
            sent.retransmits.get_or_create().handshake_done = true;
            sent.ack_eliciting = true;
        }

        // PATH_RESPONSE
        if let Some(token) = self.path_response.take() {
            if buf.len() + 9 < max_len {
                trace!("PATH_RESPONSE");
                buf.write_var(0x1b);
                buf.extend_from_slice(&token.to_be_bytes());
                sent.ack_eliciting = true;
            } else {
                self.path_response = Some(token);
            }
        }

        // NEW_CONNECTION_ID
        while buf.len() + frame::NewConnectionId::SIZE_BOUND < max_len {
            let issued = match space.pending.new_cids.pop() {
                Some(x) => x,
                None => break,
            };
            trace!(sequence = issued.sequence, "NEW_CONNECTION_ID");
            frame::NewConnectionId::from(issued).encode(buf);
            sent.retransmits.get_or_create().new_cids.push(issued);
            sent.ack_eliciting = true;
        }

        // RETIRE_CONNECTION_ID
        while buf.len() + 9 < max_len {
            let seq = match space.pending.retire_cids.pop() {
                Some(x) => x,
                None => break,
            };
            trace!(sequence = seq, "RETIRE_CONNECTION_ID");
            buf.write_var(0x19);
            buf.write_var(seq);
            sent.retransmits.get_or_create().retire_cids.push(seq);
            sent.ack_eliciting = true;
        }

        // NEW_TOKEN
        while let Some(token) = space.pending.new_tokens.pop() {
            let frame = frame::NewToken { token };
            if buf.len() + frame.size() >= max_len {
                space.pending.new_tokens.push(frame.token);
                break;
            }
            trace!("NEW_TOKEN");
            frame.encode(buf);
            sent.retransmits
                .get_or_create()
                .new_tokens
                .push(frame.token);
            sent.ack_eliciting = true;
        }

        // RESET_STREAM / STOP_SENDING
        while buf.len() + frame::ResetStream::SIZE_BOUND < max_len {
            let (id, error_code) = match space.pending.reset_stream.pop() {
                Some(x) => x,
                None => break,
            };
            trace!(%id, "RESET_STREAM");
            let final_offset = self
                .streams
                .send_stream_mut(id)
                .map_or(VarInt(0), |s| VarInt(s.flow.bytes_sent()));
            frame::ResetStream {
                id,
                error_code,
                final_offset,
            }
            .encode(buf);
            sent.retransmits
                .get_or_create()
                .reset_stream
                .push((id, error_code));
            sent.ack_eliciting = true;
        }
        while buf.len() + frame::StopSending::SIZE_BOUND < max_len {
            let frame = match space.pending.stop_sending.pop() {
                Some(x) => x,
                None => break,
            };
            trace!(id = %frame.id, "STOP_SENDING");
            frame.encode(buf);
            sent.retransmits.get_or_create().stop_sending.push(frame);
            sent.ack_eliciting = true;
        }

        // MAX_DATA
        let wants_max_data = mem::take(&mut space.pending.max_data) || self.flow.has_window_update();
        if wants_max_data && buf.len() + 9 < max_len {
            if let Some(offset) = self.flow.get_window_update(now, self.sent.rtt()) {
                trace!(offset, "MAX_DATA");
                buf.write_var(0x10);
                buf.write_var(offset);
                sent.retransmits.get_or_create().max_data = true;
                sent.ack_eliciting = true;
            }
        }

        // MAX_STREAM_DATA
        let mut pending_stream_updates = mem::take(&mut space.pending.max_stream_data);
        for id in self.streams.streams_with_pending_updates() {
            pending_stream_updates.insert(id);
        }
        for id in pending_stream_updates {
            if buf.len() + 17 >= max_len {
                self.spaces[SpaceId::Data]
                    .pending
                    .max_stream_data
                    .insert(id);
                continue;
            }
            if let Some((offset, window_size)) = self.streams.window_update(id, now, self.sent.rtt())
            {
                trace!(%id, offset, "MAX_STREAM_DATA");
                buf.write_var(0x11);
                buf.write_var(id.0);
                buf.write_var(offset);
                sent.retransmits.get_or_create().max_stream_data.insert(id);
                sent.ack_eliciting = true;
                // The connection window must never be narrower than the widest stream
                self.flow.ensure_minimum_window_size(window_size, now);
            }
        }

        // MAX_STREAMS
        for dir in Dir::iter() {
            let pending = mem::take(
                &mut self.spaces[SpaceId::Data].pending.max_stream_id[dir as usize],
            );
            let update = self.streams.take_max_streams_update(dir);
            if (pending || update.is_some()) && buf.len() + 9 < max_len {
                if let Some(count) = update {
                    trace!(count, "MAX_STREAMS ({dir})");
                    buf.write_var(match dir {
                        Dir::Bi => 0x12,
                        Dir::Uni => 0x13,
                    });
                    buf.write_var(count);
                    sent.retransmits.get_or_create().max_stream_id[dir as usize] = true;
                    sent.ack_eliciting = true;
                }
            }
        }

        // DATA_BLOCKED / STREAMS_BLOCKED
        if buf.len() + 9 < max_len {
            if let Some(offset) = self.flow.take_newly_blocked() {
                trace!(offset, "DATA_BLOCKED");
                buf.write_var(0x14);
                buf.write_var(offset);
                sent.ack_eliciting = true;
            }
        }
        for dir in Dir::iter() {
            if buf.len() + 9 < max_len {
                if let Some(limit) = self.streams.take_streams_blocked(dir) {
                    trace!(limit, "STREAMS_BLOCKED ({dir})");
                    buf.write_var(match dir {
                        Dir::Bi => 0x16,
                        Dir::Uni => 0x17,
                    });
                    buf.write_var(limit);
                    sent.ack_eliciting = true;
                }
            }
        }

        // DATAGRAM
        while buf.len() + frame::Datagram::SIZE_BOUND < max_len {
            match self.datagrams.get(max_len - buf.len(), true) {
                Some(datagram) => {
                    trace!(len = datagram.data.len(), "DATAGRAM");
                    datagram.encode(true, buf);
                    sent.ack_eliciting = true;
                }
                None => break,
            }
        }

        // STREAM
        while buf.len() + frame::Stream::SIZE_BOUND < max_len {
            let (id, offset, mut data, fin) = match self.pending_stream_data.pop_front() {
                Some(x) => x,
                None => break,
            };
            // Respect stream and connection flow control for bytes not yet charged
            let stream = match self.streams.send_stream_mut(id) {
                Some(x) if !x.stopped => x,
                _ => continue,
            };
            let end = offset + data.len() as u64;
            let new_bytes = end.saturating_sub(stream.flow.bytes_sent());
            let credit = stream.flow.send_window_size().min(self.flow.send_window_size());
            let budget = (max_len - buf.len() - frame::Stream::SIZE_BOUND) as u64;
            let permitted = data.len() as u64 - new_bytes.saturating_sub(credit);
            let len = permitted.min(budget);
            if len == 0 {
                if let Some(blocked_at) = stream.flow.take_newly_blocked() {
                    if buf.len() + 17 < max_len {
                        trace!(%id, offset = blocked_at, "STREAM_DATA_BLOCKED");
                        buf.write_var(0x15);
                        buf.write_var(id.0);
                        buf.write_var(blocked_at);
                        sent.ack_eliciting = true;
                    }
                }
                self.pending_stream_data.push_front((id, offset, data, fin));
                break;
            }
            let chunk = data.split_to(len as usize);
            let chunk_end = offset + chunk.len() as u64;
            let fin_now = fin && data.is_empty();
            let charged = chunk_end.saturating_sub(stream.flow.bytes_sent());
            stream.flow.add_bytes_sent(charged);
            self.flow.add_bytes_sent(charged);
            let meta = frame::StreamMeta {
                id,
                offsets: offset..chunk_end,
                fin: fin_now,
            };
            trace!(%id, offset, len = chunk.len(), fin = fin_now, "STREAM");
            meta.encode(true, buf);
            buf.extend_from_slice(&chunk);
            sent.stream_frames.push(meta);
            sent.ack_eliciting = true;
            if !data.is_empty() {
                self.pending_stream_data.push_front((id, chunk_end, data, fin));
            }
        }
    }

    //
    // Driver-facing interface (TLS handshake)
    //

    /// Install packet protection keys for an encryption level
    pub fn set_keys(&mut self, space: SpaceId, keys: Keys) {
        self.spaces[space].crypto = Some(keys);
        if space > self.highest_space {
            self.highest_space = space;
        }
        if self.side.is_client() && space == SpaceId::Handshake {
            // A client discards Initial state as soon as it can send Handshake packets
            if self.spaces[SpaceId::Initial].crypto.is_some() {
                self.discard_space(SpaceId::Initial);
            }
        }
    }

    /// Queue handshake bytes for transmission at the given level
    pub fn write_crypto(&mut self, space: SpaceId, data: Bytes) {
        let offset = self.spaces[space].crypto_offset;
        self.spaces[space].crypto_offset += data.len() as u64;
        self.spaces[space]
            .pending
            .crypto
            .push_back(frame::Crypto { offset, data });
    }

    /// Read the next contiguous chunk of the peer's handshake bytes at the given level
    pub fn read_crypto(&mut self, space: SpaceId) -> Option<Bytes> {
        self.spaces[space].crypto_stream.read()
    }

    /// The transport parameters to advertise in the handshake
    pub fn local_transport_parameters(&self) -> TransportParameters {
        self.local_params
    }

    /// Apply the peer's transport parameters, as authenticated by the handshake
    pub fn handle_peer_params(&mut self, params: TransportParameters) -> Result<(), TransportError> {
        if self.side.is_client() && params.original_dst_cid.is_none() {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "original_destination_connection_id missing",
            ));
        }
        if self.side.is_client()
            && self.retry_src_cid.is_some()
            && params.retry_src_cid != self.retry_src_cid
        {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "retry_source_connection_id mismatch",
            ));
        }
        self.peer_params = params;
        self.peer_params_reset_token = params.stateless_reset_token;
        self.flow
            .update_send_window(params.initial_max_data.into_inner());
        self.streams.set_peer_params(
            params.initial_max_streams_bidi.into_inner(),
            params.initial_max_streams_uni.into_inner(),
            params.initial_max_stream_data_bidi_local.into_inner(),
            params.initial_max_stream_data_bidi_remote.into_inner(),
            params.initial_max_stream_data_uni.into_inner(),
        );
        self.sent.set_peer_params(
            Duration::from_millis(params.max_ack_delay.into_inner()),
            params.ack_delay_exponent.into_inner() as u32,
        );
        let issued = self
            .cids
            .set_max_active_cids(params.issue_cids_limit(self.local_cid_len));
        for cid in issued {
            self.spaces[SpaceId::Data].pending.new_cids.push(cid);
        }
        Ok(())
    }

    /// The handshake driver reports that the TLS handshake completed
    pub fn handshake_complete(&mut self, now: Instant) {
        if self.handshake_complete {
            return;
        }
        self.handshake_complete = true;
        self.state = State::Established;
        self.events.push_back(Event::Connected);
        self.reset_idle_timeout(now);
        self.reset_keep_alive(now);
        if self.side.is_server() {
            // The server confirms the handshake by completing it, tells the client
            // with HANDSHAKE_DONE, and has no further use for handshake keys
            self.sent.set_handshake_confirmed();
            self.spaces[SpaceId::Data].pending.handshake_done = true;
            if self.spaces[SpaceId::Handshake].crypto.is_some() {
                self.discard_space(SpaceId::Handshake);
            }
            self.cids.set_handshake_complete();
        }
    }

    /// Queue a NEW_TOKEN frame supplying the client with an address validation token
    /// for future connections (server only)
    pub fn queue_new_token(&mut self, token: Bytes) {
        debug_assert!(self.side.is_server());
        self.spaces[SpaceId::Data].pending.new_tokens.push(token);
    }

    /// The handshake driver rejected 0-RTT; all 0-RTT data must travel again at 1-RTT
    pub fn reject_0rtt(&mut self) {
        let dropped = self.sent.drop_0rtt();
        let space = SpaceId::Data;
        self.on_packets_lost(space, dropped);
    }

    //
    // Application-facing interface
    //

    /// Poll for application-relevant happenings
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Poll for instructions to the endpoint that owns the CID routing table
    pub fn poll_endpoint_events(&mut self) -> Option<EndpointEvent> {
        while let Some(event) = self.cids.poll_event() {
            self.endpoint_events.push_back(event);
        }
        self.endpoint_events.pop_front()
    }

    /// Open a new stream, if the peer's stream count limit allows
    pub fn open_stream(&mut self, dir: Dir) -> Option<StreamId> {
        if !self.state.is_established() {
            return None;
        }
        self.streams.open(dir)
    }

    /// Queue stream data for transmission
    ///
    /// The transport records only offsets; the caller retains the payload until it is
    /// acknowledged, and re-queues ranges reported by [`StreamEvent::DataLost`].
    pub fn queue_stream_data(&mut self, id: StreamId, offset: u64, data: Bytes, fin: bool) {
        self.pending_stream_data.push_back((id, offset, data, fin));
    }

    /// Offset ranges of `id` that were declared lost and await re-queueing
    pub fn stream_retransmit_ranges(&mut self, id: StreamId) -> Vec<std::ops::Range<u64>> {
        self.streams
            .send_stream_mut(id)
            .map(|s| {
                let ranges = s.pending_retransmits.iter().collect();
                while s.pending_retransmits.pop_min().is_some() {}
                ranges
            })
            .unwrap_or_default()
    }

    /// Abruptly terminate sending on a stream
    pub fn reset_stream(&mut self, id: StreamId, error_code: VarInt) {
        self.spaces[SpaceId::Data]
            .pending
            .reset_stream
            .push((id, error_code));
        self.pending_stream_data.retain(|(i, ..)| *i != id);
    }

    /// Ask the peer to stop sending on a stream
    pub fn stop_sending(&mut self, id: StreamId, error_code: VarInt) {
        self.spaces[SpaceId::Data]
            .pending
            .stop_sending
            .push(frame::StopSending { id, error_code });
    }

    /// The application consumed `n` bytes of stream data, freeing receive window
    pub fn stream_bytes_read(&mut self, id: StreamId, n: u64) {
        self.streams.add_bytes_read(id, n);
        self.flow.add_bytes_read(n);
    }

    /// Give up on receiving a stream, returning its flow control credit
    pub fn abandon_stream(&mut self, id: StreamId) {
        let credit = self.streams.abandon(id);
        self.flow.add_bytes_read(credit);
    }

    /// Queue an unreliable datagram
    pub fn send_datagram(&mut self, data: Bytes) -> Result<(), SendDatagramError> {
        if self.config.datagram_receive_buffer_size.is_none() {
            return Err(SendDatagramError::Disabled);
        }
        let max = self
            .max_datagram_size()
            .ok_or(SendDatagramError::UnsupportedByPeer)?;
        self.datagrams.send(data, max)
    }

    /// Receive an unreliable datagram, if one is buffered
    pub fn recv_datagram(&mut self) -> Result<Option<Bytes>, SendDatagramError> {
        self.datagrams.recv()
    }

    /// The largest datagram payload currently sendable, or `None` if the peer does not
    /// accept datagrams
    pub fn max_datagram_size(&self) -> Option<usize> {
        let limit = self.peer_params.max_datagram_frame_size?.into_inner();
        let overhead = 1 + 1 + self.rem_cids.active.len() + 4 + frame::Datagram::SIZE_BOUND;
        Some((limit as usize).saturating_sub(frame::Datagram::SIZE_BOUND)
            .min(self.config.initial_mtu as usize - overhead))
    }

    /// Close the connection with an application-level error
    pub fn close(&mut self, now: Instant, error_code: VarInt, reason: Bytes) {
        self.close_with(
            now,
            Close::Application(ApplicationClose { error_code, reason }),
            ConnectionError::LocallyClosed,
        );
    }

    /// The current best estimate of the connection's round-trip time
    pub fn rtt(&self) -> Duration {
        self.sent.rtt().get()
    }

    /// Bytes of ack-eliciting packets currently counted against the congestion window
    pub fn bytes_in_flight(&self) -> u64 {
        self.sent.bytes_in_flight()
    }

    /// Whether the connection has fully terminated and its state may be dropped
    pub fn is_drained(&self) -> bool {
        matches!(self.state, State::Drained)
    }

    /// The negotiated idle timeout, if any, once established
    pub fn side(&self) -> Side {
        self.side
    }

    //
    // Internals
    //

    fn local_cid(&self) -> ConnectionId {
        // Long headers always carry the handshake CID; replacements only matter for
        // short header routing, which the peer controls
        self.handshake_cid
    }

    fn can_send_1rtt(&self) -> bool {
        !self.pending_stream_data.is_empty()
            || self.datagrams.has_outgoing()
            || self.path_response.is_some()
            || self.flow.has_window_update()
    }

    fn discard_space(&mut self, space: SpaceId) {
        debug_assert!(space != SpaceId::Data);
        trace!(?space, "discarding space");
        self.spaces[space].crypto = None;
        self.spaces[space].pending = Retransmits::default();
        self.sent.discard_space(space);
    }

    /// Peer-triggered close: enter draining, never transmit again
    fn drain(&mut self, now: Instant, reason: ConnectionError) {
        if self.state.is_closed() {
            return;
        }
        trace!("draining: {reason}");
        self.set_close_timer(now);
        self.events.push_back(Event::ConnectionLost {
            reason: reason.clone(),
        });
        self.state = State::Draining { reason };
        self.datagrams.close(SendDatagramError::ConnectionClosed);
    }

    /// Locally-triggered close: transmit the close frame for the drain period
    fn close_with(&mut self, now: Instant, close: Close, reason: ConnectionError) {
        if self.state.is_closed() {
            return;
        }
        debug!("closing: {reason}");
        self.close_frame = Some(close);
        self.close_pending = true;
        self.close_packet = self.build_close_packet();
        if let Some(packet) = &self.close_packet {
            self.cids.replace_with_closed(packet.clone());
        }
        self.set_close_timer(now);
        if !matches!(reason, ConnectionError::LocallyClosed) {
            self.events.push_back(Event::ConnectionLost {
                reason: reason.clone(),
            });
        }
        self.state = State::Closed { reason };
        self.datagrams.close(SendDatagramError::ConnectionClosed);
    }

    fn close_on_error(&mut self, now: Instant, error: TransportError) {
        warn!("closing connection: {error}");
        self.close_with(
            now,
            Close::Connection(ConnectionClose::from(error.clone())),
            ConnectionError::TransportError(error),
        );
    }

    /// Terminate without sending anything
    fn kill(&mut self, reason: ConnectionError) {
        if matches!(self.state, State::Drained) {
            return;
        }
        self.events.push_back(Event::ConnectionLost {
            reason: reason.clone(),
        });
        self.state = State::Drained;
        self.cids.remove_all();
        self.endpoint_events.push_back(EndpointEvent::Drained);
        self.datagrams.close(SendDatagramError::ConnectionClosed);
    }

    fn set_close_timer(&mut self, now: Instant) {
        let pto = self.sent.rtt().pto_base() + crate::DEFAULT_MAX_ACK_DELAY;
        self.timers.set(Timer::Close, now + 3 * pto);
    }

    /// Assemble the datagram replayed in response to packets received while closed
    fn build_close_packet(&mut self) -> Option<Vec<u8>> {
        let close = self.close_frame.clone()?;
        let space = self.highest_space;
        if self.spaces[space].crypto.is_none() {
            return None;
        }
        let pn = self.sent.pop_packet_number(space);
        let number = PacketNumber::new(pn, self.sent.largest_acked(space).unwrap_or(0));
        let dst_cid = self.rem_cids.active;
        let header = match space {
            SpaceId::Initial => Header::Initial(InitialHeader {
                dst_cid,
                src_cid: self.local_cid(),
                token: self.retry_token.clone(),
                number,
                version: self.version,
            }),
            SpaceId::Handshake => Header::Long {
                ty: LongType::Handshake,
                dst_cid,
                src_cid: self.local_cid(),
                number,
                version: self.version,
            },
            SpaceId::Data => Header::Short {
                spin: false,
                key_phase: false,
                dst_cid,
                number,
            },
        };
        let mut buf = Vec::new();
        let partial_encode = header.encode(&mut buf);
        let header_len = buf.len();
        let tag_len = self.spaces[space].crypto.as_ref()?.packet.local.tag_len();
        let max_len = self.config.initial_mtu as usize - tag_len;
        let remaining = max_len - buf.len();
        close.encode(&mut buf, remaining);
        while buf.len() < header_len + 4 {
            buf.push(0);
        }
        buf.resize(buf.len() + tag_len, 0);
        let keys = self.spaces[space].crypto.as_ref()?;
        partial_encode.finish(
            &mut buf,
            &*keys.header.local,
            Some((pn, &*keys.packet.local)),
        );
        Some(buf)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("handshake_cid", &self.handshake_cid)
            .finish_non_exhaustive()
    }
}

/// Bookkeeping produced while filling one packet
#[derive(Default)]
struct PreparedFrames {
    ack_eliciting: bool,
    retransmits: ThinRetransmits,
    stream_frames: frame::StreamMetaVec,
}

/// The ack delay exponent this implementation advertises
const ACK_DELAY_EXPONENT: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoError, HeaderKey, KeyPair, PacketKey};

    /// Packet protection that protects nothing, standing in for the external AEAD
    struct NullHeaderKey;

    impl HeaderKey for NullHeaderKey {
        fn decrypt(&self, _: usize, _: &mut [u8]) {}
        fn encrypt(&self, _: usize, _: &mut [u8]) {}
        fn sample_size(&self) -> usize {
            0
        }
    }

    struct NullPacketKey;

    impl PacketKey for NullPacketKey {
        fn encrypt(&self, _: u64, _: &mut [u8], _: usize) {}
        fn decrypt(&self, _: u64, _: &[u8], _: &mut BytesMut) -> Result<(), CryptoError> {
            Ok(())
        }
        fn tag_len(&self) -> usize {
            0
        }
    }

    fn null_keys() -> Keys {
        Keys {
            header: KeyPair {
                local: Box::new(NullHeaderKey),
                remote: Box::new(NullHeaderKey),
            },
            packet: KeyPair {
                local: Box::new(NullPacketKey),
                remote: Box::new(NullPacketKey),
            },
        }
    }

    struct Pair {
        client: Connection,
        server: Connection,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
    }

    impl Pair {
        fn new(now: Instant) -> Self {
            let client_addr = "127.0.0.1:1111".parse().unwrap();
            let server_addr = "127.0.0.1:2222".parse().unwrap();
            let endpoint_config = EndpointConfig::default();
            let client_cid = ConnectionId::new(&[1; 8]);
            let server_cid = ConnectionId::new(&[2; 8]);
            let initial_dst = ConnectionId::new(&[3; 8]);

            let mut client = Connection::new_client(
                &ClientConfig::default(),
                &endpoint_config,
                client_cid,
                initial_dst,
                server_addr,
                None,
                now,
            );
            let mut server = Connection::new_server(
                &ServerConfig::default(),
                &endpoint_config,
                server_cid,
                initial_dst,
                client_cid,
                None,
                client_addr,
                crate::DEFAULT_SUPPORTED_VERSIONS[0],
                false,
                now,
            );
            client.set_keys(SpaceId::Initial, null_keys());
            server.set_keys(SpaceId::Initial, null_keys());
            Self {
                client,
                server,
                client_addr,
                server_addr,
            }
        }

        /// Deliver every datagram each side has pending to the other
        fn drive(&mut self, now: Instant) {
            loop {
                let mut progress = false;
                while let Some(transmit) = self.client.poll_transmit(now) {
                    assert_eq!(transmit.destination, self.server_addr);
                    progress = true;
                    self.server
                        .handle_datagram(now, self.client_addr, transmit.contents[..].into());
                }
                while let Some(transmit) = self.server.poll_transmit(now) {
                    assert_eq!(transmit.destination, self.client_addr);
                    progress = true;
                    self.client
                        .handle_datagram(now, self.server_addr, transmit.contents[..].into());
                }
                if !progress {
                    break;
                }
            }
        }

        /// Pretend both TLS handshakes finished and 1-RTT keys exist
        fn establish(&mut self, now: Instant) {
            let client_params = self.client.local_transport_parameters();
            let mut server_view = client_params;
            server_view.original_dst_cid = None;
            server_view.max_datagram_frame_size = Some(65535u32.into());
            self.server.handle_peer_params(server_view).unwrap();

            let mut client_view = self.server.local_transport_parameters();
            client_view.max_datagram_frame_size = Some(65535u32.into());
            self.client.handle_peer_params(client_view).unwrap();

            self.client.set_keys(SpaceId::Data, null_keys());
            self.server.set_keys(SpaceId::Data, null_keys());
            self.client.handshake_complete(now);
            self.server.handshake_complete(now);
            self.drive(now);
        }
    }

    fn drain_events(conn: &mut Connection) -> Vec<Event> {
        std::iter::from_fn(|| conn.poll()).collect()
    }

    #[test]
    fn initial_crypto_exchange_and_ack() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.client
            .write_crypto(SpaceId::Initial, Bytes::from_static(b"client hello"));

        let transmit = pair.client.poll_transmit(now).unwrap();
        // Client Initial datagrams are padded to defeat amplification attacks
        assert!(transmit.contents.len() >= MIN_INITIAL_SIZE);
        assert!(pair.client.bytes_in_flight() > 0);
        pair.server
            .handle_datagram(now, pair.client_addr, transmit.contents[..].into());

        let events = drain_events(&mut pair.server);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::HandshakeDataReady)));
        assert_eq!(
            pair.server.read_crypto(SpaceId::Initial).unwrap(),
            &b"client hello"[..]
        );

        // The server's flight acknowledges the client's Initial
        pair.server
            .write_crypto(SpaceId::Initial, Bytes::from_static(b"server hello"));
        let transmit = pair.server.poll_transmit(now).unwrap();
        pair.client
            .handle_datagram(now, pair.server_addr, transmit.contents[..].into());
        assert_eq!(pair.client.bytes_in_flight(), 0);
        assert_eq!(
            pair.client.read_crypto(SpaceId::Initial).unwrap(),
            &b"server hello"[..]
        );
    }

    #[test]
    fn datagram_roundtrip() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.establish(now);

        pair.client
            .send_datagram(Bytes::from_static(b"unreliable"))
            .unwrap();
        pair.drive(now);

        let events = drain_events(&mut pair.server);
        assert!(events.iter().any(|e| matches!(e, Event::DatagramReceived)));
        assert_eq!(
            pair.server.recv_datagram().unwrap().unwrap(),
            &b"unreliable"[..]
        );
    }

    #[test]
    fn stream_data_flows_and_is_flow_controlled() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.establish(now);
        drain_events(&mut pair.client);
        drain_events(&mut pair.server);

        let id = pair.client.open_stream(Dir::Uni).unwrap();
        pair.client
            .queue_stream_data(id, 0, Bytes::from_static(b"stream payload"), true);
        pair.drive(now);

        let events = drain_events(&mut pair.server);
        let mut found = false;
        for event in events {
            if let Event::Stream(StreamEvent::Data {
                id: got,
                offset,
                data,
                fin,
            }) = event
            {
                assert_eq!(got, id);
                assert_eq!(offset, 0);
                assert_eq!(&data[..], b"stream payload");
                assert!(fin);
                found = true;
            }
        }
        assert!(found, "server never saw the stream data");
    }

    #[test]
    fn peer_close_drains_the_connection() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.establish(now);
        drain_events(&mut pair.client);
        drain_events(&mut pair.server);

        pair.client
            .close(now, VarInt::from_u32(42), Bytes::from_static(b"bye"));
        pair.drive(now);

        let events = drain_events(&mut pair.server);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ConnectionLost {
                reason: ConnectionError::ApplicationClosed(close)
            } if close.error_code == VarInt::from_u32(42)
        )));
    }

    #[test]
    fn idle_timeout_times_the_connection_out() {
        let now = Instant::now();
        let endpoint_config = EndpointConfig::default();
        let mut server = Connection::new_server(
            &ServerConfig::default(),
            &endpoint_config,
            ConnectionId::new(&[2; 8]),
            ConnectionId::new(&[3; 8]),
            ConnectionId::new(&[1; 8]),
            None,
            "127.0.0.1:1111".parse().unwrap(),
            crate::DEFAULT_SUPPORTED_VERSIONS[0],
            true,
            now,
        );
        server.set_keys(SpaceId::Initial, null_keys());
        server.set_keys(SpaceId::Data, null_keys());
        server.handshake_complete(now);
        drain_events(&mut server);

        // Nothing is in flight, so the only deadline is the idle timeout
        let deadline = server.poll_timeout(now).unwrap();
        assert!(deadline > now + Duration::from_secs(1));
        server.handle_timeout(deadline);
        let events = drain_events(&mut server);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ConnectionLost {
                reason: ConnectionError::TimedOut
            }
        )));
        assert!(server.is_drained());
    }

    #[test]
    fn keep_alive_pings_before_idle_expiry() {
        let now = Instant::now();
        let server_addr: SocketAddr = "127.0.0.1:2222".parse().unwrap();
        let mut transport = TransportConfig::default();
        transport.keep_alive_interval(Some(Duration::from_millis(100)));
        let mut config = ClientConfig::default();
        config.transport = Arc::new(transport);
        let endpoint_config = EndpointConfig::default();
        let mut client = Connection::new_client(
            &config,
            &endpoint_config,
            ConnectionId::new(&[1; 8]),
            ConnectionId::new(&[3; 8]),
            server_addr,
            None,
            now,
        );
        client.set_keys(SpaceId::Initial, null_keys());
        client.set_keys(SpaceId::Data, null_keys());
        let mut params = TransportParameters::default();
        params.original_dst_cid = Some(ConnectionId::new(&[3; 8]));
        client.handle_peer_params(params).unwrap();
        client.handshake_complete(now);
        while client.poll_transmit(now).is_some() {}

        let wake = now + Duration::from_millis(100);
        client.handle_timeout(wake);
        let transmit = client.poll_transmit(wake).expect("keep-alive ping queued");
        assert!(!transmit.contents.is_empty());
        assert!(client.bytes_in_flight() > 0);
    }

    #[test]
    fn retire_of_current_cid_is_a_protocol_violation() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.establish(now);
        drain_events(&mut pair.server);

        // The client retires one of the server's CIDs via a packet addressed to that
        // same CID, which the server must reject
        let mut state = CidState::new(
            ConnectionId::new(&[7; 8]),
            None,
            Box::new(crate::RandomConnectionIdGenerator::new(8)),
            EndpointConfig::default().reset_key.clone(),
            false,
        );
        let issued = state.set_max_active_cids(4);
        let frame = &issued[0];
        let err = state.retire(frame.sequence, &frame.id).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::PROTOCOL_VIOLATION);
    }
}
