use std::time::Instant;

use rustc_hash::FxHashMap;

use super::flow_control::FlowController;
use super::rtt::RttEstimator;
use crate::frame::StreamMeta;
use crate::transport_error::TransportError;
use crate::{Dir, Side, StreamId, MAX_STREAM_COUNT};

/// Stream-level bookkeeping: stream-count windows in both directions and the per-stream
/// flow controllers
///
/// Stream payload buffering lives with the caller; this type owns the transport
/// contract: who may open which stream, how many, and how many bytes may flow on each.
pub(crate) struct StreamsState {
    side: Side,
    /// Number of streams of each direction the peer may open, cumulative
    max_remote: [u64; 2],
    /// Number of streams of each direction the peer has opened, cumulative
    remote_opened: [u64; 2],
    /// Whether an updated MAX_STREAMS should be transmitted
    max_remote_dirty: [bool; 2],

    /// Number of streams of each direction we may open, per the peer, cumulative
    max_local: [u64; 2],
    /// Next stream index to open locally
    next_local: [u64; 2],
    /// Count limit at which we last reported ourselves blocked
    blocked_reported_at: [Option<u64>; 2],

    send: FxHashMap<StreamId, SendStream>,
    recv: FxHashMap<StreamId, RecvStream>,

    /// Initial receive window for peer data on any one stream
    stream_receive_window: u64,
    /// Auto-tuning ceiling for per-stream receive windows
    max_stream_receive_window: u64,
    /// Initial send windows granted by the peer's transport parameters, by direction
    /// and initiator
    peer_initial_window_bidi_local: u64,
    peer_initial_window_bidi_remote: u64,
    peer_initial_window_uni: u64,
}

pub(crate) struct SendStream {
    pub(crate) flow: FlowController,
    /// Offset ranges that were declared lost and await retransmission by the data owner
    pub(crate) pending_retransmits: crate::range_set::RangeSet,
    pub(crate) stopped: bool,
}

pub(crate) struct RecvStream {
    pub(crate) flow: FlowController,
    pub(crate) closed: bool,
}

impl StreamsState {
    pub(crate) fn new(
        side: Side,
        max_remote_bidi: u64,
        max_remote_uni: u64,
        stream_receive_window: u64,
        max_stream_receive_window: u64,
    ) -> Self {
        Self {
            side,
            max_remote: [max_remote_bidi, max_remote_uni],
            remote_opened: [0, 0],
            max_remote_dirty: [false, false],
            max_local: [0, 0],
            next_local: [0, 0],
            blocked_reported_at: [None, None],
            send: FxHashMap::default(),
            recv: FxHashMap::default(),
            stream_receive_window,
            max_stream_receive_window,
            peer_initial_window_bidi_local: 0,
            peer_initial_window_bidi_remote: 0,
            peer_initial_window_uni: 0,
        }
    }

    /// Install limits from the peer's transport parameters
    pub(crate) fn set_peer_params(
        &mut self,
        max_streams_bidi: u64,
        max_streams_uni: u64,
        initial_max_stream_data_bidi_local: u64,
        initial_max_stream_data_bidi_remote: u64,
        initial_max_stream_data_uni: u64,
    ) {
        self.max_local = [max_streams_bidi, max_streams_uni];
        self.peer_initial_window_bidi_local = initial_max_stream_data_bidi_local;
        self.peer_initial_window_bidi_remote = initial_max_stream_data_bidi_remote;
        self.peer_initial_window_uni = initial_max_stream_data_uni;
    }

    /// Open a locally initiated stream, or fail against the peer's count limit
    pub(crate) fn open(&mut self, dir: Dir) -> Option<StreamId> {
        if self.next_local[dir as usize] >= self.max_local[dir as usize] {
            return None;
        }
        let index = self.next_local[dir as usize];
        self.next_local[dir as usize] += 1;
        let id = StreamId::new(self.side, dir, index);
        // The initiator's window for a bidirectional stream is what the peer's
        // `initial_max_stream_data_bidi_remote` grants its non-initiating side
        let window = match dir {
            Dir::Uni => self.peer_initial_window_uni,
            Dir::Bi => self.peer_initial_window_bidi_remote,
        };
        self.send.insert(
            id,
            SendStream {
                flow: FlowController::new(0, 0, window),
                pending_retransmits: Default::default(),
                stopped: false,
            },
        );
        if dir == Dir::Bi {
            self.recv.insert(
                id,
                RecvStream {
                    flow: FlowController::new(
                        self.stream_receive_window,
                        self.max_stream_receive_window,
                        0,
                    ),
                    closed: false,
                },
            );
        }
        Some(id)
    }

    /// Offset at which opening another stream became impossible, reported once per limit
    /// for STREAMS_BLOCKED
    pub(crate) fn take_streams_blocked(&mut self, dir: Dir) -> Option<u64> {
        let limit = self.max_local[dir as usize];
        if self.next_local[dir as usize] < limit
            || self.blocked_reported_at[dir as usize] == Some(limit)
        {
            return None;
        }
        self.blocked_reported_at[dir as usize] = Some(limit);
        Some(limit)
    }

    /// Look up or implicitly open the peer stream a frame refers to
    ///
    /// Frames for locally initiated streams must name one we actually opened; frames for
    /// peer streams open every lower-numbered stream of that direction implicitly.
    pub(crate) fn validate_receive_stream(&mut self, id: StreamId) -> Result<(), TransportError> {
        if id.initiator() == self.side {
            if id.dir() == Dir::Uni {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "received frame for a send-only stream",
                ));
            }
            if id.index() >= self.next_local[id.dir() as usize] {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "received frame for an unopened local stream",
                ));
            }
            return Ok(());
        }
        let dir = id.dir();
        if id.index() >= self.max_remote[dir as usize] {
            return Err(TransportError::STREAM_LIMIT_ERROR(""));
        }
        // Opening stream n implicitly opens all lower-numbered streams of the same kind
        while self.remote_opened[dir as usize] <= id.index() {
            let index = self.remote_opened[dir as usize];
            self.remote_opened[dir as usize] += 1;
            let new_id = StreamId::new(!self.side, dir, index);
            self.recv.insert(
                new_id,
                RecvStream {
                    flow: FlowController::new(
                        self.stream_receive_window,
                        self.max_stream_receive_window,
                        0,
                    ),
                    closed: false,
                },
            );
            if dir == Dir::Bi {
                self.send.insert(
                    new_id,
                    SendStream {
                        flow: FlowController::new(0, 0, self.peer_initial_window_bidi_local),
                        pending_retransmits: Default::default(),
                        stopped: false,
                    },
                );
            }
        }
        Ok(())
    }

    /// Account for stream data received up to `offset_end`
    ///
    /// Returns the increment to charge against the connection-level flow controller.
    pub(crate) fn received_data(
        &mut self,
        id: StreamId,
        offset_end: u64,
    ) -> Result<u64, TransportError> {
        self.validate_receive_stream(id)?;
        let stream = match self.recv.get_mut(&id) {
            Some(x) => x,
            None => return Ok(0), // already fully closed
        };
        stream.flow.record_highest_received(offset_end)
    }

    /// The application consumed `n` bytes from `id`
    pub(crate) fn add_bytes_read(&mut self, id: StreamId, n: u64) {
        if let Some(stream) = self.recv.get_mut(&id) {
            stream.flow.add_bytes_read(n);
        }
    }

    /// Produce a MAX_STREAM_DATA offset for `id` if one is due
    ///
    /// Returns the new limit and the stream's (possibly grown) window size, the latter
    /// so the caller can widen the connection-level window to match.
    pub(crate) fn window_update(
        &mut self,
        id: StreamId,
        now: Instant,
        rtt: &RttEstimator,
    ) -> Option<(u64, u64)> {
        let stream = self.recv.get_mut(&id)?;
        if stream.closed {
            return None;
        }
        let offset = stream.flow.get_window_update(now, rtt)?;
        Some((offset, stream.flow.receive_window_size()))
    }

    /// Apply a MAX_STREAM_DATA frame
    pub(crate) fn update_send_window(
        &mut self,
        id: StreamId,
        offset: u64,
    ) -> Result<(), TransportError> {
        if id.initiator() != self.side && id.dir() == Dir::Uni {
            return Err(TransportError::STREAM_STATE_ERROR(
                "MAX_STREAM_DATA for a receive-only stream",
            ));
        }
        if id.initiator() == self.side && id.index() >= self.next_local[id.dir() as usize] {
            return Err(TransportError::STREAM_STATE_ERROR(
                "MAX_STREAM_DATA for an unopened local stream",
            ));
        }
        if let Some(stream) = self.send.get_mut(&id) {
            stream.flow.update_send_window(offset);
        }
        Ok(())
    }

    /// Apply a MAX_STREAMS frame
    pub(crate) fn update_max_streams(&mut self, dir: Dir, count: u64) -> Result<(), TransportError> {
        if count > MAX_STREAM_COUNT {
            return Err(TransportError::FRAME_ENCODING_ERROR(
                "MAX_STREAMS limit out of bounds",
            ));
        }
        if count > self.max_local[dir as usize] {
            self.max_local[dir as usize] = count;
        }
        Ok(())
    }

    /// Handle RESET_STREAM: the stream's receive side terminates at `final_size`
    ///
    /// Returns the connection-level flow control increment.
    pub(crate) fn reset_received(
        &mut self,
        id: StreamId,
        final_size: u64,
    ) -> Result<u64, TransportError> {
        self.validate_receive_stream(id)?;
        let stream = match self.recv.get_mut(&id) {
            Some(x) => x,
            None => return Ok(0),
        };
        let increment = stream.flow.record_highest_received(final_size)?;
        stream.closed = true;
        self.stream_closed(id);
        Ok(increment)
    }

    /// Handle STOP_SENDING: mark the send side so the caller resets it
    pub(crate) fn stop_sending_received(&mut self, id: StreamId) -> Result<(), TransportError> {
        if id.initiator() != self.side && id.dir() == Dir::Uni {
            return Err(TransportError::STREAM_STATE_ERROR(
                "STOP_SENDING for a receive-only stream",
            ));
        }
        if let Some(stream) = self.send.get_mut(&id) {
            stream.stopped = true;
        }
        Ok(())
    }

    /// A remote-initiated stream finished its lifecycle; refill the peer's count window
    pub(crate) fn stream_closed(&mut self, id: StreamId) {
        if id.initiator() == self.side {
            return;
        }
        let dir = id.dir();
        self.max_remote[dir as usize] += 1;
        self.max_remote_dirty[dir as usize] = true;
    }

    /// MAX_STREAMS value to transmit, if the window moved
    pub(crate) fn take_max_streams_update(&mut self, dir: Dir) -> Option<u64> {
        if !self.max_remote_dirty[dir as usize] {
            return None;
        }
        self.max_remote_dirty[dir as usize] = false;
        Some(self.max_remote[dir as usize])
    }

    /// Credit tied up in an unconsumed receive stream, released on cancellation
    pub(crate) fn abandon(&mut self, id: StreamId) -> u64 {
        match self.recv.get_mut(&id) {
            Some(stream) if !stream.closed => {
                stream.closed = true;
                let credit = stream.flow.abandoned_credit();
                self.stream_closed(id);
                credit
            }
            _ => 0,
        }
    }

    /// Record that a sent stream frame was acknowledged
    pub(crate) fn received_ack_of(&mut self, meta: StreamMeta) {
        if let Some(stream) = self.send.get_mut(&meta.id) {
            stream.pending_retransmits.remove(meta.offsets);
        }
    }

    /// Record that a sent stream frame was lost; the data owner must resend the range
    pub(crate) fn retransmit(&mut self, meta: StreamMeta) {
        if let Some(stream) = self.send.get_mut(&meta.id) {
            if !stream.stopped {
                stream.pending_retransmits.insert(meta.offsets);
            }
        }
    }

    pub(crate) fn send_stream_mut(&mut self, id: StreamId) -> Option<&mut SendStream> {
        self.send.get_mut(&id)
    }

    /// Streams that currently owe the peer a window update
    pub(crate) fn streams_with_pending_updates(&self) -> Vec<StreamId> {
        self.recv
            .iter()
            .filter(|(_, s)| !s.closed && s.flow.has_window_update())
            .map(|(&id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StreamsState {
        let mut state = StreamsState::new(Side::Server, 4, 2, 1 << 20, 8 << 20);
        state.set_peer_params(3, 1, 1000, 2000, 3000);
        state
    }

    #[test]
    fn local_stream_limit_is_enforced() {
        let mut state = state();
        for i in 0..3 {
            let id = state.open(Dir::Bi).unwrap();
            assert_eq!(id.index(), i);
            assert_eq!(id.initiator(), Side::Server);
        }
        assert_eq!(state.open(Dir::Bi), None);
        assert_eq!(state.take_streams_blocked(Dir::Bi), Some(3));
        // Only reported once per limit
        assert_eq!(state.take_streams_blocked(Dir::Bi), None);

        state.update_max_streams(Dir::Bi, 4).unwrap();
        assert!(state.open(Dir::Bi).is_some());
    }

    #[test]
    fn peer_stream_limit_is_enforced() {
        let mut state = state();
        // Client-initiated bidi streams: indices 0..4 are allowed
        let ok = StreamId::new(Side::Client, Dir::Bi, 3);
        assert!(state.validate_receive_stream(ok).is_ok());
        let over = StreamId::new(Side::Client, Dir::Bi, 4);
        let err = state.validate_receive_stream(over).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_LIMIT_ERROR);
    }

    #[test]
    fn peer_streams_open_implicitly_in_order() {
        let mut state = state();
        let id = StreamId::new(Side::Client, Dir::Uni, 1);
        state.validate_receive_stream(id).unwrap();
        // Stream 0 was implicitly opened as well
        let lower = StreamId::new(Side::Client, Dir::Uni, 0);
        assert!(state.recv.contains_key(&lower));
        // Uni streams from the peer have no send half
        assert!(!state.send.contains_key(&id));
    }

    #[test]
    fn stream_flow_control_violation() {
        let mut state = StreamsState::new(Side::Server, 4, 2, 100, 100);
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        assert_eq!(state.received_data(id, 100).unwrap(), 100);
        let err = state.received_data(id, 101).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn closing_remote_streams_refills_the_count_window() {
        let mut state = state();
        let id = StreamId::new(Side::Client, Dir::Uni, 1);
        state.validate_receive_stream(id).unwrap();
        assert_eq!(state.take_max_streams_update(Dir::Uni), None);
        state.reset_received(id, 10).unwrap();
        assert_eq!(state.take_max_streams_update(Dir::Uni), Some(3));
        assert_eq!(state.take_max_streams_update(Dir::Uni), None);
    }

    #[test]
    fn frames_for_unopened_local_streams_are_rejected() {
        let mut state = state();
        let unopened = StreamId::new(Side::Server, Dir::Bi, 0);
        let err = state.received_data(unopened, 10).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_STATE_ERROR);
        let err = state.update_send_window(unopened, 10).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_STATE_ERROR);
    }

    #[test]
    fn max_stream_data_raises_the_send_window() {
        let mut state = state();
        let id = state.open(Dir::Uni).unwrap();
        assert_eq!(state.send_stream_mut(id).unwrap().flow.send_window_size(), 3000);
        state.update_send_window(id, 5000).unwrap();
        assert_eq!(state.send_stream_mut(id).unwrap().flow.send_window_size(), 5000);
    }

    #[test]
    fn lost_stream_frames_queue_retransmission() {
        let mut state = state();
        let id = state.open(Dir::Uni).unwrap();
        state.retransmit(StreamMeta {
            id,
            offsets: 0..100,
            fin: false,
        });
        let pending = &state.send_stream_mut(id).unwrap().pending_retransmits;
        assert_eq!(pending.min(), Some(0));
        assert_eq!(pending.max(), Some(99));

        state.received_ack_of(StreamMeta {
            id,
            offsets: 0..100,
            fin: false,
        });
        assert!(state
            .send_stream_mut(id)
            .unwrap()
            .pending_retransmits
            .is_empty());
    }

    #[test]
    fn abandon_releases_unread_credit() {
        let mut state = state();
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        state.received_data(id, 500).unwrap();
        state.add_bytes_read(id, 200);
        assert_eq!(state.abandon(id), 300);
        assert_eq!(state.abandon(id), 0);
    }
}
