use std::{
    cmp,
    collections::BTreeMap,
    time::{Duration, Instant},
};

use tracing::{error, trace};

use super::packet_number::PacketNumberGenerator;
use super::rtt::RttEstimator;
use super::spaces::{SentPacket, ThinRetransmits};
use crate::{
    config::TransportConfig, congestion, frame, packet::SpaceId, range_set::RangeSet,
    transport_error::TransportError, Side, TIMER_GRANULARITY,
};

/// Maximum number of sent packets tracked before new transmissions are throttled
///
/// Bounds memory under a peer that simply never acknowledges anything.
const MAX_OUTSTANDING_SENT_PACKETS: usize = 16 * 1024;

/// Upper bound on the PTO backoff exponent, keeping deadline arithmetic overflow-free
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Skip schedule for 1-RTT packet numbers; the period starts low so a misbehaving peer
/// is caught early in the connection, then backs off
const PN_SKIP_INITIAL_PERIOD: u64 = 256;
const PN_SKIP_MAX_PERIOD: u64 = 128 * 1024;

/// What the connection is currently allowed to transmit
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SendMode {
    /// Nothing may be sent: the peer's address is unvalidated and the amplification
    /// budget is exhausted
    None,
    /// Only packets containing nothing but acknowledgements may be sent
    Ack,
    /// Probe packets are owed at the given level
    Pto(SpaceId),
    /// Anything may be sent
    Any,
}

/// Result of processing one ACK frame
#[derive(Debug, Default)]
pub(crate) struct AckOutcome {
    /// Packets newly acknowledged, lowest first; each is delivered here exactly once
    pub(crate) newly_acked: Vec<SentPacket>,
    /// Packets declared lost, lowest first; each is delivered here exactly once
    pub(crate) lost: Vec<SentPacket>,
}

/// Per-space loss recovery state
struct SendSpace {
    pn: PacketNumberGenerator,
    /// Transmitted but not yet acknowledged or declared lost
    // We use a BTreeMap here so we can efficiently query by range on ACK and for loss detection
    sent_packets: BTreeMap<u64, SentPacket>,
    /// Deliberately unused packet numbers; acknowledging one is a protocol violation
    skipped: Vec<u64>,
    /// The largest packet number the remote peer acknowledged in an ACK frame
    largest_acked: Option<u64>,
    largest_acked_sent_time: Instant,
    /// The time at which the earliest sent packet in this space will be considered lost
    /// based on exceeding the reordering window in time. Only set for packets numbered
    /// prior to a packet that has been acknowledged.
    loss_time: Option<Instant>,
    /// The time the most recently sent ack-eliciting packet was sent
    time_of_last_ack_eliciting_packet: Option<Instant>,
    in_flight_bytes: u64,
    in_flight_ack_eliciting: u64,
}

impl SendSpace {
    fn new(now: Instant, skip_pns: bool) -> Self {
        Self {
            pn: match skip_pns {
                true => PacketNumberGenerator::skipping(
                    0,
                    PN_SKIP_INITIAL_PERIOD,
                    PN_SKIP_MAX_PERIOD,
                ),
                false => PacketNumberGenerator::sequential(0),
            },
            sent_packets: BTreeMap::new(),
            skipped: Vec::new(),
            largest_acked: None,
            largest_acked_sent_time: now,
            loss_time: None,
            time_of_last_ack_eliciting_packet: None,
            in_flight_bytes: 0,
            in_flight_ack_eliciting: 0,
        }
    }

    /// Remove a tracked packet, maintaining the in-flight counters
    fn take(&mut self, pn: u64) -> Option<SentPacket> {
        let packet = self.sent_packets.remove(&pn)?;
        if packet.in_flight {
            self.in_flight_bytes -= u64::from(packet.size);
            self.in_flight_ack_eliciting -= u64::from(packet.ack_eliciting);
        }
        Some(packet)
    }
}

/// Loss recovery, probe scheduling, and send gating for all packet number spaces
///
/// Owns the authoritative record of transmitted packets. Acknowledgement and loss are
/// reported back to the caller as [`AckOutcome`]s carrying the affected packets' frame
/// data; a packet is reported through at most one of the two lists, exactly once.
pub(crate) struct SentPacketHandler {
    spaces: [Option<SendSpace>; 3],
    side: Side,
    rtt: RttEstimator,
    congestion: Box<dyn congestion::Controller>,

    /// Number of ack-eliciting probe packets still owed, per space
    loss_probes: [u32; 3],
    /// The number of times a PTO has fired without intervening acknowledgement
    pto_count: u32,
    /// Highest space in which a packet was transmitted
    highest_space: SpaceId,
    handshake_confirmed: bool,
    /// Whether the peer has proven it can receive at this connection's remote address.
    /// Always true for clients.
    peer_address_validated: bool,
    /// Total UDP payload bytes transmitted, for the amplification limit
    total_bytes_sent: u64,
    /// Total UDP payload bytes received, for the amplification limit
    total_bytes_received: u64,

    /// The peer's maximum acknowledgement delay, from its transport parameters
    max_ack_delay: Duration,
    /// The peer's ack delay exponent, from its transport parameters
    ack_delay_exponent: u32,

    /// Number of the first packet sent after the first RTT sample was collected
    ///
    /// Used in persistent congestion determination.
    first_packet_after_rtt_sample: Option<(SpaceId, u64)>,
    /// Whether the connection was blocked on outgoing application data recently
    app_limited: bool,

    packet_threshold: u64,
    time_threshold: f32,
    persistent_congestion_threshold: u32,
}

impl SentPacketHandler {
    pub(crate) fn new(
        side: Side,
        config: &TransportConfig,
        congestion: Box<dyn congestion::Controller>,
        now: Instant,
    ) -> Self {
        Self {
            spaces: [
                Some(SendSpace::new(now, false)),
                Some(SendSpace::new(now, false)),
                Some(SendSpace::new(now, config.skip_packet_numbers)),
            ],
            side,
            rtt: RttEstimator::new(config.initial_rtt),
            congestion,
            loss_probes: [0; 3],
            pto_count: 0,
            highest_space: SpaceId::Initial,
            handshake_confirmed: false,
            peer_address_validated: side.is_client(),
            total_bytes_sent: 0,
            total_bytes_received: 0,
            max_ack_delay: crate::DEFAULT_MAX_ACK_DELAY,
            ack_delay_exponent: 3,
            first_packet_after_rtt_sample: None,
            app_limited: false,
            packet_threshold: config.packet_threshold as u64,
            time_threshold: config.time_threshold,
            persistent_congestion_threshold: config.persistent_congestion_threshold,
        }
    }

    fn space(&self, id: SpaceId) -> &SendSpace {
        self.spaces[id as usize]
            .as_ref()
            .expect("packet number space was dropped")
    }

    fn space_mut(&mut self, id: SpaceId) -> &mut SendSpace {
        self.spaces[id as usize]
            .as_mut()
            .expect("packet number space was dropped")
    }

    /// The number the next packet in `space` will be sent with
    pub(crate) fn peek_packet_number(&self, space: SpaceId) -> u64 {
        self.space(space).pn.peek()
    }

    /// Claim the next packet number in `space`
    pub(crate) fn pop_packet_number(&mut self, space: SpaceId) -> u64 {
        let s = self.space_mut(space);
        let pn = s.pn.pop();
        // The generator never leaves a gap wider than one number
        if s.pn.peek() == pn + 2 {
            s.skipped.push(pn + 1);
        }
        pn
    }

    /// Record a transmitted packet
    pub(crate) fn on_packet_sent(&mut self, now: Instant, space: SpaceId, packet: SentPacket) {
        self.total_bytes_sent += u64::from(packet.size);
        if space > self.highest_space {
            self.highest_space = space;
        }
        if packet.ack_eliciting && self.loss_probes[space as usize] > 0 {
            // Every ack-eliciting packet sent while probes are owed serves as a probe
            self.loss_probes[space as usize] -= 1;
        }
        let in_flight = packet.in_flight;
        let size = packet.size;
        let pn = packet.packet_number;
        let s = self.space_mut(space);
        if packet.ack_eliciting {
            s.time_of_last_ack_eliciting_packet = Some(now);
        }
        if in_flight {
            s.in_flight_bytes += u64::from(size);
            s.in_flight_ack_eliciting += u64::from(packet.ack_eliciting);
        }
        s.sent_packets.insert(pn, packet);
        if in_flight {
            self.congestion.on_sent(now, size.into(), pn);
        }
    }

    /// Account for payload bytes arriving from the peer, relaxing the amplification limit
    pub(crate) fn received_bytes(&mut self, n: u64) {
        self.total_bytes_received += n;
    }

    /// Note receipt of a packet at the given level
    ///
    /// Receiving a packet protected with handshake or 1-RTT keys proves the peer is at
    /// the address it claims.
    pub(crate) fn received_packet(&mut self, space: SpaceId) {
        if space != SpaceId::Initial {
            self.peer_address_validated = true;
        }
    }

    /// The peer has explicitly proven its address, e.g. with a valid retry token
    pub(crate) fn set_peer_validated(&mut self) {
        self.peer_address_validated = true;
    }

    pub(crate) fn set_handshake_confirmed(&mut self) {
        self.handshake_confirmed = true;
    }

    /// Install the peer's acknowledgement timing parameters
    pub(crate) fn set_peer_params(&mut self, max_ack_delay: Duration, ack_delay_exponent: u32) {
        self.max_ack_delay = max_ack_delay;
        self.ack_delay_exponent = ack_delay_exponent;
    }

    pub(crate) fn set_app_limited(&mut self, limited: bool) {
        self.app_limited = limited;
    }

    /// Process an ACK frame received at the given level
    pub(crate) fn on_ack_received(
        &mut self,
        now: Instant,
        space: SpaceId,
        ack: &frame::Ack,
    ) -> Result<AckOutcome, TransportError> {
        if ack.largest >= self.space(space).pn.peek() {
            return Err(TransportError::PROTOCOL_VIOLATION("unsent packet acked"));
        }
        for range in ack.iter() {
            if self
                .space(space)
                .skipped
                .iter()
                .any(|pn| range.contains(pn))
            {
                return Err(TransportError::PROTOCOL_VIOLATION(
                    "skipped packet number acked",
                ));
            }
        }

        let new_largest = {
            let s = self.space_mut(space);
            if s.largest_acked.map_or(true, |pn| ack.largest > pn) {
                s.largest_acked = Some(ack.largest);
                if let Some(info) = s.sent_packets.get(&ack.largest) {
                    // This should always succeed, but a misbehaving peer might ACK a packet we
                    // haven't sent. At worst, that will result in us spuriously reducing the
                    // congestion window.
                    s.largest_acked_sent_time = info.time_sent;
                }
                true
            } else {
                false
            }
        };

        // Avoid DoS from unreasonably huge ack ranges by filtering out just the new acks.
        let mut newly_acked = RangeSet::new();
        for range in ack.iter() {
            for (&pn, _) in self.space(space).sent_packets.range(range) {
                newly_acked.insert_one(pn);
            }
        }
        if newly_acked.is_empty() {
            return Ok(AckOutcome::default());
        }

        let mut acked = Vec::new();
        let mut ack_eliciting_acked = false;
        for pn in newly_acked.elts() {
            if let Some(info) = self.space_mut(space).take(pn) {
                ack_eliciting_acked |= info.ack_eliciting;
                if info.in_flight {
                    self.congestion.on_ack(
                        now,
                        info.time_sent,
                        info.size.into(),
                        self.app_limited,
                        &self.rtt,
                    );
                }
                acked.push(info);
            }
        }

        if new_largest && ack_eliciting_acked {
            let ack_delay = if space != SpaceId::Data {
                Duration::ZERO
            } else {
                cmp::min(
                    self.max_ack_delay,
                    Duration::from_micros(
                        ack.delay.saturating_mul(1 << self.ack_delay_exponent),
                    ),
                )
            };
            let rtt_sample =
                instant_saturating_sub(now, self.space(space).largest_acked_sent_time);
            self.rtt.update(ack_delay, rtt_sample);
            if self.first_packet_after_rtt_sample.is_none() {
                self.first_packet_after_rtt_sample = Some((space, self.space(space).pn.peek()));
            }
        }

        let lost = self.detect_lost_packets(now, space, true);

        if ack_eliciting_acked {
            // The probes did their job; any still owed would only add noise
            self.loss_probes[space as usize] = 0;
            if space == SpaceId::Data {
                self.pto_count = 0;
            }
        }

        // Old skipped numbers can no longer be covered by legitimate ACK state
        if let Some(largest_acked) = self.space(space).largest_acked {
            let lowest_tracked = self
                .space(space)
                .sent_packets
                .keys()
                .next()
                .copied()
                .unwrap_or(largest_acked.saturating_add(1));
            self.space_mut(space)
                .skipped
                .retain(|&pn| pn >= lowest_tracked.min(largest_acked));
        }

        Ok(AckOutcome {
            newly_acked: acked,
            lost,
        })
    }

    /// Identify and remove packets now considered lost in `space`
    fn detect_lost_packets(
        &mut self,
        now: Instant,
        space: SpaceId,
        due_to_ack: bool,
    ) -> Vec<SentPacket> {
        let largest_acked = match self.space(space).largest_acked {
            Some(x) => x,
            None => return Vec::new(),
        };
        let loss_delay = cmp::max(
            self.rtt.conservative().mul_f32(self.time_threshold),
            TIMER_GRANULARITY,
        );
        // Packets sent before this time are deemed lost.
        let lost_send_time = now.checked_sub(loss_delay);
        let packet_threshold = self.packet_threshold;
        let congestion_period = self.pto(SpaceId::Data) * self.persistent_congestion_threshold;
        let first_after_sample = self.first_packet_after_rtt_sample;

        let mut lost_pns = Vec::new();
        let mut size_of_lost_packets = 0u64;
        // InPersistentCongestion: Determine if all packets in the time period before the
        // newest lost packet, including the edges, are marked lost.
        let mut persistent_congestion_start: Option<Instant> = None;
        let mut in_persistent_congestion = false;
        let mut prev_packet = None;

        {
            let s = self.space_mut(space);
            s.loss_time = None;
            for (&pn, info) in s.sent_packets.range(0..largest_acked) {
                if prev_packet != Some(pn.wrapping_sub(1)) {
                    // An intervening packet was acknowledged
                    persistent_congestion_start = None;
                }

                let time_lost = lost_send_time.map_or(false, |t| info.time_sent <= t);
                if time_lost || largest_acked >= pn + packet_threshold {
                    lost_pns.push(pn);
                    if info.in_flight {
                        size_of_lost_packets += u64::from(info.size);
                    }
                    if info.ack_eliciting && due_to_ack {
                        match persistent_congestion_start {
                            // Two ACK-eliciting packets lost more than congestion_period
                            // apart, with no ACKed packets in between
                            Some(start) if info.time_sent - start > congestion_period => {
                                in_persistent_congestion = true;
                            }
                            // Persistent congestion must start after the first RTT sample
                            None if first_after_sample.is_some_and(|x| x < (space, pn)) => {
                                persistent_congestion_start = Some(info.time_sent);
                            }
                            _ => {}
                        }
                    }
                } else {
                    let next_loss_time = info.time_sent + loss_delay;
                    s.loss_time = Some(
                        s.loss_time
                            .map_or(next_loss_time, |x| cmp::min(x, next_loss_time)),
                    );
                    persistent_congestion_start = None;
                }

                prev_packet = Some(pn);
            }
        }

        let mut lost = Vec::with_capacity(lost_pns.len());
        if let Some(&largest_lost) = lost_pns.last() {
            let largest_lost_sent = self.space(space).sent_packets[&largest_lost].time_sent;
            let mut lost_in_flight = false;
            for pn in lost_pns {
                let info = self.space_mut(space).take(pn).unwrap(); // safe: lost_pns is populated just above
                lost_in_flight |= info.in_flight;
                lost.push(info);
            }
            trace!(
                lost = ?lost.iter().map(|p| p.packet_number).collect::<Vec<_>>(),
                bytes = size_of_lost_packets,
                "packets lost",
            );
            // Don't apply a congestion penalty for lost ack-only packets
            if lost_in_flight {
                self.congestion.on_congestion_event(
                    now,
                    largest_lost_sent,
                    in_persistent_congestion,
                    size_of_lost_packets,
                );
            }
        }
        lost
    }

    fn loss_time_and_space(&self) -> Option<(Instant, SpaceId)> {
        SpaceId::iter()
            .filter_map(|id| Some((self.spaces[id as usize].as_ref()?.loss_time?, id)))
            .min_by_key(|&(time, _)| time)
    }

    fn pto_time_and_space(&self, now: Instant) -> Option<(Instant, SpaceId)> {
        let backoff = 2u32.pow(self.pto_count.min(MAX_BACKOFF_EXPONENT));
        let mut duration = self.rtt.pto_base() * backoff;

        if self.ack_eliciting_in_flight() == 0 {
            // A PTO with nothing outstanding only makes sense to unblock a server
            // stuck behind its amplification limit
            if self.peer_completed_address_validation() {
                return None;
            }
            let space = match self.highest_space {
                SpaceId::Handshake => SpaceId::Handshake,
                _ => SpaceId::Initial,
            };
            return Some((now + duration, space));
        }

        let mut result = None;
        for space in SpaceId::iter() {
            let s = match self.spaces[space as usize].as_ref() {
                Some(s) => s,
                None => continue,
            };
            if s.in_flight_ack_eliciting == 0 {
                continue;
            }
            if space == SpaceId::Data {
                // Skip ApplicationData until the handshake is confirmed
                if !self.handshake_confirmed {
                    return result;
                }
                // Include max_ack_delay and backoff for ApplicationData.
                duration += self.max_ack_delay * backoff;
            }
            let last_ack_eliciting = match s.time_of_last_ack_eliciting_packet {
                Some(time) => time,
                None => continue,
            };
            let pto = last_ack_eliciting + duration;
            if result.map_or(true, |(earliest, _)| pto < earliest) {
                result = Some((pto, space));
            }
        }
        result
    }

    fn peer_completed_address_validation(&self) -> bool {
        if self.side.is_server() {
            return true;
        }
        // The server is guaranteed to have validated our address if any of our
        // handshake or 1-RTT packets are acknowledged or the handshake is confirmed.
        self.handshake_confirmed
            || self.spaces[SpaceId::Handshake as usize]
                .as_ref()
                .map_or(true, |s| s.largest_acked.is_some())
            || self.spaces[SpaceId::Data as usize]
                .as_ref()
                .map_or(false, |s| s.largest_acked.is_some())
    }

    /// When the loss detection timer should next fire
    pub(crate) fn get_loss_detection_timeout(&self, now: Instant) -> Option<Instant> {
        if let Some((loss_time, _)) = self.loss_time_and_space() {
            // Time threshold loss detection
            return Some(loss_time);
        }

        if self.is_amplification_limited() {
            // We wouldn't be able to send anything, so don't bother.
            return None;
        }

        if self.ack_eliciting_in_flight() == 0 && self.peer_completed_address_validation() {
            // There is nothing to detect lost, so no timer is set. However, the client
            // needs to arm the timer if the server might be blocked by the
            // anti-amplification limit.
            return None;
        }

        self.pto_time_and_space(now).map(|(time, _)| time)
    }

    /// React to the loss detection timer firing
    ///
    /// Returns packets declared lost by the time threshold, tagged with their space.
    /// When the timer was a PTO instead, probes are scheduled and nothing is returned.
    pub(crate) fn on_loss_detection_timeout(
        &mut self,
        now: Instant,
    ) -> Option<(SpaceId, Vec<SentPacket>)> {
        if let Some((_, space)) = self.loss_time_and_space() {
            // Time threshold loss detection
            return Some((space, self.detect_lost_packets(now, space, false)));
        }

        let (_, space) = match self.pto_time_and_space(now) {
            Some(x) => x,
            None => {
                error!("PTO expired while unset");
                return None;
            }
        };
        let count = match self.ack_eliciting_in_flight() {
            // A PTO when we're not expecting any ACKs must be due to handshake
            // anti-amplification deadlock prevention
            0 => 1,
            // Conventional loss probe
            _ => 2,
        };
        trace!(count, ?space, pto_count = self.pto_count, "PTO fired");
        self.loss_probes[space as usize] = count;
        self.pto_count = self.pto_count.saturating_add(1);
        None
    }

    /// What, if anything, may currently be transmitted
    pub(crate) fn send_mode(&self) -> SendMode {
        for space in SpaceId::iter() {
            if self.spaces[space as usize].is_some() && self.loss_probes[space as usize] > 0 {
                return SendMode::Pto(space);
            }
        }
        if self.is_amplification_limited() {
            return SendMode::None;
        }
        if self.bytes_in_flight() >= self.congestion.window() {
            return SendMode::Ack;
        }
        if self.tracked_packets() >= MAX_OUTSTANDING_SENT_PACKETS {
            return SendMode::Ack;
        }
        SendMode::Any
    }

    /// Whether an unvalidated peer has exhausted this server's amplification budget
    pub(crate) fn is_amplification_limited(&self) -> bool {
        self.side.is_server()
            && !self.peer_address_validated
            && self.total_bytes_sent >= 3 * self.total_bytes_received
    }

    /// Steal retransmittable data from the oldest outstanding packet to fill a probe
    ///
    /// Removing it from the old packet ensures the data isn't retransmitted twice if the
    /// original transmission is acknowledged after all. Returns `None` when the probe
    /// will have to be a bare PING.
    pub(crate) fn retransmits_for_probe(&mut self, space: SpaceId) -> Option<ThinRetransmits> {
        let s = self.space_mut(space);
        s.sent_packets
            .values_mut()
            .find(|packet| packet.ack_eliciting && !packet.retransmits.is_empty())
            .map(|packet| packet.retransmits.take())
    }

    /// Abandon the given handshake-time packet number space entirely
    ///
    /// The peer can no longer acknowledge these packets, so they are forgotten without
    /// being treated as lost.
    pub(crate) fn discard_space(&mut self, space: SpaceId) {
        debug_assert!(space != SpaceId::Data);
        self.spaces[space as usize] = None;
        self.loss_probes[space as usize] = 0;
        self.pto_count = 0;
    }

    /// Drop all packets protected with 0-RTT keys, returning them for retransmission
    /// under 1-RTT protection
    pub(crate) fn drop_0rtt(&mut self) -> Vec<SentPacket> {
        let s = self.space_mut(SpaceId::Data);
        let pns: Vec<u64> = s
            .sent_packets
            .iter()
            .filter(|&(_, p)| p.is_0rtt)
            .map(|(&pn, _)| pn)
            .collect();
        pns.into_iter()
            .filter_map(|pn| self.space_mut(SpaceId::Data).take(pn))
            .collect()
    }

    /// Forget all in-flight packets in response to a Retry packet, returning them for
    /// retransmission
    ///
    /// If no probe has fired yet, the Retry's round trip doubles as the first RTT sample.
    pub(crate) fn reset_for_retry(&mut self, now: Instant) -> Vec<SentPacket> {
        let first_initial_sent = self.spaces[SpaceId::Initial as usize]
            .as_ref()
            .and_then(|s| s.sent_packets.values().next().map(|p| p.time_sent));

        let mut dropped = Vec::new();
        for space in [SpaceId::Initial, SpaceId::Data] {
            if let Some(s) = self.spaces[space as usize].as_mut() {
                let pns: Vec<u64> = s.sent_packets.keys().copied().collect();
                for pn in pns {
                    dropped.extend(s.take(pn));
                }
            }
        }

        if self.pto_count == 0 {
            if let Some(sent) = first_initial_sent {
                self.rtt.update(Duration::ZERO, instant_saturating_sub(now, sent));
            }
        }

        self.pto_count = 0;
        self.loss_probes = [0; 3];
        for s in self.spaces.iter_mut().flatten() {
            s.loss_time = None;
            s.time_of_last_ack_eliciting_packet = None;
            s.largest_acked = None;
        }
        dropped
    }

    pub(crate) fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub(crate) fn congestion_window(&self) -> u64 {
        self.congestion.window()
    }

    /// Sum of the wire sizes of all in-flight packets
    pub(crate) fn bytes_in_flight(&self) -> u64 {
        self.spaces
            .iter()
            .flatten()
            .map(|s| s.in_flight_bytes)
            .sum()
    }

    fn ack_eliciting_in_flight(&self) -> u64 {
        self.spaces
            .iter()
            .flatten()
            .map(|s| s.in_flight_ack_eliciting)
            .sum()
    }

    fn tracked_packets(&self) -> usize {
        self.spaces
            .iter()
            .flatten()
            .map(|s| s.sent_packets.len())
            .sum()
    }

    /// Largest packet number the peer acknowledged in `space`
    pub(crate) fn largest_acked(&self, space: SpaceId) -> Option<u64> {
        self.spaces[space as usize].as_ref().and_then(|s| s.largest_acked)
    }

    /// Probe Timeout
    fn pto(&self, space: SpaceId) -> Duration {
        let max_ack_delay = match space {
            SpaceId::Initial | SpaceId::Handshake => Duration::ZERO,
            SpaceId::Data => self.max_ack_delay,
        };
        self.rtt.pto_base() + max_ack_delay
    }
}

pub(crate) fn instant_saturating_sub(x: Instant, y: Instant) -> Duration {
    if x > y {
        x - y
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::congestion::{ControllerFactory, NewRenoConfig};
    use bytes::Bytes;
    use std::ops::RangeInclusive;
    use std::sync::Arc;

    fn handler(side: Side) -> SentPacketHandler {
        let config = TransportConfig::default();
        let congestion = Arc::new(NewRenoConfig::default()).build(Instant::now(), 1200);
        SentPacketHandler::new(side, &config, congestion, Instant::now())
    }

    fn packet(pn: u64, now: Instant, size: u16) -> SentPacket {
        SentPacket {
            packet_number: pn,
            time_sent: now,
            size,
            ack_eliciting: true,
            in_flight: true,
            is_0rtt: false,
            largest_acked: None,
            retransmits: ThinRetransmits::default(),
            stream_frames: Default::default(),
        }
    }

    fn ack_frame(ranges: &[RangeInclusive<u64>]) -> frame::Ack {
        let mut set = RangeSet::new();
        for r in ranges {
            set.insert(*r.start()..r.end() + 1);
        }
        let mut buf = Vec::new();
        frame::Ack::encode(0, &set, None, &mut buf);
        match frame::Iter::new(Bytes::from(buf))
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
        {
            frame::Frame::Ack(ack) => ack,
            x => panic!("expected ACK, got {x:?}"),
        }
    }

    /// Pop numbers 0..n and send each as a 1-byte ack-eliciting packet
    fn send_sequential(handler: &mut SentPacketHandler, space: SpaceId, n: u64, now: Instant) {
        for _ in 0..n {
            let pn = handler.pop_packet_number(space);
            handler.on_packet_sent(now, space, packet(pn, now, 1));
        }
    }

    #[test]
    fn basic_ack() {
        let mut handler = handler(Side::Client);
        let now = Instant::now();
        send_sequential(&mut handler, SpaceId::Initial, 10, now);
        assert_eq!(handler.bytes_in_flight(), 10);

        let outcome = handler
            .on_ack_received(
                now + Duration::from_millis(10),
                SpaceId::Initial,
                &ack_frame(&[0..=5]),
            )
            .unwrap();
        assert_eq!(
            outcome
                .newly_acked
                .iter()
                .map(|p| p.packet_number)
                .collect::<Vec<_>>(),
            [0, 1, 2, 3, 4, 5]
        );
        assert!(outcome.lost.is_empty());
        assert_eq!(handler.bytes_in_flight(), 4);
        assert_eq!(handler.largest_acked(SpaceId::Initial), Some(5));
    }

    #[test]
    fn duplicate_acks_are_idempotent() {
        let mut handler = handler(Side::Client);
        let now = Instant::now();
        send_sequential(&mut handler, SpaceId::Initial, 3, now);
        let ack = ack_frame(&[0..=2]);
        let first = handler.on_ack_received(now, SpaceId::Initial, &ack).unwrap();
        assert_eq!(first.newly_acked.len(), 3);
        let second = handler.on_ack_received(now, SpaceId::Initial, &ack).unwrap();
        assert!(second.newly_acked.is_empty());
        assert!(second.lost.is_empty());
        assert_eq!(handler.bytes_in_flight(), 0);
    }

    #[test]
    fn packet_threshold_loss() {
        let mut handler = handler(Side::Client);
        let now = Instant::now();
        // Claim 0 but only transmit 1..=6
        let _ = handler.pop_packet_number(SpaceId::Initial);
        for _ in 1..=6 {
            let pn = handler.pop_packet_number(SpaceId::Initial);
            handler.on_packet_sent(now, SpaceId::Initial, packet(pn, now, 1));
        }

        let outcome = handler
            .on_ack_received(now, SpaceId::Initial, &ack_frame(&[6..=6]))
            .unwrap();
        assert_eq!(
            outcome.lost.iter().map(|p| p.packet_number).collect::<Vec<_>>(),
            [1, 2, 3]
        );
        // 4 and 5 remain outstanding
        assert_eq!(handler.bytes_in_flight(), 2);
    }

    #[test]
    fn time_threshold_loss() {
        let mut handler = handler(Side::Client);
        let now = Instant::now();
        let pn0 = handler.pop_packet_number(SpaceId::Initial);
        handler.on_packet_sent(now, SpaceId::Initial, packet(pn0, now, 1));
        let later = now + Duration::from_secs(1);
        let pn1 = handler.pop_packet_number(SpaceId::Initial);
        handler.on_packet_sent(later, SpaceId::Initial, packet(pn1, later, 1));

        // Acking packet 1 a long time after packet 0 was sent declares 0 lost by time
        let outcome = handler
            .on_ack_received(
                later + Duration::from_millis(10),
                SpaceId::Initial,
                &ack_frame(&[1..=1]),
            )
            .unwrap();
        assert_eq!(
            outcome.lost.iter().map(|p| p.packet_number).collect::<Vec<_>>(),
            [0]
        );
    }

    #[test]
    fn reordering_within_thresholds_arms_the_loss_timer() {
        let mut handler = handler(Side::Client);
        let now = Instant::now();
        send_sequential(&mut handler, SpaceId::Initial, 2, now);
        let shortly = now + Duration::from_millis(1);
        let outcome = handler
            .on_ack_received(shortly, SpaceId::Initial, &ack_frame(&[1..=1]))
            .unwrap();
        assert!(outcome.lost.is_empty());
        // Packet 0 is neither acked nor lost; a loss time is armed for it
        let timeout = handler.get_loss_detection_timeout(shortly).unwrap();
        assert!(timeout > shortly);
        // Once it fires, the packet is declared lost
        let (space, lost) = handler.on_loss_detection_timeout(timeout).unwrap();
        assert_eq!(space, SpaceId::Initial);
        assert_eq!(
            lost.iter().map(|p| p.packet_number).collect::<Vec<_>>(),
            [0]
        );
    }

    #[test]
    fn rejects_ack_of_unsent_packet() {
        let mut handler = handler(Side::Client);
        let now = Instant::now();
        send_sequential(&mut handler, SpaceId::Initial, 3, now);
        let err = handler
            .on_ack_received(now, SpaceId::Initial, &ack_frame(&[5..=5]))
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::PROTOCOL_VIOLATION);
    }

    #[test]
    fn rejects_ack_of_skipped_packet() {
        let mut handler = handler(Side::Client);
        let now = Instant::now();
        // 1-RTT numbers are skipped eventually; hunt for the first hole
        let mut skipped = None;
        let mut prev = handler.pop_packet_number(SpaceId::Data);
        handler.on_packet_sent(now, SpaceId::Data, packet(prev, now, 1));
        for _ in 0..10_000 {
            let pn = handler.pop_packet_number(SpaceId::Data);
            handler.on_packet_sent(now, SpaceId::Data, packet(pn, now, 1));
            if pn > prev + 1 {
                skipped = Some(pn - 1);
                break;
            }
            prev = pn;
        }
        let skipped = skipped.expect("no packet number was skipped");
        let err = handler
            .on_ack_received(now, SpaceId::Data, &ack_frame(&[skipped..=skipped]))
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::PROTOCOL_VIOLATION);
    }

    #[test]
    fn pto_backoff_and_probe_cascade() {
        let mut handler = handler(Side::Client);
        handler.set_handshake_confirmed();
        let mut now = Instant::now();

        // Collect an RTT sample of 1s
        let pn = handler.pop_packet_number(SpaceId::Data);
        handler.on_packet_sent(now, SpaceId::Data, packet(pn, now, 1));
        handler
            .on_ack_received(
                now + Duration::from_secs(1),
                SpaceId::Data,
                &ack_frame(&[pn..=pn]),
            )
            .unwrap();
        assert_eq!(handler.rtt().get(), Duration::from_secs(1));
        now += Duration::from_secs(1);

        // An old outstanding packet, an hour of silence, and the timer fires
        let pn = handler.pop_packet_number(SpaceId::Data);
        handler.on_packet_sent(now, SpaceId::Data, packet(pn, now, 1));
        let first_deadline = handler.get_loss_detection_timeout(now).unwrap();
        assert_eq!(first_deadline, now + handler.pto(SpaceId::Data));

        now += Duration::from_secs(3600);
        assert!(handler.on_loss_detection_timeout(now).is_none());
        assert_eq!(handler.send_mode(), SendMode::Pto(SpaceId::Data));

        // Two probes restore the regular send mode
        for _ in 0..2 {
            let pn = handler.pop_packet_number(SpaceId::Data);
            handler.on_packet_sent(now, SpaceId::Data, packet(pn, now, 1));
        }
        assert_eq!(handler.send_mode(), SendMode::Any);

        // The next deadline backs off exponentially
        let second_deadline = handler.get_loss_detection_timeout(now).unwrap();
        assert_eq!(second_deadline, now + handler.pto(SpaceId::Data) * 2);
        handler.on_loss_detection_timeout(second_deadline);
        let third_deadline = handler.get_loss_detection_timeout(second_deadline).unwrap();
        assert_eq!(third_deadline, now + handler.pto(SpaceId::Data) * 4);
    }

    #[test]
    fn initial_and_handshake_acks_do_not_reset_pto_count() {
        let mut handler = handler(Side::Client);
        let now = Instant::now();
        send_sequential(&mut handler, SpaceId::Initial, 2, now);
        let timeout = handler.get_loss_detection_timeout(now).unwrap();
        handler.on_loss_detection_timeout(timeout);
        assert_eq!(handler.pto_count, 1);

        handler
            .on_ack_received(timeout, SpaceId::Initial, &ack_frame(&[0..=1]))
            .unwrap();
        assert_eq!(handler.pto_count, 1);
    }

    #[test]
    fn data_space_acks_reset_pto_count() {
        let mut handler = handler(Side::Client);
        handler.set_handshake_confirmed();
        let now = Instant::now();
        send_sequential(&mut handler, SpaceId::Data, 2, now);
        let timeout = handler.get_loss_detection_timeout(now).unwrap();
        handler.on_loss_detection_timeout(timeout);
        assert_eq!(handler.pto_count, 1);

        handler
            .on_ack_received(timeout, SpaceId::Data, &ack_frame(&[0..=1]))
            .unwrap();
        assert_eq!(handler.pto_count, 0);
        assert_eq!(handler.send_mode(), SendMode::Any);
    }

    #[test]
    fn amplification_limit_is_three_times_received() {
        let mut handler = handler(Side::Server);
        let now = Instant::now();
        handler.received_bytes(300);
        assert_eq!(handler.send_mode(), SendMode::Any);

        let pn = handler.pop_packet_number(SpaceId::Initial);
        handler.on_packet_sent(now, SpaceId::Initial, packet(pn, now, 900));
        assert_eq!(handler.send_mode(), SendMode::None);
        assert!(handler.get_loss_detection_timeout(now).is_none());

        handler.received_bytes(100);
        assert_ne!(handler.send_mode(), SendMode::None);
    }

    #[test]
    fn receiving_a_handshake_packet_validates_the_client() {
        let mut handler = handler(Side::Server);
        let now = Instant::now();
        let pn = handler.pop_packet_number(SpaceId::Initial);
        handler.on_packet_sent(now, SpaceId::Initial, packet(pn, now, 1200));
        assert_eq!(handler.send_mode(), SendMode::None);

        handler.received_packet(SpaceId::Handshake);
        assert_ne!(handler.send_mode(), SendMode::None);
    }

    #[test]
    fn discarding_a_space_cancels_its_probes() {
        let mut handler = handler(Side::Client);
        let now = Instant::now();
        send_sequential(&mut handler, SpaceId::Initial, 1, now);
        let timeout = handler.get_loss_detection_timeout(now).unwrap();
        handler.on_loss_detection_timeout(timeout);
        assert_eq!(handler.send_mode(), SendMode::Pto(SpaceId::Initial));

        handler.discard_space(SpaceId::Initial);
        assert_eq!(handler.pto_count, 0);
        assert_ne!(handler.send_mode(), SendMode::Pto(SpaceId::Initial));
        assert_eq!(handler.bytes_in_flight(), 0);
    }

    #[test]
    fn dropping_0rtt_returns_packets_for_retransmission() {
        let mut handler = handler(Side::Client);
        let now = Instant::now();
        let pn = handler.pop_packet_number(SpaceId::Data);
        let mut zero_rtt = packet(pn, now, 100);
        zero_rtt.is_0rtt = true;
        handler.on_packet_sent(now, SpaceId::Data, zero_rtt);
        assert_eq!(handler.bytes_in_flight(), 100);

        let dropped = handler.drop_0rtt();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].packet_number, pn);
        assert_eq!(handler.bytes_in_flight(), 0);
    }

    #[test]
    fn retry_resets_state_and_samples_rtt() {
        let mut handler = handler(Side::Client);
        let now = Instant::now();
        let pn = handler.pop_packet_number(SpaceId::Initial);
        handler.on_packet_sent(now, SpaceId::Initial, packet(pn, now, 1200));

        let rtt = Duration::from_millis(42);
        let dropped = handler.reset_for_retry(now + rtt);
        assert_eq!(dropped.len(), 1);
        assert_eq!(handler.bytes_in_flight(), 0);
        assert_eq!(handler.rtt().get(), rtt);
        // Packet numbering continues after a retry
        assert_eq!(handler.peek_packet_number(SpaceId::Initial), pn + 1);
    }

    #[test]
    fn probes_prefer_old_data_over_pings() {
        let mut handler = handler(Side::Client);
        let now = Instant::now();
        let pn = handler.pop_packet_number(SpaceId::Initial);
        let mut sent = packet(pn, now, 100);
        sent.retransmits.get_or_create().handshake_done = true;
        handler.on_packet_sent(now, SpaceId::Initial, sent);

        let stolen = handler.retransmits_for_probe(SpaceId::Initial).unwrap();
        assert!(stolen.get().unwrap().handshake_done);
        // Stealing is destructive so acknowledgement cannot double-send
        assert!(handler.retransmits_for_probe(SpaceId::Initial).is_none());
    }

    #[test]
    fn congestion_window_gates_sending() {
        let mut handler = handler(Side::Client);
        let now = Instant::now();
        let window = handler.congestion_window();
        let pn = handler.pop_packet_number(SpaceId::Initial);
        let mut big = packet(pn, now, u16::MAX);
        big.size = u16::try_from(window.min(u64::from(u16::MAX))).unwrap();
        handler.on_packet_sent(now, SpaceId::Initial, big);
        while handler.bytes_in_flight() < window {
            let pn = handler.pop_packet_number(SpaceId::Initial);
            handler.on_packet_sent(now, SpaceId::Initial, packet(pn, now, 1200));
        }
        assert_eq!(handler.send_mode(), SendMode::Ack);
    }
}
