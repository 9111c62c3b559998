use std::time::{Duration, Instant};

use crate::connection::history::ReceivedPacketHistory;
use crate::packet::SpaceId;
use crate::range_set::RangeSet;

/// ACK-eliciting packets tolerated before an acknowledgement is forced in the data space
const ACK_ELICITING_THRESHOLD: u64 = 2;

/// Tracks received packets in one packet number space and decides when to acknowledge them
///
/// Initial and Handshake packets are acknowledged immediately, since handshake progress
/// depends on them. In the application data space an ACK is delayed until either a second
/// ack-eliciting packet arrives, reordering is observed, or `max_ack_delay` expires.
pub(crate) struct ReceivedPacketTracker {
    history: ReceivedPacketHistory,
    space: SpaceId,
    max_ack_delay: Duration,

    largest_observed: Option<u64>,
    largest_observed_time: Option<Instant>,

    /// Whether an ACK frame should be bundled into the next packet
    ack_queued: bool,
    ack_eliciting_since_last_ack: u64,
    /// Deadline by which the pending packets must be acknowledged
    ack_alarm: Option<Instant>,
}

impl ReceivedPacketTracker {
    pub(crate) fn new(space: SpaceId, max_ack_delay: Duration) -> Self {
        Self {
            history: ReceivedPacketHistory::new(),
            space,
            max_ack_delay,
            largest_observed: None,
            largest_observed_time: None,
            ack_queued: false,
            ack_eliciting_since_last_ack: 0,
            ack_alarm: None,
        }
    }

    /// Record a freshly decrypted packet
    pub(crate) fn received_packet(&mut self, pn: u64, now: Instant, ack_eliciting: bool) {
        let reordered = self.largest_observed.map_or(false, |largest| pn < largest);
        self.history.received_packet(pn);
        if self.largest_observed.map_or(true, |largest| pn > largest) {
            self.largest_observed = Some(pn);
            self.largest_observed_time = Some(now);
        }
        if !ack_eliciting {
            return;
        }

        self.ack_eliciting_since_last_ack += 1;
        if self.space != SpaceId::Data {
            self.ack_queued = true;
            return;
        }
        if reordered || self.ack_eliciting_since_last_ack >= ACK_ELICITING_THRESHOLD {
            // Acknowledge immediately so the peer's loss detection sees gaps quickly
            self.ack_queued = true;
            self.ack_alarm = None;
        } else if self.ack_alarm.is_none() {
            self.ack_alarm = Some(now + self.max_ack_delay);
        }
    }

    /// Whether an ACK frame must be bundled into the next outgoing packet
    pub(crate) fn ack_required(&self, now: Instant) -> bool {
        self.ack_queued || self.ack_alarm.map_or(false, |alarm| alarm <= now)
    }

    /// Deadline by which a delayed ACK becomes due, if one is pending
    pub(crate) fn alarm(&self) -> Option<Instant> {
        if self.ack_queued {
            None
        } else {
            self.ack_alarm
        }
    }

    /// Whether there is anything at all to acknowledge
    pub(crate) fn can_send_ack(&self) -> bool {
        !self.history.is_empty()
    }

    /// Produce the contents of an ACK frame and reset the scheduling state
    ///
    /// Returns the ranges to acknowledge and the delay since the largest acknowledged
    /// packet arrived.
    pub(crate) fn take_ack(&mut self, now: Instant) -> Option<(RangeSet, Duration)> {
        let ranges = self.history.to_range_set();
        if ranges.is_empty() {
            return None;
        }
        self.ack_queued = false;
        self.ack_alarm = None;
        self.ack_eliciting_since_last_ack = 0;
        // The delay field describes the highest acknowledged packet, which is only
        // meaningful while the history still reaches it
        let highest = self.history.highest_range().map(|r| r.end);
        let delay = match (self.largest_observed, self.largest_observed_time) {
            (Some(largest), Some(time)) if highest == Some(largest) => {
                now.saturating_duration_since(time)
            }
            _ => Duration::ZERO,
        };
        Some((ranges, delay))
    }

    /// Forget packet numbers below `pn`; used once our ACK for them was itself acked
    pub(crate) fn ignore_below(&mut self, pn: u64) {
        self.history.delete_below(pn);
    }

    /// Conservative replay check for a packet number about to be processed
    pub(crate) fn is_potentially_duplicate(&self, pn: u64) -> bool {
        self.history.is_potentially_duplicate(pn)
    }

    pub(crate) fn largest_observed(&self) -> Option<u64> {
        self.largest_observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_ACK_DELAY: Duration = Duration::from_millis(25);

    #[test]
    fn handshake_spaces_ack_immediately() {
        for space in [SpaceId::Initial, SpaceId::Handshake] {
            let mut tracker = ReceivedPacketTracker::new(space, MAX_ACK_DELAY);
            let now = Instant::now();
            tracker.received_packet(0, now, true);
            assert!(tracker.ack_required(now));
        }
    }

    #[test]
    fn data_space_delays_the_first_ack() {
        let mut tracker = ReceivedPacketTracker::new(SpaceId::Data, MAX_ACK_DELAY);
        let now = Instant::now();
        tracker.received_packet(0, now, true);
        assert!(!tracker.ack_required(now));
        assert_eq!(tracker.alarm(), Some(now + MAX_ACK_DELAY));
        // The alarm firing forces the ACK
        assert!(tracker.ack_required(now + MAX_ACK_DELAY));
    }

    #[test]
    fn second_ack_eliciting_packet_forces_an_ack() {
        let mut tracker = ReceivedPacketTracker::new(SpaceId::Data, MAX_ACK_DELAY);
        let now = Instant::now();
        tracker.received_packet(0, now, true);
        tracker.received_packet(1, now, true);
        assert!(tracker.ack_required(now));
        assert_eq!(tracker.alarm(), None);
    }

    #[test]
    fn reordering_forces_an_ack() {
        let mut tracker = ReceivedPacketTracker::new(SpaceId::Data, MAX_ACK_DELAY);
        let now = Instant::now();
        tracker.received_packet(3, now, true);
        assert!(!tracker.ack_required(now));
        tracker.received_packet(1, now, true);
        assert!(tracker.ack_required(now));
    }

    #[test]
    fn non_eliciting_packets_never_schedule_an_ack() {
        let mut tracker = ReceivedPacketTracker::new(SpaceId::Data, MAX_ACK_DELAY);
        let now = Instant::now();
        for pn in 0..10 {
            tracker.received_packet(pn, now, false);
        }
        assert!(!tracker.ack_required(now + Duration::from_secs(1)));
        assert!(tracker.can_send_ack());
    }

    #[test]
    fn take_ack_reports_delay_for_the_largest_packet() {
        let mut tracker = ReceivedPacketTracker::new(SpaceId::Data, MAX_ACK_DELAY);
        let now = Instant::now();
        tracker.received_packet(0, now, true);
        tracker.received_packet(1, now, true);
        let later = now + Duration::from_millis(10);
        let (ranges, delay) = tracker.take_ack(later).unwrap();
        assert_eq!(ranges.max(), Some(1));
        assert_eq!(delay, Duration::from_millis(10));
        assert!(!tracker.ack_required(later));
    }

    #[test]
    fn ignore_below_trims_future_acks() {
        let mut tracker = ReceivedPacketTracker::new(SpaceId::Data, MAX_ACK_DELAY);
        let now = Instant::now();
        for pn in 0..5 {
            tracker.received_packet(pn, now, true);
        }
        tracker.ignore_below(3);
        let (ranges, _) = tracker.take_ack(now).unwrap();
        assert_eq!(ranges.min(), Some(3));
        assert!(tracker.is_potentially_duplicate(2));
    }
}
