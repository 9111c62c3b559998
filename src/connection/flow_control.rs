use std::time::Instant;

use tracing::debug;

use super::rtt::RttEstimator;
use crate::transport_error::TransportError;

/// Byte-level flow control for one direction of one resource (a stream or the connection)
///
/// All window values are absolute offsets from the start of the resource, not increments.
/// `bytes_sent`, `bytes_read`, and `highest_received` grow monotonically over a
/// resource's lifetime.
///
/// The receive window auto-tunes: every time half the current window has been consumed,
/// a window update is emitted, and if that half-window was read within two smoothed
/// round trips the window size doubles, up to a configured ceiling.
#[derive(Debug)]
pub(crate) struct FlowController {
    /// Bytes we have transmitted
    bytes_sent: u64,
    /// Highest offset the peer permits us to send up to
    send_window: u64,
    /// Send offset at which we last reported ourselves blocked
    last_blocked_at: Option<u64>,

    /// Bytes the application has consumed
    bytes_read: u64,
    /// Highest received offset; must never exceed `receive_window`
    highest_received: u64,
    /// Highest offset the peer is permitted to send up to
    receive_window: u64,
    /// Current width of the receive window
    receive_window_size: u64,
    /// Ceiling for `receive_window_size`
    max_receive_window_size: u64,

    /// When the current auto-tuning epoch began
    epoch_start_time: Option<Instant>,
    /// `bytes_read` when the current auto-tuning epoch began
    epoch_start_offset: u64,
}

impl FlowController {
    pub(crate) fn new(receive_window: u64, max_receive_window_size: u64, send_window: u64) -> Self {
        Self {
            bytes_sent: 0,
            send_window,
            last_blocked_at: None,
            bytes_read: 0,
            highest_received: 0,
            receive_window,
            receive_window_size: receive_window,
            max_receive_window_size,
            epoch_start_time: None,
            epoch_start_offset: 0,
        }
    }

    //
    // Send side
    //

    pub(crate) fn add_bytes_sent(&mut self, n: u64) {
        debug_assert!(self.bytes_sent + n <= self.send_window);
        self.bytes_sent += n;
    }

    /// Credit still available for sending
    pub(crate) fn send_window_size(&self) -> u64 {
        self.send_window - self.bytes_sent
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Raise the send window to `offset`; lowering is never permitted
    pub(crate) fn update_send_window(&mut self, offset: u64) {
        if offset > self.send_window {
            self.send_window = offset;
        }
    }

    /// Report the transition into being blocked, at most once per send window
    ///
    /// Returns the blocking offset exactly once after `bytes_sent` reaches the window,
    /// for use in DATA_BLOCKED / STREAM_DATA_BLOCKED frames.
    pub(crate) fn take_newly_blocked(&mut self) -> Option<u64> {
        if self.send_window_size() != 0 || self.last_blocked_at == Some(self.send_window) {
            return None;
        }
        self.last_blocked_at = Some(self.send_window);
        Some(self.send_window)
    }

    //
    // Receive side
    //

    /// Record receipt of data up to `offset`, or fail if it overruns the window
    pub(crate) fn record_highest_received(&mut self, offset: u64) -> Result<u64, TransportError> {
        if offset <= self.highest_received {
            return Ok(0);
        }
        let increment = offset - self.highest_received;
        self.highest_received = offset;
        if self.highest_received > self.receive_window {
            return Err(TransportError::FLOW_CONTROL_ERROR("flow control limit exceeded"));
        }
        Ok(increment)
    }

    /// Variant of [`record_highest_received`](Self::record_highest_received) for the
    /// connection-level controller, whose total is a sum of per-stream increments
    pub(crate) fn add_highest_received(&mut self, increment: u64) -> Result<(), TransportError> {
        self.highest_received += increment;
        if self.highest_received > self.receive_window {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "connection flow control limit exceeded",
            ));
        }
        Ok(())
    }

    pub(crate) fn add_bytes_read(&mut self, n: u64) {
        self.bytes_read += n;
    }

    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Unconsumed bytes the peer may already have sent; released when a stream is abandoned
    pub(crate) fn abandoned_credit(&self) -> u64 {
        self.highest_received - self.bytes_read
    }

    /// Whether enough of the window was consumed that the peer needs a fresh limit
    pub(crate) fn has_window_update(&self) -> bool {
        self.receive_window - self.bytes_read <= self.receive_window_size / 2
    }

    /// Produce the new receive limit to advertise, if one is due
    ///
    /// Idempotent between triggers: once the update is taken, another is produced only
    /// after the consumption threshold is crossed again.
    pub(crate) fn get_window_update(&mut self, now: Instant, rtt: &RttEstimator) -> Option<u64> {
        if !self.has_window_update() {
            return None;
        }
        self.maybe_grow_window(now, rtt);
        self.receive_window = self.bytes_read + self.receive_window_size;
        Some(self.receive_window)
    }

    fn maybe_grow_window(&mut self, now: Instant, rtt: &RttEstimator) {
        if let Some(epoch_start) = self.epoch_start_time {
            // The window was consumed quickly enough that it is plausibly limiting
            // throughput
            if now.saturating_duration_since(epoch_start) < 2 * rtt.get()
                && self.receive_window_size < self.max_receive_window_size
            {
                self.receive_window_size =
                    (2 * self.receive_window_size).min(self.max_receive_window_size);
                debug!(
                    size = self.receive_window_size,
                    "increased receive flow control window"
                );
            }
        }
        self.start_new_epoch(now);
    }

    /// Guarantee the window size is at least `size`
    ///
    /// Used to keep the connection-level window no narrower than its widest stream
    /// window.
    pub(crate) fn ensure_minimum_window_size(&mut self, size: u64, now: Instant) {
        if size > self.receive_window_size {
            self.receive_window_size = size.min(self.max_receive_window_size);
            debug!(
                size = self.receive_window_size,
                "increased receive flow control window to match a stream window"
            );
            self.start_new_epoch(now);
        }
    }

    pub(crate) fn receive_window_size(&self) -> u64 {
        self.receive_window_size
    }

    fn start_new_epoch(&mut self, now: Instant) {
        self.epoch_start_time = Some(now);
        self.epoch_start_offset = self.bytes_read;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MIB: u64 = 1 << 20;

    fn rtt_of(srtt: Duration) -> RttEstimator {
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        rtt.update(Duration::ZERO, srtt);
        rtt
    }

    #[test]
    fn send_window_accounting() {
        let mut fc = FlowController::new(0, 0, 1000);
        assert_eq!(fc.send_window_size(), 1000);
        fc.add_bytes_sent(300);
        assert_eq!(fc.send_window_size(), 700);
        fc.update_send_window(2000);
        assert_eq!(fc.send_window_size(), 1700);
        // Lowering is ignored
        fc.update_send_window(100);
        assert_eq!(fc.send_window_size(), 1700);
    }

    #[test]
    fn blocked_is_reported_exactly_once_per_window() {
        let mut fc = FlowController::new(0, 0, 100);
        assert_eq!(fc.take_newly_blocked(), None);
        fc.add_bytes_sent(100);
        assert_eq!(fc.take_newly_blocked(), Some(100));
        assert_eq!(fc.take_newly_blocked(), None);
        // A fresh window and a fresh exhaustion report again
        fc.update_send_window(200);
        assert_eq!(fc.take_newly_blocked(), None);
        fc.add_bytes_sent(100);
        assert_eq!(fc.take_newly_blocked(), Some(200));
        assert_eq!(fc.take_newly_blocked(), None);
    }

    #[test]
    fn receive_window_violation_is_detected() {
        let mut fc = FlowController::new(1000, 1000, 0);
        assert!(fc.record_highest_received(1000).is_ok());
        let err = fc.record_highest_received(1001).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn highest_received_is_monotonic() {
        let mut fc = FlowController::new(1000, 1000, 0);
        assert_eq!(fc.record_highest_received(500).unwrap(), 500);
        assert_eq!(fc.record_highest_received(400).unwrap(), 0);
        assert_eq!(fc.record_highest_received(600).unwrap(), 100);
    }

    #[test]
    fn no_update_before_half_the_window_is_consumed() {
        let mut fc = FlowController::new(MIB, 8 * MIB, 0);
        let rtt = rtt_of(Duration::from_millis(100));
        let now = Instant::now();
        fc.record_highest_received(MIB / 4).unwrap();
        fc.add_bytes_read(MIB / 4);
        assert_eq!(fc.get_window_update(now, &rtt), None);
    }

    #[test]
    fn fast_consumption_doubles_the_window() {
        let mut fc = FlowController::new(MIB, 8 * MIB, 0);
        let rtt = rtt_of(Duration::from_millis(100));
        let start = Instant::now();
        // Seed the epoch with the first update
        fc.record_highest_received(MIB / 2).unwrap();
        fc.add_bytes_read(MIB / 2);
        let first = fc.get_window_update(start, &rtt).unwrap();
        assert_eq!(first, MIB / 2 + MIB);

        // Consume the next half window within half a smoothed RTT
        let now = start + Duration::from_millis(50);
        fc.record_highest_received(MIB).unwrap();
        fc.add_bytes_read(MIB / 2);
        let second = fc.get_window_update(now, &rtt).unwrap();
        assert_eq!(fc.receive_window_size(), 2 * MIB);
        assert!(second >= MIB + 2 * MIB);
    }

    #[test]
    fn slow_consumption_does_not_grow_the_window() {
        let mut fc = FlowController::new(MIB, 8 * MIB, 0);
        let rtt = rtt_of(Duration::from_millis(100));
        let start = Instant::now();
        fc.record_highest_received(MIB / 2).unwrap();
        fc.add_bytes_read(MIB / 2);
        fc.get_window_update(start, &rtt).unwrap();

        // The next half window takes much longer than 2 RTT
        let now = start + Duration::from_secs(10);
        fc.record_highest_received(MIB).unwrap();
        fc.add_bytes_read(MIB / 2);
        fc.get_window_update(now, &rtt).unwrap();
        assert_eq!(fc.receive_window_size(), MIB);
    }

    #[test]
    fn window_growth_is_capped() {
        let mut fc = FlowController::new(MIB, 3 * MIB / 2, 0);
        let rtt = rtt_of(Duration::from_millis(100));
        let mut now = Instant::now();
        for _ in 0..4 {
            let read = fc.bytes_read();
            let target = read + fc.receive_window_size() / 2;
            fc.record_highest_received(target).unwrap();
            fc.add_bytes_read(target - read);
            fc.get_window_update(now, &rtt);
            now += Duration::from_millis(1);
        }
        assert_eq!(fc.receive_window_size(), 3 * MIB / 2);
    }

    #[test]
    fn update_is_idempotent_between_triggers() {
        let mut fc = FlowController::new(1000, 8000, 0);
        let rtt = rtt_of(Duration::from_millis(100));
        let now = Instant::now();
        fc.record_highest_received(600).unwrap();
        fc.add_bytes_read(600);
        assert!(fc.get_window_update(now, &rtt).is_some());
        assert_eq!(fc.get_window_update(now, &rtt), None);
    }

    #[test]
    fn ensure_minimum_window_size_raises_and_caps() {
        let mut fc = FlowController::new(MIB, 2 * MIB, 0);
        let now = Instant::now();
        fc.ensure_minimum_window_size(MIB / 2, now);
        assert_eq!(fc.receive_window_size(), MIB);
        fc.ensure_minimum_window_size(4 * MIB, now);
        assert_eq!(fc.receive_window_size(), 2 * MIB);
    }
}
