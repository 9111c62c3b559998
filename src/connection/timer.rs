use std::time::Instant;

/// Kinds of timeouts needed to run the protocol logic
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Timer {
    /// When to send an ack-eliciting probe packet or declare unacked packets lost
    LossDetection = 0,
    /// When to close the connection after no activity
    Idle = 1,
    /// When the close timer expires, the connection has been gracefully terminated.
    Close = 2,
    /// When keys are discarded because they should not be needed anymore
    KeyDiscard = 3,
    /// When to send a `PING` frame to keep the connection alive
    KeepAlive = 4,
    /// When pacing will allow us to send a packet
    Pacing = 5,
    /// When a delayed ACK must be emitted at the latest
    MaxAckDelay = 6,
}

impl Timer {
    pub(crate) const VALUES: [Self; 7] = [
        Self::LossDetection,
        Self::Idle,
        Self::Close,
        Self::KeyDiscard,
        Self::KeepAlive,
        Self::Pacing,
        Self::MaxAckDelay,
    ];
}

/// A table of data associated with each distinct kind of `Timer`
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; 7],
}

impl TimerTable {
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    pub(crate) fn get(&self, timer: Timer) -> Option<Instant> {
        self.data[timer as usize]
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    /// The instant at which the earliest armed timer expires
    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    /// Disarm and return some timer that has expired by `now`, if any
    pub(crate) fn expire_before(&mut self, now: Instant) -> Option<Timer> {
        for timer in Timer::VALUES {
            if let Some(time) = self.data[timer as usize] {
                if time <= now {
                    self.data[timer as usize] = None;
                    return Some(timer);
                }
            }
        }
        None
    }

    pub(crate) fn is_expired(&self, timer: Timer, now: Instant) -> bool {
        self.get(timer).map_or(false, |time| time <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expiry_and_rearm() {
        let mut timers = TimerTable::default();
        let now = Instant::now();
        let sec = Duration::from_secs(1);
        timers.set(Timer::Idle, now + 3 * sec);
        timers.set(Timer::Close, now + sec);
        timers.set(Timer::Idle, now + 2 * sec); // re-arm overwrites

        assert_eq!(timers.next_timeout(), Some(now + sec));
        assert_eq!(timers.expire_before(now), None);
        assert_eq!(timers.expire_before(now + sec), Some(Timer::Close));
        assert_eq!(timers.expire_before(now + 3 * sec), Some(Timer::Idle));
        assert_eq!(timers.expire_before(now + 3 * sec), None);
    }

    #[test]
    fn stop_disarms() {
        let mut timers = TimerTable::default();
        let now = Instant::now();
        timers.set(Timer::KeepAlive, now);
        timers.stop(Timer::KeepAlive);
        assert_eq!(timers.next_timeout(), None);
        assert!(!timers.is_expired(Timer::KeepAlive, now));
    }
}
