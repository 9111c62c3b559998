use rand::{Rng, SeedableRng};

/// Source of packet numbers for one packet number space
///
/// `peek` is idempotent; `pop` returns the same value and advances. The skipping variant
/// deliberately leaves holes in the sequence so that a peer acknowledging a number that
/// was never sent convicts itself of acknowledging blind.
#[derive(Debug)]
pub(crate) enum PacketNumberGenerator {
    Sequential(SequentialGenerator),
    Skipping(SkippingGenerator),
}

impl PacketNumberGenerator {
    pub(crate) fn sequential(initial: u64) -> Self {
        Self::Sequential(SequentialGenerator { next: initial })
    }

    /// The skip schedule starts at `initial_period` and doubles after every skip, up to
    /// `max_period`. The RNG is seeded from OS entropy so the schedule cannot be predicted.
    pub(crate) fn skipping(initial: u64, initial_period: u64, max_period: u64) -> Self {
        let mut gen = SkippingGenerator {
            rng: rand::rngs::StdRng::from_entropy(),
            period: initial_period,
            max_period,
            next: initial,
            next_to_skip: 0,
        };
        gen.generate_new_skip();
        Self::Skipping(gen)
    }

    /// The number the next packet will carry
    pub(crate) fn peek(&self) -> u64 {
        match self {
            Self::Sequential(gen) => gen.next,
            Self::Skipping(gen) => gen.next,
        }
    }

    /// Claim the next packet number
    pub(crate) fn pop(&mut self) -> u64 {
        match self {
            Self::Sequential(gen) => {
                let next = gen.next;
                gen.next += 1;
                next
            }
            Self::Skipping(gen) => gen.pop(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SequentialGenerator {
    next: u64,
}

#[derive(Debug)]
pub(crate) struct SkippingGenerator {
    rng: rand::rngs::StdRng,
    period: u64,
    max_period: u64,
    next: u64,
    next_to_skip: u64,
}

impl SkippingGenerator {
    fn pop(&mut self) -> u64 {
        let next = self.next;
        self.next += 1;
        if self.next == self.next_to_skip {
            self.next += 1;
            self.generate_new_skip();
        }
        next
    }

    fn generate_new_skip(&mut self) {
        // Skipping the number right after a skip would make the gap ambiguous, so the
        // next skip is always at least two ahead.
        self.next_to_skip = self.next + 2 + self.rng.gen_range(0..2 * self.period);
        self.period = (2 * self.period).min(self.max_period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INITIAL_PERIOD: u64 = 25;
    const MAX_PERIOD: u64 = 300;

    #[test]
    fn sequential_numbers() {
        let mut gen = PacketNumberGenerator::sequential(123);
        for i in 123..1123 {
            assert_eq!(gen.peek(), i);
            assert_eq!(gen.peek(), i);
            assert_eq!(gen.pop(), i);
        }
    }

    #[test]
    fn skipping_starts_at_the_initial_number() {
        let mut gen = PacketNumberGenerator::skipping(12345, INITIAL_PERIOD, MAX_PERIOD);
        assert_eq!(gen.pop(), 12345);
    }

    #[test]
    fn skipping_peek_is_idempotent() {
        let mut gen = PacketNumberGenerator::skipping(8, INITIAL_PERIOD, MAX_PERIOD);
        if let PacketNumberGenerator::Skipping(ref mut inner) = gen {
            inner.next_to_skip = 1000;
        }
        assert_eq!(gen.peek(), 8);
        assert_eq!(gen.peek(), 8);
        assert_eq!(gen.pop(), 8);
        assert_eq!(gen.peek(), 9);
        assert_eq!(gen.peek(), 9);
    }

    #[test]
    fn skips_a_packet_number() {
        let mut gen = PacketNumberGenerator::skipping(8, INITIAL_PERIOD, MAX_PERIOD);
        let mut last = gen.pop();
        let mut skipped = false;
        for _ in 0..1000 {
            let num = gen.pop();
            if num > last + 1 {
                skipped = true;
                break;
            }
            last = num;
        }
        assert!(skipped);
    }

    #[test]
    fn never_skips_two_consecutive_packet_numbers() {
        let mut gen = PacketNumberGenerator::skipping(0, INITIAL_PERIOD, MAX_PERIOD);
        let mut last = gen.pop();
        for _ in 0..10_000 {
            let num = gen.pop();
            assert!(num - last <= 2, "skipped {} numbers", num - last - 1);
            last = num;
        }
    }

    #[test]
    fn skip_periods_follow_the_doubling_schedule() {
        // Average gaps between skips over many runs approach
        // initial_period, 2*initial_period, ... capped at max_period.
        const RUNS: usize = 500;
        let expected_periods = [25u64, 50, 100, 200, 300, 300, 300];
        let mut sums = [0u64; 7];

        for _ in 0..RUNS {
            let mut gen = PacketNumberGenerator::skipping(8, INITIAL_PERIOD, MAX_PERIOD);
            let mut last = 8;
            let mut last_skip = 8;
            let mut seen = 0;
            while seen < expected_periods.len() {
                let next = gen.pop();
                if next > last + 1 {
                    let skipped = next - 1;
                    sums[seen] += skipped - last_skip - 1;
                    last_skip = skipped;
                    seen += 1;
                }
                last = next;
            }
        }

        for (i, &expected) in expected_periods.iter().enumerate() {
            let average = sums[i] as f64 / RUNS as f64;
            // We never skip two packet numbers at once, hence the +1
            let expected = (expected + 1) as f64;
            let tolerance = (expected / 10.0).max(5.0);
            assert!(
                (average - expected).abs() < tolerance,
                "period {i}: got {average}, expected {expected}"
            );
        }
    }
}
