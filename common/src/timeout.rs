/// A monotonic clock with busy-wait delays.
pub trait Clock {
    /// Milliseconds since an arbitrary point. Wraps around.
    fn now_ms(&self) -> u32;
    fn delay_us(&self, us: u32);

    fn delay_ms(&self, ms: u32) {
        self.delay_us(ms.saturating_mul(1000))
    }
}

/// One step of a polled condition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Poll<T, E> {
    Pending,
    Ready(T),
    Failed(E),
}

/// How a bounded poll loop ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollOutcome<T, E> {
    Completed(T),
    HardwareError(E),
    TimedOut,
}

pub struct Timeout<'c> {
    clock: &'c dyn Clock,
    start: u32,
    duration: u32,
    interval_us: u32,
}

impl<'c> Timeout<'c> {
    pub const DEFAULT_INTERVAL_US: u32 = 100;

    #[inline]
    pub fn from_millis(clock: &'c dyn Clock, millis: u32) -> Self {
        Self {
            start: clock.now_ms(),
            clock,
            duration: millis,
            interval_us: Self::DEFAULT_INTERVAL_US,
        }
    }

    #[inline]
    pub fn with_interval_us(mut self, interval_us: u32) -> Self {
        self.interval_us = interval_us;
        self
    }

    #[inline]
    pub fn expired(&self) -> bool {
        self.clock.now_ms().wrapping_sub(self.start) >= self.duration
    }

    /// Wait one interval, or fail once the deadline has passed. A zero duration fails on the
    /// first call without waiting.
    #[inline]
    pub fn run(&self) -> Result<(), ()> {
        if self.expired() {
            Err(())
        } else {
            self.clock.delay_us(self.interval_us);
            Ok(())
        }
    }

    /// Evaluate `check` until it is ready, has failed, or the deadline passes. The condition is
    /// always evaluated at least once.
    pub fn poll<T, E>(&self, mut check: impl FnMut() -> Poll<T, E>) -> PollOutcome<T, E> {
        loop {
            match check() {
                Poll::Ready(value) => return PollOutcome::Completed(value),
                Poll::Failed(err) => return PollOutcome::HardwareError(err),
                Poll::Pending => (),
            }
            if self.run().is_err() {
                return PollOutcome::TimedOut;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    struct TestClock {
        us: Cell<u64>,
        delays: Cell<u32>,
    }

    impl TestClock {
        fn at_ms(ms: u32) -> Self {
            Self {
                us: Cell::new(u64::from(ms) * 1000),
                delays: Cell::new(0),
            }
        }
    }

    impl Clock for TestClock {
        fn now_ms(&self) -> u32 {
            (self.us.get() / 1000) as u32
        }
        fn delay_us(&self, us: u32) {
            self.us.set(self.us.get() + u64::from(us));
            self.delays.set(self.delays.get() + 1);
        }
    }

    #[test]
    fn zero_duration_times_out_on_first_check() {
        let clock = TestClock::at_ms(5);
        let timeout = Timeout::from_millis(&clock, 0);
        let mut checks = 0;

        let outcome: PollOutcome<(), ()> = timeout.poll(|| {
            checks += 1;
            Poll::Pending
        });

        assert_eq!(outcome, PollOutcome::TimedOut);
        assert_eq!(checks, 1);
        assert_eq!(clock.delays.get(), 0);
    }

    #[test]
    fn outcomes_are_distinct() {
        let clock = TestClock::at_ms(0);

        let mut countdown = 3;
        let ready = Timeout::from_millis(&clock, 10).poll(|| {
            countdown -= 1;
            if countdown == 0 {
                Poll::<u8, ()>::Ready(7)
            } else {
                Poll::Pending
            }
        });
        assert_eq!(ready, PollOutcome::Completed(7));
        assert_eq!(clock.delays.get(), 2);

        let failed = Timeout::from_millis(&clock, 10).poll(|| Poll::<(), _>::Failed("halted"));
        assert_eq!(failed, PollOutcome::HardwareError("halted"));
    }

    #[test]
    fn bounded_across_clock_wrap() {
        let clock = TestClock::at_ms(u32::MAX - 1);
        let timeout = Timeout::from_millis(&clock, 3).with_interval_us(500);

        let outcome: PollOutcome<(), ()> = timeout.poll(|| Poll::Pending);

        assert_eq!(outcome, PollOutcome::TimedOut);
        // 3 ms in 500 us steps.
        assert_eq!(clock.delays.get(), 6);
    }
}
