//! Blocking delays.

use std::time::Duration;

/// Blocking wait used between bus transactions.
pub trait Delay {
    fn delay(&mut self, duration: Duration);
}

impl<T: Delay + ?Sized> Delay for &mut T {
    fn delay(&mut self, duration: Duration) {
        (**self).delay(duration)
    }
}

/// Sleeps the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay(&mut self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Returns immediately. For simulated hardware and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

impl Delay for NoDelay {
    fn delay(&mut self, _duration: Duration) {}
}
