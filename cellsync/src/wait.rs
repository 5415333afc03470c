//! The cooperative wait primitive.
//!
//! Every blocking wait in the crate (peer phase completion, alive probe,
//! operator decision) is a loop of bounded steps. Each step does one unit of
//! I/O and reports whether the awaited result is known. Between steps the
//! modal surface is ticked so the operator can cancel, and the deadline is
//! checked.

use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

/// Timeout for a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::Duration(d)
    }
}

impl Timeout {
    /// `0` means unbounded.
    #[must_use]
    pub const fn from_secs_or_infinite(secs: u64) -> Self {
        if secs == 0 {
            Timeout::Infinite
        } else {
            Timeout::Duration(Duration::from_secs(secs))
        }
    }
}

/// Absolute point at which a wait gives up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
    budget: Duration,
}

impl Deadline {
    #[must_use]
    pub fn after(timeout: Timeout) -> Self {
        match timeout {
            Timeout::Infinite => Self {
                at: None,
                budget: Duration::MAX,
            },
            // Past the clock's range the wait is as good as unbounded.
            Timeout::Duration(d) => Self {
                at: Instant::now().checked_add(d),
                budget: d,
            },
        }
    }

    #[must_use]
    pub fn expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() > at)
    }

    /// Time left, or `None` when unbounded.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// The duration this deadline was created with.
    #[must_use]
    pub const fn budget(&self) -> Duration {
        self.budget
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("wait timed out after {0:?}")]
    TimedOut(Duration),
    #[error("wait cancelled by operator")]
    Cancelled,
}

/// What the modal surface wants after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Cancel,
}

/// A UI surface that stays responsive during a blocking wait.
pub trait ModalSurface {
    /// Advances the surface once. Must not block.
    fn tick(&mut self) -> Tick;
}

/// Surface for unattended operation; never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct Headless;

impl ModalSurface for Headless {
    fn tick(&mut self) -> Tick {
        Tick::Continue
    }
}

impl<F> ModalSurface for F
where
    F: FnMut() -> Tick,
{
    fn tick(&mut self) -> Tick {
        self()
    }
}

/// Runs `step` until it yields a value, the deadline passes, or `ui`
/// cancels.
///
/// `step` is expected to block for a bounded time (typically one transport
/// poll). It is always called at least once, so a result that is already
/// known is returned even with a zero timeout.
pub fn await_completion<T, E, S, U>(timeout: Timeout, ui: &mut U, mut step: S) -> Result<T, E>
where
    E: From<WaitError>,
    S: FnMut() -> Result<Option<T>, E>,
    U: ModalSurface + ?Sized,
{
    let deadline = Deadline::after(timeout);
    loop {
        if let Some(value) = step()? {
            return Ok(value);
        }
        if ui.tick() == Tick::Cancel {
            return Err(WaitError::Cancelled.into());
        }
        if deadline.expired() {
            return Err(WaitError::TimedOut(deadline.budget()).into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_first_value() {
        let mut n = 0;
        let got: Result<u32, WaitError> =
            await_completion(Timeout::Infinite, &mut Headless, || {
                n += 1;
                Ok((n == 3).then_some(n))
            });
        assert_eq!(got, Ok(3));
    }

    #[test]
    fn already_known_beats_zero_timeout() {
        let got: Result<u8, WaitError> =
            await_completion(Duration::ZERO.into(), &mut Headless, || Ok(Some(1)));
        assert_eq!(got, Ok(1));
    }

    #[test]
    fn times_out() {
        let got: Result<(), WaitError> =
            await_completion(Duration::from_millis(5).into(), &mut Headless, || {
                std::thread::sleep(Duration::from_millis(1));
                Ok(None)
            });
        assert_eq!(got, Err(WaitError::TimedOut(Duration::from_millis(5))));
    }

    #[test]
    fn huge_timeout_never_expires() {
        let deadline = Deadline::after(Timeout::Duration(Duration::MAX));
        assert!(!deadline.expired());
        assert_eq!(deadline.budget(), Duration::MAX);
    }

    #[test]
    fn ui_cancels() {
        let mut ticks = 0;
        let mut ui = || {
            ticks += 1;
            if ticks > 2 { Tick::Cancel } else { Tick::Continue }
        };
        let got: Result<(), WaitError> = await_completion(Timeout::Infinite, &mut ui, || Ok(None));
        assert_eq!(got, Err(WaitError::Cancelled));
    }

    #[test]
    fn zero_secs_is_unbounded() {
        assert_eq!(Timeout::from_secs_or_infinite(0), Timeout::Infinite);
        assert_eq!(
            Timeout::from_secs_or_infinite(5),
            Timeout::Duration(Duration::from_secs(5))
        );
    }
}
