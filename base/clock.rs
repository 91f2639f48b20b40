//! Clock interface and implementations for testability.
//!
//! The monotonic clock is the experiment clock: every frame, marker, and
//! trigger timestamp downstream is expressed in seconds since some
//! unspecified epoch on this clock, never wall-clock time. `wall()` exists
//! only to let status snapshots and logs report a human-readable instant
//! alongside the monotonic one.

use std::sync::Mutex;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::Error;
use crate::shutdown::ShutdownError;

/// Abstract interface to the system clocks. This exists for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Returns seconds since an unspecified epoch, from a monotonic clock
    /// that never jumps backward and is unaffected by wall-clock changes.
    fn now(&self) -> f64;

    /// Returns `(now(), current wall-clock instant)`, sampled as closely
    /// together as possible so the pair can be used to translate monotonic
    /// timestamps into wall-clock ones after the fact.
    fn wall(&self) -> (f64, DateTime<Utc>);

    /// Causes the current thread to sleep for the specified duration.
    fn sleep(&self, how_long: StdDuration);

    /// Calls `rcv.recv_timeout` or substitutes a test implementation.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError>;
}

/// Retries `f` until it succeeds, sleeping a second between attempts and
/// checking `shutdown_rx` so a shutdown request can interrupt the wait.
pub fn retry<C, T, E>(
    clocks: &C,
    shutdown_rx: &crate::shutdown::Receiver,
    f: &mut dyn FnMut() -> Result<T, E>,
) -> Result<T, ShutdownError>
where
    C: Clocks,
    E: Into<Error>,
{
    loop {
        let e = match f() {
            Ok(t) => return Ok(t),
            Err(e) => e.into(),
        };
        shutdown_rx.check()?;
        warn!(exception = %e.chain(), "sleeping for 1 s after error");
        clocks.sleep(StdDuration::from_secs(1));
    }
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl RealClocks {
    fn get(&self, clock: libc::clockid_t) -> f64 {
        unsafe {
            let mut ts = std::mem::MaybeUninit::uninit();
            assert_eq!(0, libc::clock_gettime(clock, ts.as_mut_ptr()));
            let ts = ts.assume_init();
            ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
        }
    }
}

impl Clocks for RealClocks {
    #[cfg(target_os = "linux")]
    fn now(&self) -> f64 {
        self.get(libc::CLOCK_BOOTTIME)
    }

    #[cfg(not(target_os = "linux"))]
    fn now(&self) -> f64 {
        self.get(libc::CLOCK_MONOTONIC)
    }

    fn wall(&self) -> (f64, DateTime<Utc>) {
        (self.now(), Utc::now())
    }

    fn sleep(&self, how_long: StdDuration) {
        thread::sleep(how_long);
    }

    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        rcv.recv_timeout(timeout)
    }
}

/// Logs a warning if the guard lives "too long", using the label created by
/// a supplied function. Used to flag slow I/O on the frame-ingest hot path
/// without paying for string formatting on the common case.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: f64,
    warn_secs: f64,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        Self::with_threshold(clocks, label_f, 1.0)
    }

    pub fn with_threshold(clocks: &'a C, label_f: F, warn_secs: f64) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.now(),
            warn_secs,
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.now() - self.start;
        if elapsed >= self.warn_secs {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {:.3}s!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing: advances only when told to, either by an
/// explicit `sleep`/`advance` or implicitly by `recv_timeout` timing out.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    wall0: DateTime<Utc>,
    uptime: Mutex<f64>,
}

impl SimulatedClocks {
    pub fn new(wall0: DateTime<Utc>) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            wall0,
            uptime: Mutex::new(0.0),
        }))
    }

    /// Advances the simulated clock by `secs` without sleeping the thread.
    pub fn advance(&self, secs: f64) {
        *self.0.uptime.lock().unwrap() += secs;
    }
}

impl Clocks for SimulatedClocks {
    fn now(&self) -> f64 {
        *self.0.uptime.lock().unwrap()
    }

    fn wall(&self) -> (f64, DateTime<Utc>) {
        let t = self.now();
        (
            t,
            self.0.wall0 + chrono::Duration::microseconds((t * 1e6) as i64),
        )
    }

    fn sleep(&self, how_long: StdDuration) {
        self.advance(how_long.as_secs_f64());
    }

    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        let r = rcv.recv_timeout(StdDuration::new(0, 0));
        if r.is_err() {
            self.sleep(timeout);
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances_only_when_told() {
        let c = SimulatedClocks::new(Utc::now());
        assert_eq!(c.now(), 0.0);
        c.advance(1.5);
        assert_eq!(c.now(), 1.5);
        let (mono, _wall) = c.wall();
        assert_eq!(mono, 1.5);
    }

    #[test]
    fn recv_timeout_advances_on_timeout() {
        let c = SimulatedClocks::new(Utc::now());
        let (_tx, rx) = mpsc::channel::<()>();
        let r = c.recv_timeout(&rx, StdDuration::from_secs(2));
        assert!(r.is_err());
        assert_eq!(c.now(), 2.0);
    }
}
