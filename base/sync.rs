//! Thin wrappers around `std::sync` primitives that don't propagate lock
//! poisoning. A panic while holding one of these doesn't leave the rest of
//! the process unable to recover the data; every caller here runs inside a
//! supervised worker thread/task that gets restarted on panic anyway.

use std::sync::{self, MutexGuard};

#[derive(Default, Debug)]
pub struct Mutex<T>(sync::Mutex<T>);

impl<T> Mutex<T> {
    pub fn new(t: T) -> Self {
        Mutex(sync::Mutex::new(t))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(sync::PoisonError::into_inner)
    }
}

#[derive(Default)]
pub struct Condvar(sync::Condvar);

impl Condvar {
    pub fn new() -> Self {
        Condvar(sync::Condvar::new())
    }

    pub fn notify_all(&self) {
        self.0.notify_all();
    }

    pub fn wait_timeout_while<'a, T, F>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: std::time::Duration,
        condition: F,
    ) -> (MutexGuard<'a, T>, sync::WaitTimeoutResult)
    where
        F: FnMut(&mut T) -> bool,
    {
        self.0
            .wait_timeout_while(guard, timeout, condition)
            .unwrap_or_else(sync::PoisonError::into_inner)
    }
}
