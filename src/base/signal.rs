//! Mutex and condition variable paired into one primitive.
//!
//! Every state transition of the write-lock protocol happens under such a
//! pair: the worker holds the lock while executing, parks on the condvar
//! when it runs out of work, and callers signal it after publishing new
//! instructions or finishing a handed-off transaction.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

pub struct Signal<T> {
    lock: Mutex<T>,
    cond: Condvar,
}

impl<T> Signal<T> {
    pub fn new(val: T) -> Self {
        Signal {
            lock: Mutex::new(val),
            cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<T> {
        self.lock.lock().unwrap()
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<T>> {
        self.lock.try_lock().ok()
    }

    #[inline]
    pub fn wait<'a>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.cond.wait(guard).unwrap()
    }

    #[inline]
    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> MutexGuard<'a, T> {
        self.cond.wait_timeout(guard, timeout).unwrap().0
    }

    #[inline]
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_wakes_waiter() {
        let signal = Arc::new(Signal::new(false));
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || {
                let mut guard = signal.lock();
                while !*guard {
                    guard = signal.wait(guard);
                }
            })
        };
        {
            let mut guard = signal.lock();
            *guard = true;
        }
        signal.notify_all();
        waiter.join().unwrap();
    }

    #[test]
    fn wait_timeout_returns() {
        let signal = Signal::new(0u32);
        let guard = signal.lock();
        let guard = signal.wait_timeout(guard, Duration::from_millis(1));
        assert_eq!(*guard, 0);
    }
}
