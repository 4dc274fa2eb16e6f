//! A Countdown-Latch, which blocks Waiters until a Number of outstanding
//! Work-Items have been completed
//!
//! # Example
//! ```rust
//! # use memsync::latch::CountdownLatch;
//! # use std::sync::Arc;
//! let latch = Arc::new(CountdownLatch::new(2));
//!
//! for _ in 0..2 {
//!     let c_latch = latch.clone();
//!     std::thread::spawn(move || {
//!         c_latch.release().unwrap();
//!     });
//! }
//!
//! latch.wait();
//! assert_eq!(0, latch.outstanding());
//! ```

use std::{
    fmt::Debug,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// The Misuses detected by the Latch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LatchError {
    /// New Work was referenced after the Latch already fired
    #[error("the latch already reached zero")]
    AlreadyReleased,
    /// More Work was released than was ever referenced
    #[error("released a latch that is already at zero")]
    Underflow,
}

/// The Latch
pub struct CountdownLatch {
    outstanding: Mutex<usize>,
    zero: Condvar,
}

impl CountdownLatch {
    /// Creates a new Latch that fires after `count` Releases.
    ///
    /// A negative Count is treated like zero, so the Latch starts out fired.
    pub fn new(count: isize) -> Self {
        Self {
            outstanding: Mutex::new(count.max(0) as usize),
            zero: Condvar::new(),
        }
    }

    /// Restarts the Latch with a new Count, waking all current Waiters if the
    /// Count is zero or less
    pub fn reset(&self, count: isize) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = count.max(0) as usize;

        if *outstanding == 0 {
            self.zero.notify_all();
        }
    }

    /// Adds another outstanding Work-Item
    ///
    /// # Errors
    /// [`LatchError::AlreadyReleased`] if the Latch already fired, since the
    /// Waiters may already be gone at that Point
    pub fn reference(&self) -> Result<(), LatchError> {
        let mut outstanding = self.outstanding.lock();
        if *outstanding == 0 {
            return Err(LatchError::AlreadyReleased);
        }

        *outstanding += 1;
        Ok(())
    }

    /// Marks one Work-Item as completed, waking all Waiters once none are
    /// outstanding anymore
    pub fn release(&self) -> Result<(), LatchError> {
        let mut outstanding = self.outstanding.lock();
        if *outstanding == 0 {
            return Err(LatchError::Underflow);
        }

        *outstanding -= 1;
        if *outstanding == 0 {
            self.zero.notify_all();
        }

        Ok(())
    }

    /// Blocks until no Work-Items are outstanding
    pub fn wait(&self) {
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            self.zero.wait(&mut outstanding);
        }
    }

    /// Blocks until no Work-Items are outstanding or the Timeout expires
    ///
    /// # Returns
    /// Whether or not the Latch fired
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            if self.zero.wait_until(&mut outstanding, deadline).timed_out() {
                return *outstanding == 0;
            }
        }

        true
    }

    /// The Number of outstanding Work-Items, this may already be outdated
    /// once it returns
    pub fn outstanding(&self) -> usize {
        *self.outstanding.lock()
    }
}

impl Debug for CountdownLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CountdownLatch (outstanding: {})", self.outstanding())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn negative_count_fires() {
        let latch = CountdownLatch::new(-3);

        assert_eq!(0, latch.outstanding());
        assert!(latch.wait_for(Duration::from_millis(1)));
    }

    #[test]
    fn reference_release() {
        let latch = CountdownLatch::new(1);

        assert_eq!(Ok(()), latch.reference());
        assert_eq!(2, latch.outstanding());
        assert_eq!(Ok(()), latch.release());
        assert_eq!(Ok(()), latch.release());
        assert_eq!(0, latch.outstanding());
    }

    #[test]
    fn misuse() {
        let latch = CountdownLatch::new(0);

        assert_eq!(Err(LatchError::AlreadyReleased), latch.reference());
        assert_eq!(Err(LatchError::Underflow), latch.release());
    }

    #[test]
    fn times_out_with_missing_release() {
        let latch = CountdownLatch::new(3);
        latch.release().unwrap();
        latch.release().unwrap();

        assert!(!latch.wait_for(Duration::from_millis(20)));
        assert_eq!(1, latch.outstanding());
    }

    #[test]
    fn reset_restarts() {
        let latch = CountdownLatch::new(1);
        latch.release().unwrap();

        latch.reset(2);
        assert_eq!(2, latch.outstanding());
        assert_eq!(Ok(()), latch.reference());
    }

    #[test]
    fn three_releasers_one_waiter() {
        let latch = Arc::new(CountdownLatch::new(3));
        let done = Arc::new(AtomicBool::new(false));

        let c_latch = latch.clone();
        let c_done = done.clone();
        let waiter = std::thread::spawn(move || {
            c_latch.wait();
            c_done.store(true, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let c_latch = latch.clone();
                std::thread::spawn(move || {
                    c_latch.release().unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        waiter.join().unwrap();

        assert!(done.load(Ordering::SeqCst));
        assert_eq!(0, latch.outstanding());
    }

    #[test]
    fn waiter_blocks_until_last_release() {
        let latch = Arc::new(CountdownLatch::new(1));
        let done = Arc::new(AtomicBool::new(false));

        let c_latch = latch.clone();
        let c_done = done.clone();
        let waiter = std::thread::spawn(move || {
            c_latch.wait();
            c_done.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(20));
        assert!(!done.load(Ordering::SeqCst));

        latch.release().unwrap();
        waiter.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }
}
