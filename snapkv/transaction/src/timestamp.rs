//! Timestamp issuance for the in-memory timestamp oracle.
//!
//! Timestamps are strictly increasing and never reused. `0` is reserved for
//! sweep sentinels, so the generator starts from [`Timestamp::MIN`].

use std::sync::atomic::{AtomicU64, Ordering};

pub use snapkv_common::Timestamp;

use crate::error::TimestampError;

/// Monotonic timestamp generator.
pub struct TimestampGenerator {
    counter: AtomicU64,
}

impl TimestampGenerator {
    /// Create a new timestamp generator
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(Timestamp::MIN.raw()),
        }
    }

    /// Generate the next timestamp
    pub fn next(&self) -> Result<Timestamp, TimestampError> {
        let mut cur = self.counter.load(Ordering::SeqCst);
        loop {
            // `MAX` stays free as the "latest version" read bound.
            if cur >= Timestamp::MAX.raw() {
                return Err(TimestampError::Overflow(cur));
            }
            match self.counter.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(Timestamp::with_ts(cur)),
                Err(actual) => cur = actual,
            }
        }
    }

    /// The next timestamp that will be handed out, without consuming it.
    pub fn current(&self) -> Timestamp {
        Timestamp::with_ts(self.counter.load(Ordering::SeqCst))
    }
}

impl Default for TimestampGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_timestamp_generator() {
        let generator = TimestampGenerator::new();
        assert_eq!(generator.current().raw(), 1);

        let ts1 = generator.next().unwrap();
        assert_eq!(ts1.raw(), 1);
        assert_eq!(generator.current().raw(), 2);

        let ts2 = generator.next().unwrap();
        assert_eq!(ts2.raw(), 2);
        assert_eq!(generator.current().raw(), 3);
    }

    #[test]
    fn test_overflow() {
        let generator = TimestampGenerator {
            counter: AtomicU64::new(u64::MAX - 1),
        };
        assert_eq!(generator.next().unwrap().raw(), u64::MAX - 1);
        assert!(matches!(generator.next(), Err(TimestampError::Overflow(_))));
    }

    #[test]
    fn test_concurrent_timestamps_are_unique() {
        let generator = Arc::new(TimestampGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                thread::spawn(move || {
                    (0..1000)
                        .map(|_| generator.next().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for ts in handle.join().unwrap() {
                assert!(seen.insert(ts));
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
