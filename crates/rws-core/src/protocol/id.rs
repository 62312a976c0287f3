//! Message id generation.
//!
//! # What does an id look like? (for beginners)
//!
//! Every outgoing envelope carries an 18-digit decimal id built from the UTC
//! clock plus three random digits:
//!
//! ```text
//! YY MM DD HH mm ss SSS rrr
//! 21 01 29 16 31 29 492 100   →   210129163129492100
//! ```
//!
//! The timestamp part makes ids roughly sortable by creation time; the random
//! suffix keeps two clients that send in the same millisecond apart.  Within a
//! single process the generator also guarantees strictly increasing ids, so
//! two calls in the same millisecond never collide even if the random digits
//! happen to repeat.
//!
//! # Thread safety
//!
//! The last issued id lives in an `AtomicU64`; `next_id` uses a
//! compare-and-swap loop so it is lock-free and safe to call from any task.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Produces unique 18-digit message ids.
///
/// # Examples
///
/// ```rust
/// use rws_core::protocol::MessageIdGenerator;
///
/// let ids = MessageIdGenerator::new();
/// let a = ids.next_id();
/// let b = ids.next_id();
/// assert_eq!(a.to_string().len(), 18);
/// assert!(b > a);
/// ```
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    last: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id, strictly greater than any id this generator has
    /// returned before.
    pub fn next_id(&self) -> u64 {
        let candidate = compose_id(Utc::now(), random_suffix());
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = if candidate > prev { candidate } else { prev + 1 };
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Builds `YYMMDDHHmmssSSS * 1000 + suffix`.
///
/// `suffix` is reduced modulo 1000 and the milliseconds are clamped to 999
/// (chrono reports a leap second as 1000+ ms), so the result always has 18
/// digits for years 2010-2099.
pub fn compose_id(at: DateTime<Utc>, suffix: u16) -> u64 {
    let seconds = at.format("%y%m%d%H%M%S").to_string();
    // The format above only emits ASCII digits.
    let seconds: u64 = seconds.parse().unwrap_or_default();
    let millis = u64::from(at.timestamp_subsec_millis().min(999));
    (seconds * 1000 + millis) * 1000 + u64::from(suffix % 1000)
}

/// Three random decimal digits, taken from a v4 UUID.
fn random_suffix() -> u16 {
    let bytes = Uuid::new_v4().into_bytes();
    u16::from_be_bytes([bytes[0], bytes[1]]) % 1000
}
