//! Logical time for the Cadence RTI
//!
//! A tag is a pair (time, microstep) ordered lexicographically. Time is in
//! nanoseconds; the microstep orders events that share a time value.
//!
//! Delays are themselves tags. Adding a delay follows the superdense time
//! rule:
//! - a positive time delay lands on microstep `delay.microstep` of the new time
//! - a zero time delay only advances the microstep
//!
//! All arithmetic saturates at [`Tag::FOREVER`], and [`Tag::NEVER`] is absorbing.

use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Physical or logical time interval in nanoseconds
pub type Interval = i64;

/// Physical time instant in nanoseconds since the epoch
pub type Instant = i64;

/// Encoded size of a tag on the wire: i64 time + u32 microstep
pub const TAG_SIZE: usize = 12;

pub const NSEC_PER_USEC: Interval = 1_000;
pub const NSEC_PER_MSEC: Interval = 1_000_000;
pub const NSEC_PER_SEC: Interval = 1_000_000_000;

/// Logical tag
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub time: Instant,
    pub microstep: u32,
}

impl Tag {
    /// Smaller than every other tag
    pub const NEVER: Tag = Tag {
        time: i64::MIN,
        microstep: 0,
    };

    /// Larger than every other tag
    pub const FOREVER: Tag = Tag {
        time: i64::MAX,
        microstep: u32::MAX,
    };

    pub const ZERO: Tag = Tag {
        time: 0,
        microstep: 0,
    };

    #[inline]
    pub const fn new(time: Instant, microstep: u32) -> Self {
        Tag { time, microstep }
    }

    /// Delay tag of a connection.
    ///
    /// `None` is a connection without an `after` clause (same tag), `Some(0)`
    /// is `after 0` (one microstep later), and a positive interval shifts time.
    pub fn from_connection_delay(after: Option<Interval>) -> Self {
        match after {
            None => Tag::ZERO,
            Some(d) if d <= 0 => Tag::new(0, 1),
            Some(d) => Tag::new(d, 0),
        }
    }

    #[inline]
    pub fn is_never(self) -> bool {
        self == Tag::NEVER
    }

    #[inline]
    pub fn is_forever(self) -> bool {
        self == Tag::FOREVER
    }

    /// Add a delay tag, saturating at FOREVER.
    pub fn delay(self, delay: Tag) -> Tag {
        if self.is_never() || delay.is_never() {
            return Tag::NEVER;
        }
        if self.time == i64::MAX || delay.time == i64::MAX {
            return Tag::FOREVER;
        }
        if delay.time > 0 {
            match self.time.checked_add(delay.time) {
                Some(time) if time < i64::MAX => Tag::new(time, delay.microstep),
                _ => Tag::FOREVER,
            }
        } else {
            match self.microstep.checked_add(delay.microstep) {
                Some(microstep) => Tag::new(self.time, microstep),
                None => Tag::FOREVER,
            }
        }
    }

    /// The smallest tag strictly greater than `self`.
    pub fn successor(self) -> Tag {
        if self.is_never() || self.is_forever() {
            return self;
        }
        match self.microstep.checked_add(1) {
            Some(microstep) => Tag::new(self.time, microstep),
            None => Tag::new(self.time.saturating_add(1), 0),
        }
    }

    /// Time elapsed since `start`, saturating at the tag sentinels.
    pub fn elapsed_since(self, start: Instant) -> Interval {
        match self {
            Tag::NEVER => i64::MIN,
            Tag::FOREVER => i64::MAX,
            _ => self.time.saturating_sub(start),
        }
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; TAG_SIZE] {
        let mut out = [0u8; TAG_SIZE];
        out[..8].copy_from_slice(&self.time.to_le_bytes());
        out[8..].copy_from_slice(&self.microstep.to_le_bytes());
        out
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; TAG_SIZE]) -> Self {
        let mut buf = &bytes[..];
        Tag::read_from(&mut buf)
    }

    /// Append the wire encoding to `buf`
    #[inline]
    pub fn write_to(self, buf: &mut impl BufMut) {
        buf.put_i64_le(self.time);
        buf.put_u32_le(self.microstep);
    }

    /// Consume a wire-encoded tag. The caller checks that TAG_SIZE bytes remain.
    #[inline]
    pub fn read_from(buf: &mut impl Buf) -> Self {
        let time = buf.get_i64_le();
        let microstep = buf.get_u32_le();
        Tag { time, microstep }
    }
}

impl Default for Tag {
    fn default() -> Self {
        Tag::NEVER
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Tag::NEVER => write!(f, "(NEVER)"),
            Tag::FOREVER => write!(f, "(FOREVER)"),
            Tag { time, microstep } => write!(f, "({}, {})", time, microstep),
        }
    }
}
