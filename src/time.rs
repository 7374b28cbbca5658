//! Fixed point time values used for every decoded timestamp.
//!
//! Conversions through `f64` lose precision once the seconds part grows past
//! roughly 2^23 seconds, since the nanoseconds eat about 30 bits of the
//! mantissa. `mul_f64` and `div_f64` go through those conversions and share
//! the limitation.

use serde_derive::Serialize;
use std::fmt;
use std::ops::Add;
use std::ops::Sub;

pub const NANOSECONDS_PER_SECOND: u32 = 1_000_000_000;

/// A point in time (or a duration), as seconds plus nanoseconds.
///
/// Field order matters: the derived ordering is seconds-major.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LttTime {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl LttTime {
    pub const ZERO: Self = Self {
        seconds: 0,
        nanoseconds: 0,
    };

    /// Larger than any time a trace can contain.
    pub const INFINITE: Self = Self {
        seconds: u64::MAX,
        nanoseconds: NANOSECONDS_PER_SECOND - 1,
    };

    /// Create a time, carrying excess nanoseconds into the seconds.
    /// Saturates at [`LttTime::INFINITE`].
    pub const fn new(seconds: u64, nanoseconds: u32) -> Self {
        match seconds.checked_add((nanoseconds / NANOSECONDS_PER_SECOND) as u64) {
            Some(seconds) => Self {
                seconds,
                nanoseconds: nanoseconds % NANOSECONDS_PER_SECOND,
            },
            None => Self::INFINITE,
        }
    }

    pub const fn from_u64(nanoseconds: u64) -> Self {
        Self {
            seconds: nanoseconds / NANOSECONDS_PER_SECOND as u64,
            nanoseconds: (nanoseconds % NANOSECONDS_PER_SECOND as u64) as u32,
        }
    }

    /// Total nanosecond count. Saturates for times past year ~2554.
    pub fn to_u64(self) -> u64 {
        self.seconds
            .saturating_mul(u64::from(NANOSECONDS_PER_SECOND))
            .saturating_add(u64::from(self.nanoseconds))
    }

    /// Build a time from a nanosecond count that may exceed `u64`.
    pub(crate) fn from_u128(nanoseconds: u128) -> Self {
        let per_second = u128::from(NANOSECONDS_PER_SECOND);
        let seconds = nanoseconds / per_second;
        if seconds > u128::from(u64::MAX) {
            return Self::INFINITE;
        }
        Self {
            seconds: seconds as u64,
            nanoseconds: (nanoseconds % per_second) as u32,
        }
    }

    pub fn to_f64(self) -> f64 {
        self.seconds as f64 + f64::from(self.nanoseconds) / f64::from(NANOSECONDS_PER_SECOND)
    }

    /// Negative and NaN inputs give [`LttTime::ZERO`].
    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() || value <= 0.0 {
            return Self::ZERO;
        }
        let seconds = value.trunc();
        let nanoseconds = ((value - seconds) * f64::from(NANOSECONDS_PER_SECOND)) as u32;
        Self::new(seconds as u64, nanoseconds.min(NANOSECONDS_PER_SECOND - 1))
    }

    pub fn mul_f64(self, factor: f64) -> Self {
        if factor == 0.0 {
            return Self::ZERO;
        }
        Self::from_f64(self.to_f64() * factor)
    }

    pub fn div_f64(self, divisor: f64) -> Self {
        Self::from_f64(self.to_f64() / divisor)
    }

    /// Subtraction clamped at zero.
    pub fn saturating_sub(self, other: Self) -> Self {
        if self <= other {
            return Self::ZERO;
        }
        if self.nanoseconds < other.nanoseconds {
            Self {
                seconds: self.seconds - other.seconds - 1,
                nanoseconds: NANOSECONDS_PER_SECOND + self.nanoseconds - other.nanoseconds,
            }
        } else {
            Self {
                seconds: self.seconds - other.seconds,
                nanoseconds: self.nanoseconds - other.nanoseconds,
            }
        }
    }

    pub fn saturating_add(self, other: Self) -> Self {
        let mut nanoseconds = self.nanoseconds + other.nanoseconds;
        let mut carry = 0;
        if nanoseconds >= NANOSECONDS_PER_SECOND {
            nanoseconds -= NANOSECONDS_PER_SECOND;
            carry = 1;
        }
        match self
            .seconds
            .checked_add(other.seconds)
            .and_then(|s| s.checked_add(carry))
        {
            Some(seconds) => Self {
                seconds,
                nanoseconds,
            },
            None => Self::INFINITE,
        }
    }
}

impl Add for LttTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl Sub for LttTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl fmt::Display for LttTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanoseconds)
    }
}
