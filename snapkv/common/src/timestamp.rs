//! Timestamps used for multi-version concurrency control.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A logical timestamp issued by the timestamp oracle.
///
/// The same domain is used for start timestamps (the version under which a
/// transaction writes, and the snapshot it reads) and commit timestamps.
/// `0` is reserved for sweep sentinels; real timestamps start from 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Timestamp of the placeholder version left behind by sweep.
    pub const SWEEP_SENTINEL: Timestamp = Timestamp(0);

    /// The smallest timestamp the oracle may hand out.
    pub const MIN: Timestamp = Timestamp(1);

    /// Upper bound used to read the latest version of a cell.
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Create a timestamp from its raw value.
    pub const fn with_ts(timestamp: u64) -> Self {
        Self(timestamp)
    }

    /// Returns the raw value of the timestamp.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Returns true if this is the sweep sentinel timestamp.
    pub const fn is_sweep_sentinel(&self) -> bool {
        self.0 == Self::SWEEP_SENTINEL.0
    }

    /// The timestamp immediately following this one, if any.
    pub fn checked_next(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    /// Big-endian encoding, which preserves ordering when used as a row key.
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
