use std::fmt;

use bson::{Bson, Timestamp};
use serde::{Deserialize, Serialize};

/// Cluster-wide logical timestamp: wall-clock seconds plus an increment that
/// orders writes within the same second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LogicalTime {
    pub secs: u32,
    pub inc: u32,
}

impl LogicalTime {
    pub const ZERO: LogicalTime = LogicalTime { secs: 0, inc: 0 };
    pub const MAX: LogicalTime = LogicalTime {
        secs: u32::MAX,
        inc: u32::MAX,
    };

    pub const fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// The greatest time strictly below `self`, saturating at zero.
    pub fn prev(self) -> Self {
        if self.inc > 0 {
            Self::new(self.secs, self.inc - 1)
        } else if self.secs > 0 {
            Self::new(self.secs - 1, u32::MAX)
        } else {
            Self::ZERO
        }
    }

    /// The least time strictly above `self`, saturating at `MAX`.
    pub fn next(self) -> Self {
        if self.inc < u32::MAX {
            Self::new(self.secs, self.inc + 1)
        } else if self.secs < u32::MAX {
            Self::new(self.secs + 1, 0)
        } else {
            Self::MAX
        }
    }

    pub fn to_bson(self) -> Bson {
        Bson::Timestamp(Timestamp {
            time: self.secs,
            increment: self.inc,
        })
    }

    pub fn from_bson(value: &Bson) -> Option<Self> {
        match value {
            Bson::Timestamp(ts) => Some(Self::new(ts.time, ts.increment)),
            _ => None,
        }
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}
