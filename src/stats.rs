//! Running pass/fail statistics for one monitoring session.
//!
//! Pass and fail counts share a single `AtomicU64` (high and low 32 bits),
//! so one `fetch_add` updates a counter and one `load` reads a snapshot.
//! `total` is derived, which keeps `total == pass + fail` in every snapshot.

use crate::inference::Verdict;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

const PASS_UNIT: u64 = 1 << 32;
const FAIL_UNIT: u64 = 1;
const HALF_MASK: u64 = 0xFFFF_FFFF;

/// Immutable statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: u64,
    pub pass: u64,
    pub fail: u64,
}

impl Statistics {
    /// Percentage of processed images classified PASS (0.0 when nothing was processed).
    pub fn yield_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.pass as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Debug, Default)]
pub struct StatisticsAggregator {
    packed: AtomicU64,
}

impl StatisticsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one classified image and return the snapshot that includes it.
    pub fn record(&self, verdict: Verdict) -> Statistics {
        let unit = match verdict {
            Verdict::Pass => PASS_UNIT,
            Verdict::Fail => FAIL_UNIT,
        };
        let previous = self.packed.fetch_add(unit, Ordering::AcqRel);
        unpack(previous.wrapping_add(unit))
    }

    pub fn snapshot(&self) -> Statistics {
        unpack(self.packed.load(Ordering::Acquire))
    }
}

fn unpack(packed: u64) -> Statistics {
    let pass = packed >> 32;
    let fail = packed & HALF_MASK;
    Statistics {
        total: pass + fail,
        pass,
        fail,
    }
}
