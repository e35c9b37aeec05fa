// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cmp;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Evidence that revealed network reordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReorderSource {
    /// A timestamp proved a presumed loss was only delayed.
    Timestamp,

    /// More duplicate ACKs arrived than segments were outstanding.
    Reno,

    /// A SACK filled a hole below the forward-most SACKed segment.
    Sack,

    /// As `Sack`, while FACK accounting was in use.
    Fack,
}

/// Tracks how far segments may be displaced before a gap is taken as loss.
#[derive(Clone, Debug)]
pub struct ReorderingEstimator {
    /// Current loss detection threshold in segments.
    reordering: u32,

    /// Initial threshold, also the ceiling applied after a timeout.
    default: u32,

    /// Upper bound of the threshold.
    max: u32,

    /// Whether forward acknowledgment may be trusted. Cleared for good once
    /// reordering is observed.
    fack: bool,
}

impl ReorderingEstimator {
    pub fn new(default: u32, max: u32, fack: bool) -> Self {
        let max = cmp::max(max, default);
        ReorderingEstimator {
            reordering: default,
            default,
            max,
            fack,
        }
    }

    /// Current reordering threshold.
    pub fn value(&self) -> u32 {
        self.reordering
    }

    pub fn default_value(&self) -> u32 {
        self.default
    }

    pub fn fack_enabled(&self) -> bool {
        self.fack
    }

    pub(crate) fn disable_fack(&mut self) {
        self.fack = false;
    }

    /// Classify the evidence according to the loss accounting in use.
    pub fn source(&self, sack: bool, timestamp: bool) -> ReorderSource {
        if timestamp {
            ReorderSource::Timestamp
        } else if !sack {
            ReorderSource::Reno
        } else if self.fack {
            ReorderSource::Fack
        } else {
            ReorderSource::Sack
        }
    }

    /// Raise the threshold to `metric` if it is larger. Return the previous
    /// value when the threshold changed.
    pub fn update(&mut self, metric: u32) -> Option<u32> {
        if metric <= self.reordering {
            return None;
        }

        let old = self.reordering;
        self.reordering = cmp::min(self.max, metric);

        // Reordering makes the forward-most SACK a poor loss indicator.
        self.fack = false;

        if self.reordering == old {
            return None;
        }
        Some(old)
    }

    /// After a retransmission timeout, do not keep a threshold above the
    /// default.
    pub fn reset_on_loss(&mut self) {
        self.reordering = cmp::min(self.reordering, self.default);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reordering_update() {
        let mut r = ReorderingEstimator::new(3, 127, true);
        assert_eq!(r.value(), 3);
        assert!(r.fack_enabled());

        assert_eq!(r.update(2), None);
        assert_eq!(r.update(3), None);
        assert!(r.fack_enabled());

        assert_eq!(r.update(6), Some(3));
        assert_eq!(r.value(), 6);
        assert!(!r.fack_enabled());
    }

    #[test]
    fn reordering_clamped() {
        let mut r = ReorderingEstimator::new(3, 127, false);
        assert_eq!(r.update(1000), Some(3));
        assert_eq!(r.value(), 127);
        assert_eq!(r.update(2000), None);
        assert_eq!(r.value(), 127);

        r.reset_on_loss();
        assert_eq!(r.value(), 3);
    }

    #[test]
    fn reordering_source() {
        let mut r = ReorderingEstimator::new(3, 127, true);
        assert_eq!(r.source(true, true), ReorderSource::Timestamp);
        assert_eq!(r.source(false, false), ReorderSource::Reno);
        assert_eq!(r.source(true, false), ReorderSource::Fack);
        r.disable_fack();
        assert_eq!(r.source(true, false), ReorderSource::Sack);
        assert_eq!(ReorderSource::Fack.to_string(), "fack");
    }
}
