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
use std::time::Duration;

use crate::seqnum::SeqNum;

/// RTT estimation for a TCP connection.
///
/// All values are in milliseconds. The smoothed RTT is kept scaled by 8 and
/// the mean deviation scaled by 4, following Jacobson's fixed point scheme.
/// See RFC 6298 and "Congestion Avoidance and Control" (Jacobson, 1988).
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed RTT scaled by 8. Zero until the first sample is taken.
    srtt: u32,

    /// Mean deviation scaled by 4.
    mdev: u32,

    /// Maximal mdev observed during the last RTT window.
    mdev_max: u32,

    /// Smoothed mdev_max. It is raised immediately and relaxed once per RTT
    /// window.
    rttvar: u32,

    /// Sequence number marking the end of the current RTT window.
    rtt_seq: SeqNum,

    /// Current retransmission timeout.
    rto: u32,

    /// Lower bound of the retransmission timeout.
    rto_min: u32,

    /// Upper bound of the retransmission timeout.
    rto_max: u32,

    /// The most recent RTT sample.
    latest_rtt: u32,

    /// The minimum RTT observed.
    min_rtt: u32,
}

impl RttEstimator {
    pub fn new(rto_initial: u32, rto_min: u32, rto_max: u32) -> Self {
        Self {
            srtt: 0,
            mdev: 0,
            mdev_max: 0,
            rttvar: 0,
            rtt_seq: SeqNum(0),
            rto: rto_initial.clamp(rto_min, rto_max),
            rto_min,
            rto_max,
            latest_rtt: 0,
            min_rtt: u32::MAX,
        }
    }

    /// Whether at least one RTT sample has been taken.
    pub fn has_sample(&self) -> bool {
        self.srtt != 0
    }

    /// Feed a round trip measurement in milliseconds.
    ///
    /// `snd_una` and `snd_nxt` delimit the send window the sample was taken
    /// in; they drive the once-per-RTT relaxation of `rttvar`.
    pub fn update(&mut self, sample: u32, snd_una: SeqNum, snd_nxt: SeqNum) {
        // A zero sample is possible with coarse clocks. Treat it as the
        // smallest measurable unit.
        let sample = cmp::max(sample, 1);
        self.latest_rtt = sample;
        self.min_rtt = cmp::min(self.min_rtt, sample);

        if self.srtt == 0 {
            self.srtt = sample.saturating_mul(8);
            self.mdev = sample.saturating_mul(4);
            self.mdev_max = cmp::max(self.mdev, self.rto_min);
            self.rttvar = self.mdev_max;
            self.rtt_seq = snd_nxt;
            return;
        }

        // Error of the current estimate.
        let mut m = sample as i64 - (self.srtt >> 3) as i64;
        self.srtt = (self.srtt as i64 + m).max(8) as u32;

        if m < 0 {
            m = -m - (self.mdev >> 2) as i64;
            // The RTT decreased. Use a finer gain so that a sudden drop does
            // not inflate the deviation and with it the timeout.
            if m > 0 {
                m >>= 3;
            }
        } else {
            m -= (self.mdev >> 2) as i64;
        }
        self.mdev = (self.mdev as i64 + m).max(0) as u32;

        if self.mdev > self.mdev_max {
            self.mdev_max = self.mdev;
            if self.mdev_max > self.rttvar {
                self.rttvar = self.mdev_max;
            }
        }

        if snd_una.after(self.rtt_seq) {
            if self.mdev_max < self.rttvar {
                self.rttvar -= (self.rttvar - self.mdev_max) >> 2;
            }
            self.rtt_seq = snd_nxt;
            self.mdev_max = self.rto_min;
        }
    }

    /// Recompute the retransmission timeout from the current estimate.
    pub fn compute_rto(&mut self) -> u32 {
        let rto = (self.srtt >> 3).saturating_add(self.rttvar);
        self.rto = rto.clamp(self.rto_min, self.rto_max);
        self.rto
    }

    /// Double the retransmission timeout after an expiry.
    pub fn backoff(&mut self) {
        self.rto = cmp::min(self.rto.saturating_mul(2), self.rto_max);
    }

    /// Current retransmission timeout in milliseconds.
    pub fn rto(&self) -> u32 {
        self.rto
    }

    /// Lower bound of the retransmission timeout in milliseconds.
    pub fn rto_min(&self) -> u32 {
        self.rto_min
    }

    /// Upper bound of the retransmission timeout in milliseconds.
    pub fn rto_max(&self) -> u32 {
        self.rto_max
    }

    /// Return the smoothed RTT scaled by 8.
    pub fn srtt(&self) -> u32 {
        self.srtt
    }

    /// Return the mean deviation scaled by 4.
    pub fn mdev(&self) -> u32 {
        self.mdev
    }

    pub fn mdev_max(&self) -> u32 {
        self.mdev_max
    }

    pub fn rttvar(&self) -> u32 {
        self.rttvar
    }

    /// Return the latest rtt sample.
    pub fn latest_rtt(&self) -> Duration {
        Duration::from_millis(self.latest_rtt as u64)
    }

    /// Return the current best RTT estimation.
    pub fn smoothed_rtt(&self) -> Duration {
        Duration::from_millis((self.srtt >> 3) as u64)
    }

    /// Return the minimum RTT observed so far.
    pub fn min_rtt(&self) -> Option<Duration> {
        if self.min_rtt == u32::MAX {
            return None;
        }
        Some(Duration::from_millis(self.min_rtt as u64))
    }

    /// Return the retransmission timeout as a duration.
    pub fn rto_duration(&self) -> Duration {
        Duration::from_millis(self.rto as u64)
    }
}
