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

use super::CongestionController;
use super::CongestionWindow;

/// Minimal slow start threshold in segments.
const MIN_SSTHRESH: u32 = 2;

/// Reno congestion control.
/// See RFC 5681.
#[derive(Debug, Default)]
pub struct Reno {}

impl Reno {
    pub fn new() -> Self {
        Self {}
    }
}

impl CongestionController for Reno {
    fn name(&self) -> &str {
        "RENO"
    }

    fn ssthresh(&self, _window: &CongestionWindow, in_flight: u32) -> u32 {
        cmp::max(in_flight >> 1, MIN_SSTHRESH)
    }

    fn cong_avoid(&mut self, window: &mut CongestionWindow, in_flight: u32) {
        // The window was not the limit, growing it proves nothing.
        if in_flight < window.cwnd {
            return;
        }

        if window.cwnd <= window.ssthresh {
            // Slow start.
            if window.cwnd < window.clamp {
                window.cwnd += 1;
            }
            return;
        }

        // Congestion avoidance: one segment per window.
        if window.cnt >= window.cwnd {
            if window.cwnd < window.clamp {
                window.cwnd += 1;
            }
            window.cnt = 0;
        } else {
            window.cnt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reno_ssthresh() {
        let reno = Reno::new();
        let w = CongestionWindow::new(10, u32::MAX);
        assert_eq!(reno.ssthresh(&w, 7), 3);
        assert_eq!(reno.ssthresh(&w, 20), 10);
        assert_eq!(reno.ssthresh(&w, 1), MIN_SSTHRESH);
        assert_eq!(reno.ssthresh(&w, 0), MIN_SSTHRESH);
    }

    #[test]
    fn reno_slow_start() {
        let mut reno = Reno::new();
        let mut w = CongestionWindow::new(2, 5);
        for _ in 0..10 {
            let in_flight = w.cwnd();
            reno.cong_avoid(&mut w, in_flight);
        }
        assert_eq!(w.cwnd(), 5);
    }

    #[test]
    fn reno_not_cwnd_limited() {
        let mut reno = Reno::new();
        let mut w = CongestionWindow::new(10, u32::MAX);
        reno.cong_avoid(&mut w, 9);
        assert_eq!(w.cwnd(), 10);

        w.ssthresh = 2;
        for _ in 0..20 {
            reno.cong_avoid(&mut w, 4);
        }
        assert_eq!(w.cwnd(), 10);
        assert_eq!(w.cnt, 0);

        reno.cong_avoid(&mut w, 10);
        assert_eq!(w.cnt, 1);
    }

    #[test]
    fn reno_congestion_avoidance() {
        let mut reno = Reno::new();
        let mut w = CongestionWindow::new(4, u32::MAX);
        w.ssthresh = 2;

        // cwnd + 1 ACKs are needed for one more segment.
        for _ in 0..4 {
            reno.cong_avoid(&mut w, 4);
            assert_eq!(w.cwnd(), 4);
        }
        reno.cong_avoid(&mut w, 4);
        assert_eq!(w.cwnd(), 5);
        assert_eq!(w.cnt, 0);
    }
}
