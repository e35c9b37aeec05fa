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

use core::str::FromStr;
use std::cmp;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use strum_macros::EnumIter;

use crate::Config;
use crate::Error;
use crate::Result;
pub use dummy::Dummy;
pub use reno::Reno;

/// Slow start threshold before any congestion event.
pub const INFINITE_SSTHRESH: u32 = 0x7fff_ffff;

/// Congestion avoidance state of a connection.
///
/// The order matters: states at or below `Disorder` have not reduced the
/// congestion window yet.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CaState {
    /// Nothing bad has been observed recently.
    #[default]
    Open = 0,

    /// Duplicate ACKs or SACKs arrived; watching for loss.
    Disorder = 1,

    /// The window is being reduced after a congestion notification (ECN or
    /// local congestion).
    Cwr = 2,

    /// Fast retransmit after loss was inferred from the scoreboard.
    Recovery = 3,

    /// A retransmission timeout fired or the receiver reneged on SACKs.
    Loss = 4,
}

/// Available congestion control algorithm
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionControlAlgorithm {
    /// Reno grows the window by one segment per ACK in slow start and by one
    /// segment per window in congestion avoidance, and halves it on loss.
    #[default]
    Reno,

    /// Dummy keeps the window static. It is intended to be used for testing
    /// and experiments.
    Dummy,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<CongestionControlAlgorithm> {
        if algor.eq_ignore_ascii_case("reno") {
            Ok(CongestionControlAlgorithm::Reno)
        } else if algor.eq_ignore_ascii_case("dummy") {
            Ok(CongestionControlAlgorithm::Dummy)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// Congestion window state in segments.
#[derive(Debug, Clone)]
pub struct CongestionWindow {
    /// Congestion window.
    pub(crate) cwnd: u32,

    /// Slow start threshold.
    pub(crate) ssthresh: u32,

    /// Upper bound of the congestion window.
    pub(crate) clamp: u32,

    /// Linear increase (and cwnd_down) counter.
    pub(crate) cnt: u32,

    /// Slow start threshold before the current reduction, zero if a reduction
    /// must not be undone.
    pub(crate) prior_ssthresh: u32,
}

impl CongestionWindow {
    pub fn new(initial_cwnd: u32, clamp: u32) -> Self {
        CongestionWindow {
            cwnd: cmp::min(cmp::max(initial_cwnd, 1), clamp),
            ssthresh: INFINITE_SSTHRESH,
            clamp,
            cnt: 0,
            prior_ssthresh: 0,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn clamp(&self) -> u32 {
        self.clamp
    }

    pub fn prior_ssthresh(&self) -> u32 {
        self.prior_ssthresh
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd <= self.ssthresh
    }

    /// The threshold worth remembering before a reduction. Outside of a
    /// reduction the current window is a better estimate than ssthresh.
    pub fn current_ssthresh(&self, state: CaState) -> u32 {
        match state {
            CaState::Cwr | CaState::Recovery => self.ssthresh,
            _ => cmp::max(self.ssthresh, (self.cwnd >> 1) + (self.cwnd >> 2)),
        }
    }

    /// Decrease the window by one segment every second ACK, never below
    /// half of ssthresh, and never more than one segment above what is in
    /// flight.
    pub fn cwnd_down(&mut self, in_flight: u32) {
        let mut decr = self.cnt + 1;
        let limit = self.ssthresh / 2;

        self.cnt = decr & 1;
        decr >>= 1;

        if decr > 0 && self.cwnd > limit {
            self.cwnd = self.cwnd.saturating_sub(decr).max(1);
        }
        self.cwnd = cmp::min(self.cwnd, in_flight + 1);
    }

    /// Prevent a burst larger than `max_burst` segments.
    pub fn moderate(&mut self, in_flight: u32, max_burst: u32) {
        self.cwnd = cmp::min(self.cwnd, in_flight.saturating_add(max_burst));
    }

    /// Finish a window reduction.
    pub fn complete_cwr(&mut self) {
        self.cwnd = cmp::min(self.cwnd, self.ssthresh);
    }

    /// Revert a window reduction. Return true if the previous slow start
    /// threshold was restored.
    pub fn undo(&mut self, restore_ssthresh: bool) -> bool {
        if self.prior_ssthresh == 0 {
            self.cwnd = cmp::max(self.cwnd, self.ssthresh);
            return false;
        }

        self.cwnd = cmp::max(self.cwnd, self.ssthresh.saturating_mul(2));
        if restore_ssthresh && self.prior_ssthresh > self.ssthresh {
            self.ssthresh = self.prior_ssthresh;
            return true;
        }
        false
    }

    /// Shrink the window after an idle period of `idle` milliseconds, halving
    /// it for every RTO elapsed.
    pub fn restart_after_idle(&mut self, idle: u32, rto: u32, restart_cwnd: u32, state: CaState) {
        self.ssthresh = self.current_ssthresh(state);

        let restart_cwnd = cmp::min(restart_cwnd, self.cwnd);
        let mut cwnd = self.cwnd;
        let mut delta = idle as i64;
        loop {
            delta -= cmp::max(rto, 1) as i64;
            if delta <= 0 || cwnd <= restart_cwnd {
                break;
            }
            cwnd >>= 1;
        }
        self.cwnd = cmp::max(cwnd, restart_cwnd);
    }
}

/// Congestion control interfaces shared by different algorithms.
///
/// The loss recovery state machine owns the window; the algorithm only
/// decides how it grows and where it restarts after congestion.
pub trait CongestionController {
    /// Name of congestion control algorithm.
    fn name(&self) -> &str;

    /// Slow start threshold to apply after a congestion event.
    fn ssthresh(&self, window: &CongestionWindow, in_flight: u32) -> u32;

    /// Grow the window on an ACK of new data.
    fn cong_avoid(&mut self, window: &mut CongestionWindow, in_flight: u32);
}

impl fmt::Debug for dyn CongestionController + Send {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "congestion controller {}.", self.name())
    }
}

/// Build a congestion controller.
pub fn build_congestion_controller(conf: &Config) -> Box<dyn CongestionController + Send> {
    match conf.congestion_control_algorithm {
        CongestionControlAlgorithm::Reno => Box::new(Reno::new()),
        CongestionControlAlgorithm::Dummy => Box::new(Dummy::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn congestion_control_name() {
        let cases = [
            ("reno", Ok(CongestionControlAlgorithm::Reno)),
            ("Reno", Ok(CongestionControlAlgorithm::Reno)),
            ("RENO", Ok(CongestionControlAlgorithm::Reno)),
            ("dummy", Ok(CongestionControlAlgorithm::Dummy)),
            ("DUMMY", Ok(CongestionControlAlgorithm::Dummy)),
            ("cubci", Err(Error::InvalidConfig("unknown".into()))),
        ];

        for (name, algor) in cases {
            assert_eq!(CongestionControlAlgorithm::from_str(name), algor);
        }

        let mut conf = Config::default();
        assert_eq!(build_congestion_controller(&conf).name(), "RENO");
        conf.set_congestion_control_algorithm(CongestionControlAlgorithm::Dummy);
        assert_eq!(build_congestion_controller(&conf).name(), "DUMMY");
    }

    #[test]
    fn ca_state_order() {
        assert!(CaState::Open < CaState::Disorder);
        assert!(CaState::Disorder < CaState::Cwr);
        assert!(CaState::Cwr < CaState::Recovery);
        assert!(CaState::Recovery < CaState::Loss);
        assert_eq!(CaState::Recovery.to_string(), "recovery");
        assert_eq!(CaState::default(), CaState::Open);
    }

    #[test]
    fn window_current_ssthresh() {
        let mut w = CongestionWindow::new(10, u32::MAX);
        assert!(w.in_slow_start());
        w.ssthresh = 4;
        assert_eq!(w.current_ssthresh(CaState::Open), 7);
        assert_eq!(w.current_ssthresh(CaState::Disorder), 7);
        assert_eq!(w.current_ssthresh(CaState::Recovery), 4);
        assert_eq!(w.current_ssthresh(CaState::Cwr), 4);
        w.ssthresh = 20;
        assert_eq!(w.current_ssthresh(CaState::Loss), 20);
    }

    #[test]
    fn window_cwnd_down() {
        let mut w = CongestionWindow::new(20, u32::MAX);
        w.ssthresh = 10;

        // One segment off every second call.
        w.cwnd_down(100);
        assert_eq!(w.cwnd(), 20);
        w.cwnd_down(100);
        assert_eq!(w.cwnd(), 19);
        w.cwnd_down(100);
        assert_eq!(w.cwnd(), 19);
        w.cwnd_down(100);
        assert_eq!(w.cwnd(), 18);

        // Never more than one above in flight.
        w.cwnd_down(7);
        assert_eq!(w.cwnd(), 8);

        // Not below ssthresh / 2.
        w.cwnd = 5;
        for _ in 0..10 {
            w.cwnd_down(100);
        }
        assert_eq!(w.cwnd(), 5);
    }

    #[test]
    fn window_moderate_and_complete() {
        let mut w = CongestionWindow::new(20, u32::MAX);
        w.moderate(10, 3);
        assert_eq!(w.cwnd(), 13);
        w.moderate(20, 3);
        assert_eq!(w.cwnd(), 13);

        w.ssthresh = 8;
        w.complete_cwr();
        assert_eq!(w.cwnd(), 8);
    }

    #[test]
    fn window_undo() {
        let mut w = CongestionWindow::new(4, u32::MAX);
        w.ssthresh = 5;
        w.prior_ssthresh = 12;
        assert!(w.undo(true));
        assert_eq!(w.cwnd(), 10);
        assert_eq!(w.ssthresh(), 12);

        // Partial undo keeps the reduced threshold.
        let mut w = CongestionWindow::new(4, u32::MAX);
        w.ssthresh = 5;
        w.prior_ssthresh = 12;
        assert!(!w.undo(false));
        assert_eq!(w.cwnd(), 10);
        assert_eq!(w.ssthresh(), 5);

        // Nothing to restore.
        let mut w = CongestionWindow::new(4, u32::MAX);
        w.ssthresh = 5;
        assert!(!w.undo(true));
        assert_eq!(w.cwnd(), 5);
    }

    #[test]
    fn window_restart_after_idle() {
        let mut w = CongestionWindow::new(40, u32::MAX);
        w.restart_after_idle(350, 100, 4, CaState::Open);
        // Halved once per full RTO: 40 -> 20 -> 10 -> 5.
        assert_eq!(w.cwnd(), 5);
        assert_eq!(w.ssthresh(), INFINITE_SSTHRESH);

        let mut w = CongestionWindow::new(40, u32::MAX);
        w.ssthresh = 10;
        w.restart_after_idle(10_000, 100, 4, CaState::Open);
        assert_eq!(w.cwnd(), 4);
        assert_eq!(w.ssthresh(), 30);
    }
}

mod dummy;
mod reno;
