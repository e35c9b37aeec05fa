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

//! tcp-recovery is the reliable delivery and congestion control engine of a
//! TCP sender.
//!
//! Given the stream of ACK segments received on an established connection,
//! it estimates the round-trip time, keeps a SACK scoreboard of the
//! outstanding segments, runs the congestion avoidance state machine (Open,
//! Disorder, CWR, Recovery and Loss) including the undo of window reductions
//! that turn out to be spurious, and decides which segments to retransmit.
//!
//! ## Features
//!
//! * **SACK scoreboard**: selective and duplicate SACK processing, FACK loss
//!   accounting and Reno duplicate ACK emulation for peers without SACK.
//! * **Spurious retransmission undo**: full, partial, D-SACK and loss undo
//!   based on timestamps and duplicate SACKs.
//! * **Reordering detection**: the duplicate threshold adapts to the
//!   reordering observed on the path.
//! * **Observability**: detailed statistics, `log` tracing and optional qlog
//!   output.
//!
//! ## Get started
//!
//! Create a [`Recovery`] per connection, report every transmitted segment
//! with [`Recovery::on_segment_sent`], feed every incoming ACK to
//! [`Recovery::on_ack`], and call [`Recovery::on_timeout`] when the deadline
//! returned by [`Recovery::timeout`] expires. Retransmissions are requested
//! through a [`RetransmitHandler`] supplied by the caller.

use std::cmp;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationMilliSeconds;

/// Default maximum segment size in bytes.
pub const DEFAULT_MSS: u32 = 1460;

/// Minimal maximum segment size in bytes.
pub const MIN_MSS: u32 = 88;

/// Initial reordering threshold. It is also the number of duplicate ACKs
/// that triggers fast retransmit.
pub const DEFAULT_REORDERING: u32 = 3;

/// Upper bound of the reordering threshold.
pub const MAX_REORDERING: u32 = 127;

/// Lower bound of the retransmission timeout.
pub const RTO_MIN: Duration = Duration::from_millis(200);

/// Upper bound of the retransmission timeout.
pub const RTO_MAX: Duration = Duration::from_secs(120);

/// Retransmission timeout before any RTT sample.
pub const RTO_INITIAL: Duration = Duration::from_secs(3);

/// Maximum number of quick ACKs the receiver side sends after loss.
pub const MAX_QUICKACKS: u32 = 16;

/// Maximum number of segments sent back to back after a window undo.
pub const MAX_BURST: u32 = 3;

/// Interval used to retry when the local sender is out of resources.
pub const RESOURCE_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum exponent of the timer backoff.
pub const MAX_BACKOFF: u32 = 15;

/// A specialized [`Result`] type for tcp-recovery operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// Configurations about loss recovery and congestion control.
///
/// The configuration is immutable once a [`Recovery`] has been created from
/// it.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum segment size in bytes.
    mss: u32,

    /// Initial congestion window in segments, zero to derive it from the MSS.
    initial_congestion_window: u32,

    /// Upper bound of the congestion window in segments.
    cwnd_clamp: u32,

    /// Initial reordering threshold in segments.
    reordering: u32,

    /// Upper bound of the reordering threshold in segments.
    max_reordering: u32,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    rto_min: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    rto_max: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    rto_initial: Duration,

    /// Maximum number of quick ACKs.
    max_quickacks: u32,

    /// Maximum burst in segments allowed after an undo.
    max_burst: u32,

    /// Use the SACK scoreboard if the peer permits it.
    enable_sack: bool,

    /// Use forward acknowledgment loss accounting.
    enable_fack: bool,

    /// Trust duplicate SACK reports for undo.
    enable_dsack: bool,

    /// React to ECN-Echo.
    enable_ecn: bool,

    /// Restart from the initial window after an idle period.
    slow_start_after_idle: bool,

    /// Congestion control algorithm.
    pub(crate) congestion_control_algorithm: CongestionControlAlgorithm,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            mss: DEFAULT_MSS,
            initial_congestion_window: 0,
            cwnd_clamp: u32::MAX,
            reordering: DEFAULT_REORDERING,
            max_reordering: MAX_REORDERING,
            rto_min: RTO_MIN,
            rto_max: RTO_MAX,
            rto_initial: RTO_INITIAL,
            max_quickacks: MAX_QUICKACKS,
            max_burst: MAX_BURST,
            enable_sack: true,
            enable_fack: true,
            enable_dsack: true,
            enable_ecn: false,
            slow_start_after_idle: true,
            congestion_control_algorithm: CongestionControlAlgorithm::Reno,
        }
    }
}

impl Config {
    /// Create default configuration.
    pub fn new() -> Result<Config> {
        Ok(Config::default())
    }

    /// Load a configuration from JSON. Missing fields take their default
    /// values.
    pub fn from_json(json: &str) -> Result<Config> {
        let conf: Config = serde_json::from_str(json)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Check the consistency of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.mss < MIN_MSS {
            return Err(Error::InvalidConfig(format!("mss {} too small", self.mss)));
        }
        if self.rto_min.is_zero() || self.rto_min > self.rto_max {
            return Err(Error::InvalidConfig(format!(
                "bad rto bounds {:?}..{:?}",
                self.rto_min, self.rto_max
            )));
        }
        if self.rto_max.as_millis() > u32::MAX as u128 {
            return Err(Error::InvalidConfig("rto_max too large".into()));
        }
        if self.reordering == 0 || self.reordering > self.max_reordering {
            return Err(Error::InvalidConfig(format!(
                "bad reordering {} max {}",
                self.reordering, self.max_reordering
            )));
        }
        if self.max_burst == 0 || self.cwnd_clamp == 0 {
            return Err(Error::InvalidConfig("zero window limit".into()));
        }
        Ok(())
    }

    /// Set the maximum segment size in bytes. The value is at least `88`.
    /// The default value is `1460`.
    pub fn set_mss(&mut self, v: u32) {
        self.mss = cmp::max(v, MIN_MSS);
    }

    /// Set the initial congestion window in segments. Zero means the window
    /// is derived from the MSS (2, 3 or 4 segments).
    /// The default value is `0`.
    pub fn set_initial_congestion_window(&mut self, v: u32) {
        self.initial_congestion_window = v;
    }

    /// Set the upper bound of the congestion window in segments.
    /// The default value is `u32::MAX`.
    pub fn set_cwnd_clamp(&mut self, v: u32) {
        self.cwnd_clamp = cmp::max(v, 1);
    }

    /// Set the initial reordering threshold. The value is capped by the
    /// setting `max_reordering`.
    /// The default value is `3`.
    pub fn set_reordering(&mut self, v: u32) {
        self.reordering = cmp::min(cmp::max(v, 1), self.max_reordering);
    }

    /// Set the upper bound of the reordering threshold.
    /// The default value is `127`.
    pub fn set_max_reordering(&mut self, v: u32) {
        self.max_reordering = cmp::max(v, 1);
        self.reordering = cmp::min(self.reordering, self.max_reordering);
    }

    /// Set the bounds of the retransmission timeout in milliseconds.
    /// The default values are `200` and `120000`.
    pub fn set_rto_bounds(&mut self, min: u64, max: u64) -> Result<()> {
        if min == 0 || min > max || max > u32::MAX as u64 {
            return Err(Error::InvalidConfig(format!("bad rto bounds {}..{}", min, max)));
        }
        self.rto_min = Duration::from_millis(min);
        self.rto_max = Duration::from_millis(max);
        Ok(())
    }

    /// Set the retransmission timeout used before any RTT sample, in
    /// milliseconds.
    /// The default value is `3000`.
    pub fn set_rto_initial(&mut self, v: u64) {
        self.rto_initial = Duration::from_millis(v);
    }

    /// Set the maximum number of quick ACKs. The sender does not use it, the
    /// receiving side ACKs this many segments at once after out of order data.
    /// The default value is `16`.
    pub fn set_max_quickacks(&mut self, v: u32) {
        self.max_quickacks = v;
    }

    /// Set the maximum burst in segments allowed when the window is restored.
    /// The default value is `3`.
    pub fn set_max_burst(&mut self, v: u32) {
        self.max_burst = cmp::max(v, 1);
    }

    /// Enable SACK processing when the peer permits it.
    /// The default value is true.
    pub fn enable_sack(&mut self, v: bool) {
        self.enable_sack = v;
    }

    /// Enable forward acknowledgment.
    /// The default value is true.
    pub fn enable_fack(&mut self, v: bool) {
        self.enable_fack = v;
    }

    /// Enable undo driven by duplicate SACKs.
    /// The default value is true.
    pub fn enable_dsack(&mut self, v: bool) {
        self.enable_dsack = v;
    }

    /// Enable the reaction to ECN-Echo.
    /// The default value is false.
    pub fn enable_ecn(&mut self, v: bool) {
        self.enable_ecn = v;
    }

    /// Enable slow start restart after an idle period.
    /// The default value is true.
    pub fn enable_slow_start_after_idle(&mut self, v: bool) {
        self.slow_start_after_idle = v;
    }

    /// Set the congestion control algorithm.
    /// The default value is Reno.
    pub fn set_congestion_control_algorithm(&mut self, v: CongestionControlAlgorithm) {
        self.congestion_control_algorithm = v;
    }

    pub fn mss(&self) -> u32 {
        self.mss
    }

    /// The initial congestion window in segments.
    pub fn initial_cwnd(&self) -> u32 {
        let cwnd = if self.initial_congestion_window != 0 {
            self.initial_congestion_window
        } else if self.mss > 1460 {
            2
        } else if self.mss > 1095 {
            3
        } else {
            4
        };
        cmp::min(cwnd, self.cwnd_clamp)
    }

    pub fn cwnd_clamp(&self) -> u32 {
        self.cwnd_clamp
    }

    pub fn reordering(&self) -> u32 {
        self.reordering
    }

    pub fn max_reordering(&self) -> u32 {
        self.max_reordering
    }

    pub fn rto_min(&self) -> Duration {
        self.rto_min
    }

    pub fn rto_max(&self) -> Duration {
        self.rto_max
    }

    pub fn rto_initial(&self) -> Duration {
        self.rto_initial
    }

    pub fn max_quickacks(&self) -> u32 {
        self.max_quickacks
    }

    pub fn max_burst(&self) -> u32 {
        self.max_burst
    }

    pub fn sack_enabled(&self) -> bool {
        self.enable_sack
    }

    pub fn fack_enabled(&self) -> bool {
        self.enable_fack
    }

    pub fn dsack_enabled(&self) -> bool {
        self.enable_dsack
    }

    pub fn ecn_enabled(&self) -> bool {
        self.enable_ecn
    }

    pub fn slow_start_after_idle(&self) -> bool {
        self.slow_start_after_idle
    }
}

/// Statistics about loss recovery of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    /// Total number of retransmitted segments.
    pub total_retrans: u64,

    /// Retransmissions of segments marked lost in Recovery.
    pub fast_retrans: u64,

    /// Retransmissions of segments in SACK holes not yet marked lost.
    pub forward_retrans: u64,

    /// Retransmissions in the Loss state.
    pub slow_start_retrans: u64,

    /// Retransmission attempts refused by the sender.
    pub retrans_fail: u64,

    /// Retransmission timeouts in the Open or CWR state.
    pub timeouts: u64,

    /// Retransmission timeouts in the Loss state.
    pub loss_failures: u64,

    /// Retransmission timeouts in Disorder without SACK.
    pub reno_failures: u64,

    /// Retransmission timeouts in Disorder with SACK.
    pub sack_failures: u64,

    /// Retransmission timeouts in Recovery without SACK.
    pub reno_recovery_fail: u64,

    /// Retransmission timeouts in Recovery with SACK.
    pub sack_recovery_fail: u64,

    /// Recovery episodes entered without SACK.
    pub reno_recovery: u64,

    /// Recovery episodes entered with SACK.
    pub sack_recovery: u64,

    /// Segments marked lost.
    pub lost: u64,

    /// Loss events detected while recovering.
    pub loss: u64,

    /// Retransmissions detected lost again.
    pub lost_retransmit: u64,

    /// Recovery episodes completely undone.
    pub full_undo: u64,

    /// Recovery episodes partially undone.
    pub partial_undo: u64,

    /// Reductions undone by duplicate SACKs.
    pub dsack_undo: u64,

    /// Retransmission timeouts undone.
    pub loss_undo: u64,

    /// Reordering detected by timestamps.
    pub ts_reorder: u64,

    /// Reordering detected by duplicate ACK counting.
    pub reno_reorder: u64,

    /// Reordering detected by forward acknowledgment.
    pub fack_reorder: u64,

    /// Reordering detected by SACK.
    pub sack_reorder: u64,

    /// The receiver reneged on SACKed data.
    pub sack_reneging: u64,

    /// Duplicate SACKs below the cumulative ACK.
    pub dsack_recv: u64,

    /// Duplicate SACKs inside a SACKed range.
    pub dsack_ofo_recv: u64,

    /// SACK blocks dropped as invalid.
    pub sack_discard: u64,

    /// ACKs for data never sent.
    pub acks_ignored: u64,

    /// ACKs below the cumulative ACK point.
    pub old_acks: u64,

    /// Scoreboard counters resynchronized.
    pub resyncs: u64,

    /// Zero window probes sent.
    pub probes: u64,

    /// Smoothed roundtrip time in milliseconds.
    pub srtt: u64,

    /// Roundtrip time variation in milliseconds.
    pub rttvar: u64,

    /// Minimum roundtrip time in milliseconds.
    pub min_rtt: u64,

    /// Current retransmission timeout in milliseconds.
    pub rto: u64,
}

#[cfg(test)]
#[ctor::ctor]
fn init() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .format_timestamp_millis()
        .is_test(true)
        .init();
}


pub use crate::congestion_control::CaState;
pub use crate::congestion_control::CongestionControlAlgorithm;
pub use crate::congestion_control::CongestionController;
pub use crate::congestion_control::CongestionWindow;
pub use crate::error::Error;
pub use crate::recovery::AckFlag;
pub use crate::recovery::AckInfo;
pub use crate::recovery::AckOutcome;
pub use crate::recovery::Recovery;
pub use crate::recovery::ReorderSource;
pub use crate::recovery::RetransmitHandler;
pub use crate::recovery::Timer;
pub use crate::recovery::Timestamp;
pub use crate::recovery::MAX_SACK_BLOCKS;
pub use crate::recovery::SackBlock;
pub use crate::recovery::SackTag;
pub use crate::recovery::SegmentRecord;
pub use crate::seqnum::SeqNum;

#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;

#[path = "recovery/recovery.rs"]
pub mod recovery;

#[path = "qlog/qlog.rs"]
pub mod qlog;

pub mod error;
pub mod seqnum;
