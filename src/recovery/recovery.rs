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

//! Loss recovery of a TCP sender: ACK processing, retransmission timers and
//! the SACK based congestion avoidance state machine.

use std::cmp;
use std::time::Duration;
use std::time::Instant;

use enumflags2::bitflags;
use enumflags2::make_bitflags;
use enumflags2::BitFlags;
use log::*;
use smallvec::SmallVec;
use strum::IntoEnumIterator;

use self::reordering::ReorderingEstimator;
use self::rtt::RttEstimator;
use self::scoreboard::DsackKind;
use self::scoreboard::SackContext;
use self::scoreboard::Scoreboard;
use self::timer::TimerTable;
use crate::congestion_control;
use crate::congestion_control::CaState;
use crate::congestion_control::CongestionController;
use crate::congestion_control::CongestionWindow;
use crate::qlog;
use crate::qlog::events;
use crate::qlog::events::EventData;
use crate::seqnum::SeqNum;
use crate::Config;
use crate::Error;
use crate::RecoveryStats;
use crate::Result;
use crate::MAX_BACKOFF;
use crate::RESOURCE_PROBE_INTERVAL;

pub use self::reordering::ReorderSource;
pub use self::scoreboard::SackBlock;
pub use self::scoreboard::SackTag;
pub use self::scoreboard::SegmentRecord;
pub use self::scoreboard::MAX_SACK_BLOCKS;
pub use self::timer::Timer;

/// Flags describing what an incoming ACK carried.
#[bitflags]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckFlag {
    /// The segment carried payload.
    Data = 1 << 0,

    /// The send window was updated.
    WinUpdate = 1 << 1,

    /// New data was cumulatively acknowledged.
    DataAcked = 1 << 2,

    /// Retransmitted data was cumulatively acknowledged.
    RetransDataAcked = 1 << 3,

    /// New data was selectively acknowledged.
    DataSacked = 1 << 4,

    /// The segment carried ECN-Echo.
    Ece = 1 << 5,

    /// A SACK block reported data above the recovery point.
    DataLost = 1 << 6,
}

/// The ACK is not a duplicate.
const NOT_DUP: BitFlags<AckFlag> = make_bitflags!(AckFlag::{Data | WinUpdate | DataAcked});

/// The ACK signals congestion.
const CA_ALERT: BitFlags<AckFlag> = make_bitflags!(AckFlag::{DataSacked | Ece});

/// TCP timestamp option echoed by the peer.
///
/// Timestamps are the values returned by [`Recovery::timestamp`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timestamp {
    /// Timestamp value of the peer.
    pub tsval: u32,

    /// Echo of the most recent timestamp sent to the peer.
    pub tsecr: u32,
}

/// The already parsed fields of an incoming ACK segment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AckInfo {
    /// Sequence number of the segment carrying the ACK.
    pub seq: SeqNum,

    /// Cumulative acknowledgment number.
    pub ack_seq: SeqNum,

    /// Advertised receive window in bytes, already scaled.
    pub window: u32,

    /// SACK blocks, most recently reported first.
    pub sack_blocks: SmallVec<[SackBlock; MAX_SACK_BLOCKS]>,

    /// The ECN-Echo flag is set.
    pub ecn_echo: bool,

    /// The segment is a pure ACK without payload, hence a duplicate ACK
    /// candidate.
    pub is_dup: bool,

    /// Timestamp option, if present.
    pub timestamp: Option<Timestamp>,
}

impl AckInfo {
    /// Create a pure ACK.
    pub fn new(seq: SeqNum, ack_seq: SeqNum, window: u32) -> Self {
        AckInfo {
            seq,
            ack_seq,
            window,
            is_dup: true,
            ..Default::default()
        }
    }

    /// Attach SACK blocks. Blocks beyond `MAX_SACK_BLOCKS` are dropped.
    pub fn with_sack(mut self, blocks: &[SackBlock]) -> Self {
        let n = cmp::min(blocks.len(), MAX_SACK_BLOCKS);
        self.sack_blocks = SmallVec::from_slice(&blocks[..n]);
        self
    }

    /// Attach a timestamp option.
    pub fn with_timestamp(mut self, tsval: u32, tsecr: u32) -> Self {
        self.timestamp = Some(Timestamp { tsval, tsecr });
        self
    }

    /// Return the timestamp option of the segment.
    pub fn saw_timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }
}

/// The result of processing an ACK.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// What the ACK carried.
    pub flags: BitFlags<AckFlag>,

    /// Number of segments cumulatively acknowledged.
    pub acked: u32,

    /// Number of segments newly marked lost.
    pub lost: u32,

    /// Number of segments retransmitted.
    pub retransmitted: u32,

    /// The ACK was outside of the acceptable range and only its SACK
    /// information, if any, was used.
    pub ignored: bool,
}

impl AckOutcome {
    /// Whether new data was acknowledged. Blocked writers may be woken up.
    pub fn data_acked(&self) -> bool {
        self.flags.contains(AckFlag::DataAcked)
    }

    /// Whether the send window changed.
    pub fn window_updated(&self) -> bool {
        self.flags.contains(AckFlag::WinUpdate)
    }

    /// Whether loss was inferred while processing the ACK.
    pub fn loss_detected(&self) -> bool {
        self.lost > 0 || self.flags.contains(AckFlag::DataLost)
    }

    /// Whether the peer signalled congestion.
    pub fn congestion_notified(&self) -> bool {
        self.flags.contains(AckFlag::Ece)
    }
}

/// Callbacks used by the engine to put segments on the wire.
pub trait RetransmitHandler {
    /// Retransmit the given segment.
    ///
    /// An error means the segment was not sent. The engine stops the current
    /// retransmission pass and retries later.
    fn retransmit(&mut self, segment: &SegmentRecord) -> Result<()>;

    /// Send a zero window probe.
    fn send_probe(&mut self) -> Result<()>;
}

/// Per connection loss recovery and congestion control context.
pub struct Recovery {
    /// RTT estimation.
    rtt: RttEstimator,

    /// Outstanding segments and their SACK state.
    scoreboard: Scoreboard,

    /// Reordering threshold.
    reordering: ReorderingEstimator,

    /// Congestion window and slow start threshold.
    window: CongestionWindow,

    /// Congestion control algorithm.
    congestion: Box<dyn CongestionController + Send>,

    /// Congestion avoidance state.
    ca_state: CaState,

    /// Oldest unacknowledged sequence number.
    snd_una: SeqNum,

    /// Next sequence number to be sent.
    snd_nxt: SeqNum,

    /// Send window advertised by the peer.
    snd_wnd: u32,

    /// Segment sequence number used for the last window update.
    snd_wl1: SeqNum,

    /// Largest window ever advertised by the peer.
    max_window: u32,

    /// `snd_nxt` when the current recovery episode started.
    high_seq: SeqNum,

    /// `snd_una` when the current reduction started. Unset if the reduction
    /// must not be undone.
    undo_marker: Option<SeqNum>,

    /// Retransmissions not yet proven redundant by duplicate SACKs.
    undo_retrans: i32,

    /// Timestamp of the first retransmission of the episode.
    retrans_stamp: Option<u32>,

    /// Echoed timestamp of the ACK being processed.
    rcv_tsecr: Option<u32>,

    /// Consecutive retransmission timeouts.
    retransmits: u32,

    /// Exponent of the timer backoff.
    backoff: u32,

    /// Unanswered zero window probes.
    probes_out: u32,

    /// Timestamp of the last data transmission.
    lsndtime: u32,

    /// Length of the next segment waiting to be sent, if any.
    send_head: Option<u32>,

    /// A CWR flag must be sent to the peer.
    cwr_pending: bool,

    /// React to ECN-Echo.
    ecn: bool,

    /// Apply duplicate SACK reports to undo accounting.
    dsack: bool,

    mss: u32,

    max_burst: u32,

    max_quickacks: u32,

    initial_cwnd: u32,

    slow_start_after_idle: bool,

    /// Retransmission and probe timers.
    timers: TimerTable,

    /// Reference point of the millisecond timestamp clock.
    epoch: Instant,

    /// Recovery statistics.
    stats: RecoveryStats,

    /// Qlog writer.
    qlog: Option<qlog::QlogWriter>,

    /// It tracks the last metrics used for emitting qlog RecoveryMetricsUpdated
    /// event.
    last_metrics: RecoveryMetrics,

    /// Trace id.
    trace_id: String,
}

impl Recovery {
    /// Create a recovery context for a connection whose first data byte is
    /// `isn`.
    pub fn new(conf: &Config, isn: SeqNum, now: Instant) -> Self {
        let sack = conf.sack_enabled();
        let rtt = RttEstimator::new(
            duration_ms(conf.rto_initial()),
            duration_ms(conf.rto_min()),
            duration_ms(conf.rto_max()),
        );

        Recovery {
            rtt,
            scoreboard: Scoreboard::new(sack),
            reordering: ReorderingEstimator::new(
                conf.reordering(),
                conf.max_reordering(),
                sack && conf.fack_enabled(),
            ),
            window: CongestionWindow::new(conf.initial_cwnd(), conf.cwnd_clamp()),
            congestion: congestion_control::build_congestion_controller(conf),
            ca_state: CaState::Open,
            snd_una: isn,
            snd_nxt: isn,
            snd_wnd: 0,
            snd_wl1: SeqNum(0),
            max_window: 0,
            high_seq: isn,
            undo_marker: None,
            undo_retrans: 0,
            retrans_stamp: None,
            rcv_tsecr: None,
            retransmits: 0,
            backoff: 0,
            probes_out: 0,
            lsndtime: 0,
            send_head: None,
            cwr_pending: false,
            ecn: conf.ecn_enabled(),
            dsack: conf.dsack_enabled(),
            mss: conf.mss(),
            max_burst: conf.max_burst(),
            max_quickacks: conf.max_quickacks(),
            initial_cwnd: conf.initial_cwnd(),
            slow_start_after_idle: conf.slow_start_after_idle(),
            timers: TimerTable::default(),
            epoch: now,
            stats: RecoveryStats::default(),
            qlog: None,
            last_metrics: RecoveryMetrics::default(),
            trace_id: String::from(""),
        }
    }

    /// Set trace id.
    pub fn set_trace_id(&mut self, trace_id: &str) {
        self.trace_id = trace_id.to_string();
    }

    /// Set the writer for qlog output.
    pub fn set_qlog(
        &mut self,
        writer: Box<dyn std::io::Write + Send + Sync>,
        title: String,
        description: String,
        now: Instant,
    ) {
        let group_id = if self.trace_id.is_empty() {
            None
        } else {
            Some(self.trace_id.clone())
        };
        let trace = qlog::TraceSeq::new(group_id, qlog::VantagePoint::new(None, true));
        let level = events::EventImportance::Extra;
        let mut writer =
            qlog::QlogWriter::new(Some(title), Some(description), trace, level, writer, now);
        writer.start().ok();

        let ev_data = EventData::RecoveryParametersSet {
            mss: Some(self.mss),
            reordering_threshold: Some(self.reordering.value()),
            initial_congestion_window: Some(self.initial_cwnd),
            rto_min: Some(self.rtt.rto_min() as f32),
            rto_max: Some(self.rtt.rto_max() as f32),
            sack: Some(self.scoreboard.is_sack()),
            fack: Some(self.is_fack()),
            congestion_control: Some(self.congestion.name().to_string()),
        };
        writer.add_event_data(now, ev_data).ok();

        self.qlog = Some(writer);
    }

    /// Record whether the peer permitted SACK. It must be called before any
    /// data is sent.
    pub fn set_sack_permitted(&mut self, permitted: bool) -> Result<()> {
        if self.scoreboard.packets_out() != 0 {
            return Err(Error::InvalidState("data already sent".into()));
        }

        let sack = self.scoreboard.is_sack() && permitted;
        self.scoreboard.set_sack(sack);
        if !sack {
            self.reordering.disable_fack();
        }
        Ok(())
    }

    /// Record whether ECN was negotiated with the peer.
    pub fn set_ecn_enabled(&mut self, v: bool) {
        self.ecn = v;
        if !v {
            self.cwr_pending = false;
        }
    }

    /// Set the send window advertised in the handshake.
    pub fn set_send_window(&mut self, window: u32, wl1: SeqNum) {
        self.snd_wnd = window;
        self.snd_wl1 = wl1;
        self.max_window = cmp::max(self.max_window, window);
    }

    /// Millisecond timestamp used for segment transmission times and the TCP
    /// timestamp option.
    pub fn timestamp(&self, now: Instant) -> u32 {
        duration_ms(now.saturating_duration_since(self.epoch))
    }

    /// Handle segment sent event. Return the sequence number of the segment.
    pub fn on_segment_sent(&mut self, len: u32, now: Instant) -> Result<SeqNum> {
        if len == 0 {
            return Err(Error::InvalidOperation("empty segment".into()));
        }

        let ts = self.timestamp(now);
        let packets_out = self.scoreboard.packets_out();

        // Restart from a smaller window after an idle period, the estimate of
        // the path is stale.
        let idle = ts.wrapping_sub(self.lsndtime);
        if self.slow_start_after_idle && packets_out == 0 && idle as i32 > self.rtt.rto() as i32 {
            self.window
                .restart_after_idle(idle, self.rtt.rto(), self.initial_cwnd, self.ca_state);
            debug!(
                "{} restart after idle {}ms cwnd={} ssthresh={}",
                self.trace_id,
                idle,
                self.window.cwnd(),
                self.window.ssthresh()
            );
        }
        self.lsndtime = ts;

        let seq = self.snd_nxt;
        self.scoreboard
            .push(SegmentRecord::new(seq, seq + len, ts));
        self.snd_nxt += len;

        if packets_out == 0 {
            self.timers.stop(Timer::Probe);
            self.timers
                .set(Timer::Retransmit, now + self.rtt.rto_duration());
        }

        trace!(
            "{} ON_SENT seq={} len={} inflight={} cwnd={}",
            self.trace_id,
            seq,
            len,
            self.in_flight(),
            self.window.cwnd()
        );
        Ok(seq)
    }

    /// Set the length of the next segment waiting to be sent, `None` if the
    /// send queue is empty.
    pub fn set_send_head(&mut self, len: Option<u32>, now: Instant) {
        self.send_head = len;

        // Nothing in flight will trigger an ACK. Probe the window.
        if len.is_some()
            && self.scoreboard.packets_out() == 0
            && !self.send_head_fits()
            && !self.timers.is_set(Timer::Retransmit)
            && !self.timers.is_set(Timer::Probe)
        {
            self.timers.set(Timer::Probe, now + self.rtt.rto_duration());
        }
    }

    /// Process an incoming ACK.
    pub fn on_ack(
        &mut self,
        ack: &AckInfo,
        handler: &mut dyn RetransmitHandler,
        now: Instant,
    ) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        let prior_snd_una = self.snd_una;
        let prior_lost = self.stats.lost;
        let prior_retrans = self.stats.total_retrans;

        trace!(
            "{} ON_ACK ack={} win={} sacks={:?} state={} inflight={} cwnd={}",
            self.trace_id,
            ack.ack_seq,
            ack.window,
            ack.sack_blocks,
            self.ca_state,
            self.in_flight(),
            self.window.cwnd()
        );

        // The peer acknowledged data never sent.
        if ack.ack_seq.after(self.snd_nxt) {
            self.stats.acks_ignored += 1;
            outcome.ignored = true;
            return outcome;
        }

        self.rcv_tsecr = ack.saw_timestamp().map(|ts| ts.tsecr);

        if ack.ack_seq.before(prior_snd_una) {
            self.stats.old_acks += 1;
            if self.sack_present(ack) {
                outcome.flags |= self.tag_sack(ack, prior_snd_una, now);
            }
            outcome.ignored = true;
            return outcome;
        }

        let mut flag = BitFlags::<AckFlag>::empty();
        if !ack.is_dup {
            flag |= AckFlag::Data;
        }
        flag |= self.update_window(ack);
        if self.sack_present(ack) {
            flag |= self.tag_sack(ack, prior_snd_una, now);
        }
        if ack.ecn_echo && self.ecn {
            flag |= AckFlag::Ece;
        }

        let prior_packets = self.scoreboard.packets_out();
        if prior_packets == 0 {
            self.probes_out = 0;
            if self.send_head.is_some() {
                self.ack_probe(now);
            }
        } else {
            let prior_in_flight = self.in_flight();
            let (acked, acked_flag) = self.clean_acked(now);
            outcome.acked = acked;
            flag |= acked_flag;

            if self.ack_is_dubious(flag) {
                if flag.contains(AckFlag::DataAcked) && self.may_raise_cwnd(flag) {
                    self.congestion
                        .cong_avoid(&mut self.window, prior_in_flight);
                }
                self.fastretrans_alert(prior_snd_una, prior_packets, flag, handler, now);
            } else if flag.contains(AckFlag::DataAcked) {
                self.congestion
                    .cong_avoid(&mut self.window, prior_in_flight);
            }
        }

        self.scoreboard.check_invariants();

        outcome.flags = flag;
        outcome.lost = (self.stats.lost - prior_lost) as u32;
        outcome.retransmitted = (self.stats.total_retrans - prior_retrans) as u32;
        self.qlog_metrics_updated(now);
        outcome
    }

    /// Handle the expiry of the retransmission timer.
    ///
    /// It does nothing if the timer is not armed, not due yet, or if no data
    /// is outstanding.
    pub fn on_rto_timeout(&mut self, handler: &mut dyn RetransmitHandler, now: Instant) {
        if !self.timers.is_expired(Timer::Retransmit, now) {
            return;
        }
        self.timers.stop(Timer::Retransmit);

        if self.scoreboard.packets_out() == 0 {
            return;
        }

        debug!(
            "{} RTO state={} retransmits={} rto={} inflight={}",
            self.trace_id,
            self.ca_state,
            self.retransmits,
            self.rtt.rto(),
            self.in_flight()
        );

        if self.snd_wnd == 0 {
            // The receiver shrank the window. Keep the head going without
            // counting a timeout against the path.
            self.enter_loss(false, now);
            if let Err(e) = self.retransmit_segment(0, handler, now) {
                trace!("{} head retransmit failed {:?}", self.trace_id, e);
            }
        } else {
            if self.retransmits == 0 {
                self.count_rto_failure();
            }

            self.enter_loss(false, now);
            if let Err(e) = self.retransmit_segment(0, handler, now) {
                // Local resource shortage. Retry soon without backing off.
                trace!("{} head retransmit failed {:?}", self.trace_id, e);
                self.retransmits = cmp::max(self.retransmits, 1);
                let interval = cmp::min(self.rtt.rto_duration(), RESOURCE_PROBE_INTERVAL);
                self.timers.set(Timer::Retransmit, now + interval);
                self.qlog_metrics_updated(now);
                return;
            }

            self.backoff += 1;
            self.retransmits += 1;
        }

        self.rtt.backoff();
        self.timers
            .set(Timer::Retransmit, now + self.rtt.rto_duration());
        self.qlog_metrics_updated(now);
    }

    /// Handle the expiry of the zero window probe timer.
    pub fn on_probe_timeout(&mut self, handler: &mut dyn RetransmitHandler, now: Instant) {
        if !self.timers.is_expired(Timer::Probe, now) {
            return;
        }
        self.timers.stop(Timer::Probe);

        if self.scoreboard.packets_out() != 0 || self.send_head.is_none() {
            self.probes_out = 0;
            return;
        }

        match handler.send_probe() {
            Ok(()) => {
                if self.backoff < MAX_BACKOFF {
                    self.backoff += 1;
                }
                self.probes_out += 1;
                self.stats.probes += 1;
                let interval = self.probe_interval(self.rtt.rto_max());
                self.timers.set(Timer::Probe, now + interval);
            }
            Err(e) => {
                trace!("{} probe failed {:?}", self.trace_id, e);
                self.probes_out = cmp::max(self.probes_out, 1);
                let interval = self.probe_interval(duration_ms(RESOURCE_PROBE_INTERVAL));
                self.timers.set(Timer::Probe, now + interval);
            }
        }

        trace!(
            "{} PROBE probes_out={} backoff={}",
            self.trace_id,
            self.probes_out,
            self.backoff
        );
    }

    /// Handle all the timers expired at `now`.
    pub fn on_timeout(&mut self, handler: &mut dyn RetransmitHandler, now: Instant) {
        for timer in Timer::iter() {
            if !self.timers.is_expired(timer, now) {
                continue;
            }
            match timer {
                Timer::Retransmit => self.on_rto_timeout(handler, now),
                Timer::Probe => self.on_probe_timeout(handler, now),
            }
        }
    }

    /// Return the earliest timer deadline.
    pub fn timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// Return the deadline of the given timer.
    pub fn timer(&self, timer: Timer) -> Option<Instant> {
        self.timers.get(timer)
    }

    /// Reduce the window after a local congestion notification.
    pub fn on_congestion_notification(&mut self, now: Instant) {
        self.enter_cwr(now);
    }

    /// Whether a CWR flag must be sent to the peer.
    pub fn cwr_pending(&self) -> bool {
        self.cwr_pending
    }

    /// Notify that the CWR flag has been sent.
    pub fn on_cwr_sent(&mut self) {
        self.cwr_pending = false;
    }

    /// Return the congestion window in segments.
    pub fn current_cwnd(&self) -> u32 {
        self.window.cwnd()
    }

    /// Return the slow start threshold in segments.
    pub fn current_ssthresh(&self) -> u32 {
        self.window.ssthresh()
    }

    /// Return the number of segments believed to be in the network.
    pub fn in_flight(&self) -> u32 {
        self.scoreboard.in_flight()
    }

    /// Whether the congestion window allows another segment.
    pub fn can_send(&self) -> bool {
        self.in_flight() < self.window.cwnd()
    }

    pub fn ca_state(&self) -> CaState {
        self.ca_state
    }

    pub fn packets_out(&self) -> u32 {
        self.scoreboard.packets_out()
    }

    pub fn sacked_out(&self) -> u32 {
        self.scoreboard.sacked_out()
    }

    pub fn lost_out(&self) -> u32 {
        self.scoreboard.lost_out()
    }

    pub fn retrans_out(&self) -> u32 {
        self.scoreboard.retrans_out()
    }

    pub fn fackets_out(&self) -> u32 {
        self.scoreboard.fackets_out()
    }

    pub fn left_out(&self) -> u32 {
        self.scoreboard.left_out()
    }

    /// Iterate the outstanding segments, oldest first.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentRecord> {
        self.scoreboard.iter()
    }

    /// Return the current reordering threshold.
    pub fn reordering(&self) -> u32 {
        self.reordering.value()
    }

    pub fn snd_una(&self) -> SeqNum {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> SeqNum {
        self.snd_nxt
    }

    pub fn snd_wnd(&self) -> u32 {
        self.snd_wnd
    }

    pub fn high_seq(&self) -> SeqNum {
        self.high_seq
    }

    pub fn undo_marker(&self) -> Option<SeqNum> {
        self.undo_marker
    }

    pub fn undo_retrans(&self) -> i32 {
        self.undo_retrans
    }

    pub fn prior_ssthresh(&self) -> u32 {
        self.window.prior_ssthresh()
    }

    /// Consecutive retransmission timeouts. The caller may abort the
    /// connection when it grows too large.
    pub fn retransmits(&self) -> u32 {
        self.retransmits
    }

    pub fn backoff(&self) -> u32 {
        self.backoff
    }

    pub fn probes_out(&self) -> u32 {
        self.probes_out
    }

    /// Return the RTT estimator.
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Return the current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rtt.rto_duration()
    }

    pub fn max_quickacks(&self) -> u32 {
        self.max_quickacks
    }

    /// Return recovery statistics.
    pub fn stats(&self) -> &RecoveryStats {
        &self.stats
    }

    /// Whether SACK blocks of the ACK should be processed.
    fn sack_present(&self, ack: &AckInfo) -> bool {
        self.scoreboard.is_sack() && !ack.sack_blocks.is_empty()
    }

    /// Whether forward acknowledgment is in use.
    pub(super) fn is_fack(&self) -> bool {
        self.scoreboard.is_sack() && self.reordering.fack_enabled()
    }

    /// Update the send window. See RFC 793 Section 3.9 (SND.WL1).
    fn update_window(&mut self, ack: &AckInfo) -> BitFlags<AckFlag> {
        let mut flag = BitFlags::empty();
        let nwin = ack.window;

        if ack.ack_seq.after(self.snd_una)
            || ack.seq.after(self.snd_wl1)
            || (ack.seq == self.snd_wl1 && nwin > self.snd_wnd)
        {
            flag |= AckFlag::WinUpdate;
            self.snd_wl1 = ack.seq;
            if self.snd_wnd != nwin {
                self.snd_wnd = nwin;
                self.max_window = cmp::max(self.max_window, nwin);
            }
        }

        self.snd_una = ack.ack_seq;
        flag
    }

    /// Apply the SACK blocks of an ACK to the scoreboard.
    fn tag_sack(
        &mut self,
        ack: &AckInfo,
        prior_snd_una: SeqNum,
        now: Instant,
    ) -> BitFlags<AckFlag> {
        let mut flag = BitFlags::empty();
        let ctx = SackContext {
            ack: ack.ack_seq,
            prior_snd_una,
            snd_una: self.snd_una,
            snd_nxt: self.snd_nxt,
            high_seq: self.high_seq,
            undo_marker: self.undo_marker,
            max_window: self.max_window,
            in_recovery: self.ca_state == CaState::Recovery,
            in_loss: self.ca_state == CaState::Loss,
            fack: self.is_fack(),
            reordering: self.reordering.value(),
            mss: self.mss,
        };
        let out = self.scoreboard.apply_sack(&ack.sack_blocks, &ctx);

        match out.dsack {
            Some(DsackKind::BelowAck) => self.stats.dsack_recv += 1,
            Some(DsackKind::OutOfOrder) => self.stats.dsack_ofo_recv += 1,
            None => (),
        }
        if self.dsack && out.undo_retrans_delta != 0 {
            self.undo_retrans += out.undo_retrans_delta;
            trace!(
                "{} D-SACK undo_retrans={}",
                self.trace_id,
                self.undo_retrans
            );
        }
        if out.too_old {
            return flag;
        }

        self.stats.sack_discard += out.discarded as u64;
        if out.lost_retransmits > 0 {
            self.stats.lost_retransmit += out.lost_retransmits as u64;
            self.stats.lost += out.lost_retransmits as u64;
            self.qlog_segments_lost(
                out.lost_retransmits,
                events::SegmentsLostTrigger::LostRetransmit,
                now,
            );
        }
        if let Some(metric) = out.reordering {
            self.update_reordering(metric, false, now);
        }

        if out.data_sacked {
            flag |= AckFlag::DataSacked;
        }
        if out.data_lost {
            flag |= AckFlag::DataLost;
        }
        flag
    }

    /// Remove acknowledged segments, take an RTT sample and rearm the
    /// retransmission timer.
    fn clean_acked(&mut self, now: Instant) -> (u32, BitFlags<AckFlag>) {
        let ts = self.timestamp(now);
        let acked = self.scoreboard.clean_acked(self.snd_una, ts);

        if acked.resynced {
            warn!(
                "{} scoreboard counters resynchronized with an empty queue",
                self.trace_id
            );
            self.stats.resyncs += 1;
        }

        let mut flag = BitFlags::empty();
        if acked.acked == 0 {
            return (0, flag);
        }
        flag |= AckFlag::DataAcked;
        if acked.retrans_acked {
            flag |= AckFlag::RetransDataAcked;
        }

        // Karn's algorithm. Without timestamps an ACK of retransmitted data
        // is ambiguous.
        let sample = match self.rcv_tsecr {
            Some(tsecr) if tsecr != 0 => Some(ts.wrapping_sub(tsecr)),
            _ if acked.retrans_acked => None,
            _ => acked.seq_rtt,
        };
        if let Some(sample) = sample {
            self.rtt.update(sample, self.snd_una, self.snd_nxt);
            self.rtt.compute_rto();
            self.backoff = 0;
            self.stat_rtt_updated();
        }

        if self.scoreboard.packets_out() == 0 {
            self.timers.stop(Timer::Retransmit);
        } else {
            self.timers
                .set(Timer::Retransmit, now + self.rtt.rto_duration());
        }

        (acked.acked, flag)
    }

    /// Check the zero window probe state after an ACK with nothing in flight.
    fn ack_probe(&mut self, now: Instant) {
        if self.send_head_fits() {
            self.backoff = 0;
            self.timers.stop(Timer::Probe);
        } else {
            let interval = self.probe_interval(self.rtt.rto_max());
            self.timers.set(Timer::Probe, now + interval);
        }
    }

    /// Whether the next segment fits in the send window.
    pub(super) fn send_head_fits(&self) -> bool {
        match self.send_head {
            Some(len) => !(self.snd_nxt + len).after(self.snd_una + self.snd_wnd),
            None => false,
        }
    }

    /// Backed off probe interval, bounded by `cap` milliseconds.
    fn probe_interval(&self, cap: u32) -> Duration {
        let backed_off = (self.rtt.rto() as u64) << cmp::min(self.backoff, MAX_BACKOFF);
        Duration::from_millis(cmp::min(backed_off, cap as u64))
    }

    fn ack_is_dubious(&self, flag: BitFlags<AckFlag>) -> bool {
        !flag.intersects(NOT_DUP) || flag.intersects(CA_ALERT) || self.ca_state != CaState::Open
    }

    fn may_raise_cwnd(&self, flag: BitFlags<AckFlag>) -> bool {
        (!flag.contains(AckFlag::Ece) || self.window.cwnd() < self.window.ssthresh())
            && !matches!(self.ca_state, CaState::Recovery | CaState::Cwr)
    }

    /// Count a retransmission timeout according to the state it interrupted.
    fn count_rto_failure(&mut self) {
        let sack = self.scoreboard.is_sack();
        match self.ca_state {
            CaState::Recovery if sack => self.stats.sack_recovery_fail += 1,
            CaState::Recovery => self.stats.reno_recovery_fail += 1,
            CaState::Disorder if sack => self.stats.sack_failures += 1,
            CaState::Disorder => self.stats.reno_failures += 1,
            CaState::Loss => self.stats.loss_failures += 1,
            CaState::Open | CaState::Cwr => self.stats.timeouts += 1,
        }
    }

    fn stat_rtt_updated(&mut self) {
        self.stats.srtt = self.rtt.smoothed_rtt().as_millis() as u64;
        self.stats.rttvar = self.rtt.rttvar() as u64;
        self.stats.min_rtt = self
            .rtt
            .min_rtt()
            .map_or(0, |rtt| rtt.as_millis() as u64);
        self.stats.rto = self.rtt.rto() as u64;
    }

    /// Write a qlog event if qlog is enabled.
    pub(super) fn qlog_event(&mut self, now: Instant, ev_data: EventData) {
        if let Some(qlog) = self.qlog.as_mut() {
            qlog.add_event_data(now, ev_data).ok();
        }
    }

    /// Write a qlog RecoverySegmentsLost event.
    pub(super) fn qlog_segments_lost(
        &mut self,
        count: u32,
        trigger: events::SegmentsLostTrigger,
        now: Instant,
    ) {
        if count == 0 {
            return;
        }
        let ev_data = EventData::RecoverySegmentsLost {
            count,
            high_seq: Some(self.high_seq.0),
            trigger: Some(trigger),
        };
        self.qlog_event(now, ev_data);
    }

    /// Write a qlog RecoveryMetricsUpdated event if any recovery metric is updated.
    fn qlog_metrics_updated(&mut self, now: Instant) {
        if self.qlog.is_none() {
            return;
        }

        let mut updated = false;

        let mut smoothed_rtt = None;
        if self.last_metrics.smoothed_rtt != self.rtt.smoothed_rtt() {
            self.last_metrics.smoothed_rtt = self.rtt.smoothed_rtt();
            smoothed_rtt = Some(self.last_metrics.smoothed_rtt.as_secs_f32() * 1000.0);
            updated = true;
        }

        let mut latest_rtt = None;
        if self.last_metrics.latest_rtt != self.rtt.latest_rtt() {
            self.last_metrics.latest_rtt = self.rtt.latest_rtt();
            latest_rtt = Some(self.last_metrics.latest_rtt.as_secs_f32() * 1000.0);
            updated = true;
        }

        let mut rtt_variance = None;
        if self.last_metrics.rttvar != self.rtt.rttvar() {
            self.last_metrics.rttvar = self.rtt.rttvar();
            rtt_variance = Some(self.last_metrics.rttvar as f32);
            updated = true;
        }

        let mut rto = None;
        if self.last_metrics.rto != self.rtt.rto() {
            self.last_metrics.rto = self.rtt.rto();
            rto = Some(self.last_metrics.rto as f32);
            updated = true;
        }

        let mut congestion_window = None;
        if self.last_metrics.cwnd != self.window.cwnd() {
            self.last_metrics.cwnd = self.window.cwnd();
            congestion_window = Some(self.last_metrics.cwnd);
            updated = true;
        }

        let mut ssthresh = None;
        if self.last_metrics.ssthresh != self.window.ssthresh() {
            self.last_metrics.ssthresh = self.window.ssthresh();
            ssthresh = Some(self.last_metrics.ssthresh);
            updated = true;
        }

        let mut packets_in_flight = None;
        if self.last_metrics.in_flight != self.in_flight() {
            self.last_metrics.in_flight = self.in_flight();
            packets_in_flight = Some(self.last_metrics.in_flight);
            updated = true;
        }

        let mut sacked_out = None;
        if self.last_metrics.sacked_out != self.scoreboard.sacked_out() {
            self.last_metrics.sacked_out = self.scoreboard.sacked_out();
            sacked_out = Some(self.last_metrics.sacked_out);
            updated = true;
        }

        let mut lost_out = None;
        if self.last_metrics.lost_out != self.scoreboard.lost_out() {
            self.last_metrics.lost_out = self.scoreboard.lost_out();
            lost_out = Some(self.last_metrics.lost_out);
            updated = true;
        }

        let mut retrans_out = None;
        if self.last_metrics.retrans_out != self.scoreboard.retrans_out() {
            self.last_metrics.retrans_out = self.scoreboard.retrans_out();
            retrans_out = Some(self.last_metrics.retrans_out);
            updated = true;
        }

        if !updated {
            return;
        }

        let ev_data = EventData::RecoveryMetricsUpdated {
            smoothed_rtt,
            latest_rtt,
            rtt_variance,
            rto,
            congestion_window,
            ssthresh,
            packets_in_flight,
            sacked_out,
            lost_out,
            retrans_out,
        };
        self.qlog_event(now, ev_data);
    }
}

impl std::fmt::Debug for Recovery {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "state={} cwnd={} ssthresh={} packets_out={} sacked={} lost={} retrans={} fackets={} reordering={} rto={}",
            self.ca_state,
            self.window.cwnd(),
            self.window.ssthresh(),
            self.scoreboard.packets_out(),
            self.scoreboard.sacked_out(),
            self.scoreboard.lost_out(),
            self.scoreboard.retrans_out(),
            self.scoreboard.fackets_out(),
            self.reordering.value(),
            self.rtt.rto()
        )
    }
}

/// Convert a duration to milliseconds, saturating at `u32::MAX`.
fn duration_ms(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

/// Metrics used for emitting qlog RecoveryMetricsUpdated event.
#[derive(Default)]
struct RecoveryMetrics {
    /// The smoothed RTT of the connection.
    smoothed_rtt: Duration,

    /// The most recent RTT sample.
    latest_rtt: Duration,

    /// The RTT variation in milliseconds.
    rttvar: u32,

    /// Retransmission timeout in milliseconds.
    rto: u32,

    /// Congestion window in segments.
    cwnd: u32,

    /// Slow start threshold in segments.
    ssthresh: u32,

    /// Segments in flight.
    in_flight: u32,

    sacked_out: u32,

    lost_out: u32,

    retrans_out: u32,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::congestion_control::INFINITE_SSTHRESH;

    pub const MSS: u32 = 1000;

    pub const WINDOW: u32 = 65535;

    const RTO_INITIAL_TEST: Duration = crate::RTO_INITIAL;

    /// Records the segments handed out for retransmission.
    #[derive(Default)]
    pub struct TestHandler {
        pub retransmitted: Vec<SeqNum>,
        pub probes: u32,
        pub fail: bool,
    }

    impl RetransmitHandler for TestHandler {
        fn retransmit(&mut self, segment: &SegmentRecord) -> Result<()> {
            if self.fail {
                return Err(Error::LocalCongestion);
            }
            self.retransmitted.push(segment.seq);
            Ok(())
        }

        fn send_probe(&mut self) -> Result<()> {
            if self.fail {
                return Err(Error::LocalCongestion);
            }
            self.probes += 1;
            Ok(())
        }
    }

    pub fn new_test_config(sack: bool) -> Config {
        let mut conf = Config::default();
        conf.set_mss(MSS);
        conf.set_initial_congestion_window(10);
        conf.enable_sack(sack);
        conf
    }

    /// A connection with `n` segments of `MSS` bytes sent at `now`. Segment
    /// `i` covers `[i * MSS, (i + 1) * MSS)`.
    pub fn new_test_recovery(conf: &Config, n: u32, now: Instant) -> Recovery {
        let mut r = Recovery::new(conf, SeqNum(0), now);
        r.set_trace_id("TEST");
        r.set_send_window(WINDOW, SeqNum(0));
        for _ in 0..n {
            r.on_segment_sent(MSS, now).unwrap();
        }
        r
    }

    pub fn new_test_ack(ack: u32, blocks: &[(u32, u32)]) -> AckInfo {
        let blocks: Vec<SackBlock> = blocks
            .iter()
            .map(|&(start, end)| SackBlock::new(start * MSS, end * MSS))
            .collect();
        AckInfo::new(SeqNum(0), SeqNum(ack * MSS), WINDOW).with_sack(&blocks)
    }

    pub fn check_counters(r: &Recovery) {
        assert_eq!(r.left_out(), r.sacked_out() + r.lost_out());
        assert!(r.packets_out() >= r.left_out());
        assert_eq!(
            r.in_flight(),
            r.packets_out() + r.retrans_out() - r.left_out()
        );
    }

    #[test]
    fn segment_sent() -> Result<()> {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 0, now);
        assert_eq!(r.timer(Timer::Retransmit), None);

        assert_eq!(r.on_segment_sent(MSS, now)?, SeqNum(0));
        assert_eq!(r.on_segment_sent(MSS, now)?, SeqNum(MSS));
        assert_eq!(r.snd_nxt(), SeqNum(2 * MSS));
        assert_eq!(r.packets_out(), 2);
        assert_eq!(r.in_flight(), 2);
        assert_eq!(r.timer(Timer::Retransmit), Some(now + RTO_INITIAL_TEST));
        assert_eq!(r.current_cwnd(), 10);
        assert_eq!(r.current_ssthresh(), INFINITE_SSTHRESH);

        assert!(r.on_segment_sent(0, now).is_err());
        Ok(())
    }

    #[test]
    fn ack_takes_rtt_sample() {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 10, now);
        let mut h = TestHandler::default();

        let now = now + Duration::from_millis(100);
        let outcome = r.on_ack(&new_test_ack(2, &[]), &mut h, now);
        assert!(outcome.data_acked());
        assert!(!outcome.loss_detected());
        assert_eq!(outcome.acked, 2);
        assert_eq!(r.packets_out(), 8);
        assert_eq!(r.snd_una(), SeqNum(2 * MSS));

        // First sample: srtt 100, rttvar 4 * 100.
        assert_eq!(r.rtt().smoothed_rtt(), Duration::from_millis(100));
        assert_eq!(r.rto(), Duration::from_millis(500));
        assert_eq!(r.timer(Timer::Retransmit), Some(now + Duration::from_millis(500)));

        // Slow start: one segment per ACK while the window is full.
        assert_eq!(r.current_cwnd(), 11);
        assert_eq!(r.ca_state(), CaState::Open);
        assert_eq!(r.stats().srtt, 100);

        // Everything acknowledged stops the timer.
        r.on_ack(&new_test_ack(10, &[]), &mut h, now);
        assert_eq!(r.packets_out(), 0);
        assert_eq!(r.timer(Timer::Retransmit), None);
        assert!(h.retransmitted.is_empty());
    }

    #[test]
    fn ack_beyond_snd_nxt_ignored() {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 2, now);
        let mut h = TestHandler::default();

        let outcome = r.on_ack(&new_test_ack(5, &[]), &mut h, now);
        assert!(outcome.ignored);
        assert_eq!(r.packets_out(), 2);
        assert_eq!(r.snd_una(), SeqNum(0));
        assert_eq!(r.stats().acks_ignored, 1);
    }

    #[test]
    fn old_ack_only_sacks() {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 6, now);
        let mut h = TestHandler::default();

        r.on_ack(&new_test_ack(2, &[]), &mut h, now);
        assert_eq!(r.snd_una(), SeqNum(2 * MSS));

        // A reordered older ACK still carries valid SACK information.
        let outcome = r.on_ack(&new_test_ack(1, &[(4, 5)]), &mut h, now);
        assert!(outcome.ignored);
        assert!(outcome.flags.contains(AckFlag::DataSacked));
        assert_eq!(r.snd_una(), SeqNum(2 * MSS));
        assert_eq!(r.sacked_out(), 1);
        assert_eq!(r.ca_state(), CaState::Open);
        assert_eq!(r.stats().old_acks, 1);
        check_counters(&r);
    }

    #[test]
    fn window_update() {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 2, now);
        let mut h = TestHandler::default();

        // Same segment sequence, same window: not an update.
        let outcome = r.on_ack(&new_test_ack(0, &[]), &mut h, now);
        assert!(!outcome.window_updated());

        // A larger window with the same sequence is an update.
        let mut ack = new_test_ack(0, &[]);
        ack.window = 2 * WINDOW;
        let outcome = r.on_ack(&ack, &mut h, now);
        assert!(outcome.window_updated());
        assert_eq!(r.snd_wnd(), 2 * WINDOW);

        // A smaller window from an older segment is refused.
        let mut ack = new_test_ack(0, &[]);
        ack.seq = SeqNum(0) - 1;
        ack.window = 100;
        r.on_ack(&ack, &mut h, now);
        assert_eq!(r.snd_wnd(), 2 * WINDOW);

        // A newer segment may shrink it.
        let mut ack = new_test_ack(0, &[]);
        ack.seq = SeqNum(10);
        ack.window = 100;
        let outcome = r.on_ack(&ack, &mut h, now);
        assert!(outcome.window_updated());
        assert_eq!(r.snd_wnd(), 100);
    }

    #[test]
    fn karn_without_timestamps() {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 3, now);
        let mut h = TestHandler::default();

        // The timeout retransmits the head.
        let later = now + RTO_INITIAL_TEST;
        r.on_rto_timeout(&mut h, later);
        assert_eq!(h.retransmitted, vec![SeqNum(0)]);

        // Its ACK does not produce a sample.
        r.on_ack(&new_test_ack(1, &[]), &mut h, later + Duration::from_millis(50));
        assert!(!r.rtt().has_sample());
    }

    #[test]
    fn rtt_from_timestamps() {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 3, now);
        let mut h = TestHandler::default();

        let later = now + RTO_INITIAL_TEST;
        r.on_rto_timeout(&mut h, later);

        // The echoed timestamp disambiguates the retransmission.
        let tsecr = r.timestamp(later);
        let ack = new_test_ack(1, &[]).with_timestamp(1, tsecr);
        r.on_ack(&ack, &mut h, later + Duration::from_millis(40));
        assert!(r.rtt().has_sample());
        assert_eq!(r.rtt().latest_rtt(), Duration::from_millis(40));
        assert_eq!(r.backoff(), 0);
    }

    #[test]
    fn rto_timeout() {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 5, now);
        let mut h = TestHandler::default();

        // Not yet due.
        r.on_rto_timeout(&mut h, now + Duration::from_millis(10));
        assert_eq!(r.ca_state(), CaState::Open);

        let later = now + RTO_INITIAL_TEST;
        r.on_rto_timeout(&mut h, later);
        assert_eq!(r.ca_state(), CaState::Loss);
        assert_eq!(r.current_cwnd(), 1);
        assert_eq!(r.current_ssthresh(), 2);
        assert_eq!(r.lost_out(), 5);
        assert!(r.segments().all(|s| s.tag.is_lost()));
        assert_eq!(r.segments().next().map(|s| s.tag), Some(SackTag::LostRetrans));
        assert_eq!(h.retransmitted, vec![SeqNum(0)]);
        assert_eq!(r.retransmits(), 1);
        assert_eq!(r.backoff(), 1);
        assert_eq!(r.stats().timeouts, 1);
        assert_eq!(r.undo_marker(), Some(SeqNum(0)));

        // The timeout is doubled.
        assert_eq!(r.rto(), 2 * RTO_INITIAL_TEST);
        assert_eq!(r.timer(Timer::Retransmit), Some(later + 2 * RTO_INITIAL_TEST));
        check_counters(&r);

        // A second timeout in Loss does not count as a new failure.
        let later = later + 2 * RTO_INITIAL_TEST;
        r.on_rto_timeout(&mut h, later);
        assert_eq!(r.retransmits(), 2);
        assert_eq!(r.stats().timeouts, 1);
        assert_eq!(r.stats().loss_failures, 0);
        assert_eq!(r.rto(), 4 * RTO_INITIAL_TEST);
        // The head was retransmitted before, nothing left to undo.
        assert_eq!(r.undo_marker(), None);
    }

    #[test]
    fn rto_timeout_retransmit_failure() {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 2, now);
        let mut h = TestHandler {
            fail: true,
            ..Default::default()
        };

        let later = now + RTO_INITIAL_TEST;
        r.on_rto_timeout(&mut h, later);
        assert_eq!(r.ca_state(), CaState::Loss);
        assert_eq!(r.retransmits(), 1);
        assert_eq!(r.backoff(), 0);
        assert_eq!(r.rto(), RTO_INITIAL_TEST);
        assert_eq!(r.timer(Timer::Retransmit), Some(later + RESOURCE_PROBE_INTERVAL));
        assert_eq!(r.retrans_out(), 0);
    }

    #[test]
    fn stale_rto_timer_never_fires() {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 2, now);
        let mut h = TestHandler::default();

        r.on_ack(&new_test_ack(2, &[]), &mut h, now);
        assert_eq!(r.timer(Timer::Retransmit), None);

        r.on_rto_timeout(&mut h, now + RTO_INITIAL_TEST);
        assert_eq!(r.ca_state(), CaState::Open);
        assert!(h.retransmitted.is_empty());
    }

    #[test]
    fn zero_window_probe() {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 1, now);
        let mut h = TestHandler::default();

        // Everything acknowledged, the window closes.
        let mut ack = new_test_ack(1, &[]);
        ack.seq = SeqNum(1);
        ack.window = 0;
        r.on_ack(&ack, &mut h, now);
        assert_eq!(r.snd_wnd(), 0);

        r.set_send_head(Some(MSS), now);
        let rto = r.rto();
        let deadline = now + rto;
        assert_eq!(r.timer(Timer::Probe), Some(deadline));
        assert_eq!(r.timeout(), Some(deadline));

        r.on_timeout(&mut h, deadline);
        assert_eq!(h.probes, 1);
        assert_eq!(r.probes_out(), 1);
        assert_eq!(r.backoff(), 1);
        assert_eq!(r.timer(Timer::Probe), Some(deadline + 2 * rto));

        // The window opens again.
        let mut ack = new_test_ack(1, &[]);
        ack.seq = SeqNum(2);
        ack.window = WINDOW;
        r.on_ack(&ack, &mut h, deadline);
        assert_eq!(r.probes_out(), 0);
        assert_eq!(r.backoff(), 0);
        assert_eq!(r.timer(Timer::Probe), None);
    }

    #[test]
    fn cwnd_not_raised_when_not_limited() {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 4, now);
        let mut h = TestHandler::default();

        // Four segments never filled a window of ten.
        let outcome = r.on_ack(&new_test_ack(2, &[]), &mut h, now);
        assert!(outcome.data_acked());
        assert_eq!(r.current_cwnd(), 10);
        r.on_ack(&new_test_ack(4, &[]), &mut h, now);
        assert_eq!(r.current_cwnd(), 10);
        assert_eq!(r.ca_state(), CaState::Open);
    }

    #[test]
    fn idle_restart() -> Result<()> {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 0, now);
        let mut h = TestHandler::default();

        // Grow the window to 11.
        for _ in 0..10 {
            r.on_segment_sent(MSS, now)?;
        }
        r.on_ack(&new_test_ack(10, &[]), &mut h, now);
        assert_eq!(r.current_cwnd(), 11);

        // Idle for more than two timeouts.
        let rto = r.rto();
        let later = now + rto * 5 / 2;
        r.on_segment_sent(MSS, later)?;
        assert_eq!(r.current_cwnd(), 10);
        assert_eq!(r.current_ssthresh(), INFINITE_SSTHRESH);
        Ok(())
    }

    #[test]
    fn sack_permitted_after_send() {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 1, now);
        assert!(r.set_sack_permitted(false).is_err());

        let mut r = new_test_recovery(&conf, 0, now);
        assert!(r.set_sack_permitted(false).is_ok());
        assert!(!r.is_fack());
    }

    #[test]
    fn qlog_output() -> Result<()> {
        let conf = new_test_config(true);
        let now = Instant::now();
        let mut r = new_test_recovery(&conf, 3, now);
        let mut h = TestHandler::default();

        let file = tempfile::NamedTempFile::new()?;
        r.set_qlog(
            Box::new(file.reopen()?),
            "title".into(),
            "description".into(),
            now,
        );

        r.on_rto_timeout(&mut h, now + RTO_INITIAL_TEST);
        if let Some(qlog) = r.qlog.as_mut() {
            qlog.flush()?;
        }

        let log = std::fs::read_to_string(file.path())?;
        assert!(log.contains(r#""common_fields":{"protocol_type":["TCP"],"time_format":"relative","group_id":"TEST"}"#));
        assert!(log.contains(r#""name":"recovery:parameters_set""#));
        assert!(log.contains(r#""rto_min":200.0"#));
        assert!(log.contains(r#""data":{"old":"open","new":"loss","trigger":"timeout"}"#));
        assert!(log.contains(r#""name":"recovery:segment_retransmitted""#));
        assert!(log.contains(r#""congestion_window":1"#));
        Ok(())
    }
}

mod congestion_state;
pub mod reordering;
pub mod rtt;
mod scheduler;
pub mod scoreboard;
pub(crate) mod timer;
