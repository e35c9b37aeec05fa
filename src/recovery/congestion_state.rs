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

//! The congestion avoidance state machine.
//!
//! A connection is `Open` while nothing looks suspicious, moves to `Disorder`
//! on duplicate ACKs or SACKs, to `Cwr` when the window is reduced by an
//! explicit congestion signal, to `Recovery` when loss is inferred from
//! duplicate acknowledgments, and to `Loss` after a retransmission timeout or
//! receiver reneging. Reductions found to be spurious are undone.

use std::cmp;
use std::time::Instant;

use enumflags2::BitFlags;
use log::*;

use super::AckFlag;
use super::Recovery;
use super::RetransmitHandler;
use super::Timer;
use super::NOT_DUP;
use crate::congestion_control::CaState;
use crate::qlog::events::CongestionStateUpdatedTrigger;
use crate::qlog::events::EventData;
use crate::qlog::events::SegmentsLostTrigger;
use crate::qlog::events::UndoKind;
use crate::recovery::ReorderSource;
use crate::seqnum::SeqNum;

impl Recovery {
    /// React to a dubious ACK: one that is a duplicate, carries SACK or ECN
    /// information, or arrives outside of the Open state.
    pub(super) fn fastretrans_alert(
        &mut self,
        prior_snd_una: SeqNum,
        prior_packets: u32,
        flag: BitFlags<AckFlag>,
        handler: &mut dyn RetransmitHandler,
        now: Instant,
    ) {
        let mut is_dupack = self.snd_una == prior_snd_una && !flag.intersects(NOT_DUP);

        if self.scoreboard.packets_out() == 0 && !self.scoreboard.is_sack() {
            self.scoreboard.reset_reno_sack();
        }
        if flag.contains(AckFlag::Ece) {
            self.window.prior_ssthresh = 0;
        }

        // The receiver discarded data it had SACKed. Nothing in the
        // scoreboard can be trusted.
        if self.scoreboard.sacked_out() > 0 && self.scoreboard.is_reneging() {
            self.stats.sack_reneging += 1;
            warn!(
                "{} receiver reneged on SACKed data at {}",
                self.trace_id, self.snd_una
            );
            self.enter_loss(true, now);
            self.retransmits += 1;
            if let Err(e) = self.retransmit_segment(0, handler, now) {
                trace!("{} head retransmit failed {:?}", self.trace_id, e);
            }
            self.timers
                .set(Timer::Retransmit, now + self.rtt.rto_duration());
            return;
        }

        // SACK reported data above the recovery point.
        if flag.contains(AckFlag::DataLost)
            && self.snd_una.before(self.high_seq)
            && self.ca_state != CaState::Open
            && self.scoreboard.fackets_out() > self.reordering.value()
        {
            let packets = self.scoreboard.fackets_out() - self.reordering.value();
            let lost = self.scoreboard.mark_head_lost(packets, self.high_seq);
            self.stats.loss += 1;
            self.stats.lost += lost as u64;
            self.qlog_segments_lost(lost, SegmentsLostTrigger::ReorderingThreshold, now);
        }

        // Leave the current state once everything up to high_seq is
        // acknowledged.
        if self.ca_state == CaState::Open {
            self.retrans_stamp = None;
        } else if !self.snd_una.before(self.high_seq) {
            match self.ca_state {
                CaState::Loss => {
                    self.retransmits = 0;
                    if self.try_undo_recovery(now) {
                        return;
                    }
                }

                CaState::Cwr => {
                    // Hold CWR until something above high_seq is acknowledged,
                    // so the receiver has seen the flag.
                    if self.snd_una != self.high_seq {
                        self.window.complete_cwr();
                        self.set_ca_state(CaState::Open, CongestionStateUpdatedTrigger::Completed, now);
                    }
                }

                CaState::Disorder => {
                    self.try_undo_dsack(now);
                    // With SACK stay until every duplicate report had a
                    // chance to arrive.
                    if self.undo_marker.is_none()
                        || !self.scoreboard.is_sack()
                        || self.snd_una != self.high_seq
                    {
                        self.undo_marker = None;
                        self.set_ca_state(CaState::Open, CongestionStateUpdatedTrigger::Completed, now);
                    }
                }

                CaState::Recovery => {
                    if !self.scoreboard.is_sack() {
                        self.scoreboard.reset_reno_sack();
                    }
                    if self.try_undo_recovery(now) {
                        return;
                    }
                    self.window.complete_cwr();
                }

                CaState::Open => (),
            }
        }

        match self.ca_state {
            CaState::Recovery => {
                if self.snd_una == prior_snd_una {
                    if !self.scoreboard.is_sack() && is_dupack {
                        let reord = self.scoreboard.add_reno_sack();
                        self.reno_reordering(reord, now);
                    }
                } else {
                    let acked = prior_packets.saturating_sub(self.scoreboard.packets_out());
                    if !self.scoreboard.is_sack() {
                        let reord = self.scoreboard.remove_reno_sacks(acked);
                        self.reno_reordering(reord, now);
                    }
                    is_dupack = self.try_undo_partial(acked, now);
                }
            }

            state => {
                if state == CaState::Loss {
                    if flag.contains(AckFlag::DataAcked) {
                        self.retransmits = 0;
                    }
                    if !self.try_undo_loss(now) {
                        self.window.moderate(self.in_flight(), self.max_burst);
                        self.xmit_retransmit_queue(handler, now);
                        return;
                    }
                    if self.ca_state != CaState::Open {
                        return;
                    }
                }

                // Open, Disorder or Cwr, or a Loss episode just undone.
                if !self.scoreboard.is_sack() {
                    if self.snd_una != prior_snd_una {
                        self.scoreboard.reset_reno_sack();
                    }
                    if is_dupack {
                        let reord = self.scoreboard.add_reno_sack();
                        self.reno_reordering(reord, now);
                    }
                }

                if self.ca_state == CaState::Disorder {
                    self.try_undo_dsack(now);
                }

                if !self.time_to_recover(now) {
                    self.try_to_open(flag, now);
                    return;
                }

                self.enter_recovery(flag, now);
            }
        }

        let ts = self.timestamp(now);
        if is_dupack || self.scoreboard.head_timed_out(ts, self.rtt.rto()) {
            self.update_scoreboard(now);
        }
        self.window.cwnd_down(self.in_flight());
        self.xmit_retransmit_queue(handler, now);
    }

    /// Decide whether to start fast retransmit. The order of the checks
    /// matters.
    pub(super) fn time_to_recover(&self, now: Instant) -> bool {
        let reordering = self.reordering.value();

        // Loss was already inferred.
        if self.scoreboard.lost_out() > 0 {
            return true;
        }

        // Classic dupack or FACK threshold.
        if self.scoreboard.fackets_for_recovery() > reordering {
            return true;
        }

        // The head was not acknowledged for too long.
        if self
            .scoreboard
            .head_timed_out(self.timestamp(now), self.rtt.rto())
        {
            return true;
        }

        // A short window cannot produce enough duplicate ACKs. Recover when
        // half of it was SACKed and nothing new can be sent.
        let packets_out = self.scoreboard.packets_out();
        if packets_out <= reordering
            && self.scoreboard.sacked_out()
                >= cmp::max(packets_out / 2, self.reordering.default_value())
            && !self.may_send_now()
        {
            return true;
        }

        false
    }

    /// Leave or stay out of recovery on an ACK that does not start it.
    pub(super) fn try_to_open(&mut self, flag: BitFlags<AckFlag>, now: Instant) {
        if self.scoreboard.retrans_out() == 0 {
            self.retrans_stamp = None;
        }

        if flag.contains(AckFlag::Ece) {
            self.enter_cwr(now);
        }

        if self.ca_state != CaState::Cwr {
            let (state, trigger) = if self.scoreboard.left_out() > 0
                || self.scoreboard.retrans_out() > 0
                || self.undo_marker.is_some()
            {
                let trigger = if flag.contains(AckFlag::DataSacked) {
                    CongestionStateUpdatedTrigger::Sack
                } else {
                    CongestionStateUpdatedTrigger::DuplicateAck
                };
                (CaState::Disorder, trigger)
            } else {
                (CaState::Open, CongestionStateUpdatedTrigger::Completed)
            };

            if self.ca_state != state {
                self.set_ca_state(state, trigger, now);
                self.high_seq = self.snd_nxt;
            }
            self.window.moderate(self.in_flight(), self.max_burst);
        } else {
            self.window.cwnd_down(self.in_flight());
        }
    }

    /// Start fast recovery.
    fn enter_recovery(&mut self, flag: BitFlags<AckFlag>, now: Instant) {
        let trigger = if self.scoreboard.is_sack() {
            self.stats.sack_recovery += 1;
            CongestionStateUpdatedTrigger::Sack
        } else {
            self.stats.reno_recovery += 1;
            CongestionStateUpdatedTrigger::DuplicateAck
        };

        self.high_seq = self.snd_nxt;
        self.window.prior_ssthresh = 0;
        self.undo_marker = Some(self.snd_una);
        self.undo_retrans = self.scoreboard.retrans_out() as i32;

        if self.ca_state < CaState::Cwr {
            if !flag.contains(AckFlag::Ece) {
                self.window.prior_ssthresh = self.window.current_ssthresh(self.ca_state);
            }
            self.window.ssthresh = self.congestion.ssthresh(&self.window, self.in_flight());
            self.queue_cwr();
        }

        self.window.cnt = 0;
        self.set_ca_state(CaState::Recovery, trigger, now);
    }

    /// Mark lost segments at the head of the queue.
    pub(super) fn update_scoreboard(&mut self, now: Instant) {
        let packets = if self.is_fack() {
            cmp::max(
                self.scoreboard
                    .fackets_out()
                    .saturating_sub(self.reordering.value()),
                1,
            )
        } else {
            1
        };
        let lost = self.scoreboard.mark_head_lost(packets, self.high_seq);
        self.stats.lost += lost as u64;
        self.qlog_segments_lost(lost, SegmentsLostTrigger::ReorderingThreshold, now);

        let ts = self.timestamp(now);
        let rto = self.rtt.rto();
        if self.scoreboard.head_timed_out(ts, rto) {
            let lost = self.scoreboard.mark_timed_out(ts, rto);
            self.stats.lost += lost as u64;
            self.qlog_segments_lost(lost, SegmentsLostTrigger::HeadTimedOut, now);
        }
    }

    /// Collapse the window after a retransmission timeout or reneging.
    pub(super) fn enter_loss(&mut self, reneging: bool, now: Instant) {
        if self.ca_state <= CaState::Disorder
            || self.snd_una == self.high_seq
            || (self.ca_state == CaState::Loss && self.retransmits == 0)
        {
            self.window.prior_ssthresh = self.window.current_ssthresh(self.ca_state);
            self.window.ssthresh = self.congestion.ssthresh(&self.window, self.in_flight());
        }
        self.window.cwnd = 1;
        self.window.cnt = 0;

        self.undo_retrans = 0;
        self.undo_marker = None;
        // A plain timeout may be undone if nothing was retransmitted yet.
        if !reneging {
            self.undo_marker = Some(self.snd_una);
        }

        let prior_lost = self.scoreboard.lost_out();
        if self.scoreboard.enter_loss(reneging) {
            self.undo_marker = None;
        }
        let lost = self.scoreboard.lost_out().saturating_sub(prior_lost);
        self.stats.lost += lost as u64;

        self.reordering.reset_on_loss();

        let (trigger, lost_trigger) = if reneging {
            (
                CongestionStateUpdatedTrigger::Reneging,
                SegmentsLostTrigger::Reneging,
            )
        } else {
            (
                CongestionStateUpdatedTrigger::Timeout,
                SegmentsLostTrigger::Timeout,
            )
        };
        self.qlog_segments_lost(lost, lost_trigger, now);
        self.set_ca_state(CaState::Loss, trigger, now);
        self.high_seq = self.snd_nxt;
        self.queue_cwr();
    }

    /// Reduce the window on an explicit congestion signal.
    pub(super) fn enter_cwr(&mut self, now: Instant) {
        self.window.prior_ssthresh = 0;
        if self.ca_state >= CaState::Cwr {
            return;
        }

        self.undo_marker = None;
        self.window.ssthresh = self.congestion.ssthresh(&self.window, self.in_flight());
        self.window.cwnd = cmp::min(self.window.cwnd, self.in_flight() + 1);
        self.window.cnt = 0;
        self.high_seq = self.snd_nxt;
        self.queue_cwr();
        self.set_ca_state(CaState::Cwr, CongestionStateUpdatedTrigger::Ecn, now);
    }

    fn queue_cwr(&mut self) {
        if self.ecn {
            self.cwr_pending = true;
        }
    }

    /// Whether no retransmission was necessary: every retransmission was
    /// reported as a duplicate, or the original segment is known to have
    /// arrived first.
    fn may_undo(&self) -> bool {
        self.undo_marker.is_some() && (self.undo_retrans == 0 || self.packet_delayed())
    }

    /// The peer echoed a timestamp older than the first retransmission, so
    /// the ACK was triggered by an original transmission.
    fn packet_delayed(&self) -> bool {
        match (self.retrans_stamp, self.rcv_tsecr) {
            (None, _) => true,
            (Some(stamp), Some(tsecr)) => tsecr != 0 && (tsecr.wrapping_sub(stamp) as i32) < 0,
            (Some(_), None) => false,
        }
    }

    fn undo_cwr(&mut self, restore_ssthresh: bool) {
        if self.window.undo(restore_ssthresh) {
            self.cwr_pending = false;
        }
        self.window.moderate(self.in_flight(), self.max_burst);
    }

    fn qlog_undone(&mut self, kind: UndoKind, now: Instant) {
        debug!(
            "{} undo {:?} cwnd={} ssthresh={}",
            self.trace_id,
            kind,
            self.window.cwnd(),
            self.window.ssthresh()
        );
        let ev_data = EventData::RecoverySpuriousCongestionUndone {
            kind,
            congestion_window: self.window.cwnd(),
            ssthresh: self.window.ssthresh(),
        };
        self.qlog_event(now, ev_data);
    }

    /// Finish a Recovery or Loss episode, undoing it if it was spurious.
    /// Return true if the state must be held.
    fn try_undo_recovery(&mut self, now: Instant) -> bool {
        let mut undone = false;
        if self.may_undo() {
            self.undo_cwr(true);
            let kind = if self.ca_state == CaState::Loss {
                self.stats.loss_undo += 1;
                UndoKind::Loss
            } else {
                self.stats.full_undo += 1;
                UndoKind::Full
            };
            self.undo_marker = None;
            self.qlog_undone(kind, now);
            undone = true;
        }

        // Without SACK hold the state until something above high_seq is
        // acknowledged, duplicate ACKs for it may still arrive.
        if self.snd_una == self.high_seq && !self.scoreboard.is_sack() {
            self.window.moderate(self.in_flight(), self.max_burst);
            return true;
        }

        let trigger = if undone {
            CongestionStateUpdatedTrigger::Undo
        } else {
            CongestionStateUpdatedTrigger::Completed
        };
        self.set_ca_state(CaState::Open, trigger, now);
        false
    }

    /// Undo when duplicate SACKs proved every retransmission redundant.
    pub(super) fn try_undo_dsack(&mut self, now: Instant) {
        if self.undo_marker.is_some() && self.undo_retrans == 0 {
            self.undo_cwr(true);
            self.undo_marker = None;
            self.stats.dsack_undo += 1;
            self.qlog_undone(UndoKind::Dsack, now);
        }
    }

    /// Undo partially on a partial ACK during Recovery. Return true if fast
    /// retransmit must go on as if a duplicate ACK had arrived.
    fn try_undo_partial(&mut self, acked: u32, now: Instant) -> bool {
        let mut failed = !self.scoreboard.is_sack()
            || self.scoreboard.fackets_out() > self.reordering.value();

        if self.may_undo() {
            // The ACK was for an original transmission, the network only
            // reordered it.
            if self.scoreboard.retrans_out() == 0 {
                self.retrans_stamp = None;
            }
            let metric = self.scoreboard.fackets_for_recovery() + acked;
            self.update_reordering(metric, true, now);
            self.undo_cwr(false);
            self.stats.partial_undo += 1;
            self.qlog_undone(UndoKind::Partial, now);
            failed = false;
        }
        failed
    }

    /// Undo a spurious retransmission timeout.
    fn try_undo_loss(&mut self, now: Instant) -> bool {
        if !self.may_undo() {
            return false;
        }

        self.scoreboard.clear_lost();
        self.undo_cwr(true);
        self.stats.loss_undo += 1;
        self.retransmits = 0;
        self.undo_marker = None;
        self.qlog_undone(UndoKind::Loss, now);
        if self.scoreboard.is_sack() {
            self.set_ca_state(CaState::Open, CongestionStateUpdatedTrigger::Undo, now);
        }
        true
    }

    /// Raise the reordering threshold to `metric`.
    pub(super) fn update_reordering(&mut self, metric: u32, timestamp: bool, now: Instant) {
        let source = self.reordering.source(self.scoreboard.is_sack(), timestamp);
        let old = match self.reordering.update(metric) {
            Some(old) => old,
            None => return,
        };

        match source {
            ReorderSource::Timestamp => self.stats.ts_reorder += 1,
            ReorderSource::Reno => self.stats.reno_reorder += 1,
            ReorderSource::Fack => self.stats.fack_reorder += 1,
            ReorderSource::Sack => self.stats.sack_reorder += 1,
        }
        debug!(
            "{} reordering {} -> {} source={} fackets={} sacked={} undo_retrans={}",
            self.trace_id,
            old,
            self.reordering.value(),
            source,
            self.scoreboard.fackets_out(),
            self.scoreboard.sacked_out(),
            self.undo_retrans
        );

        let ev_data = EventData::RecoveryReorderingUpdated {
            old,
            new: self.reordering.value(),
            source,
        };
        self.qlog_event(now, ev_data);
    }

    fn reno_reordering(&mut self, metric: Option<u32>, now: Instant) {
        if let Some(metric) = metric {
            self.update_reordering(metric, false, now);
        }
    }

    pub(super) fn set_ca_state(
        &mut self,
        state: CaState,
        trigger: CongestionStateUpdatedTrigger,
        now: Instant,
    ) {
        if self.ca_state == state {
            return;
        }

        debug!(
            "{} state {} -> {} ({:?}) cwnd={} ssthresh={} inflight={}",
            self.trace_id,
            self.ca_state,
            state,
            trigger,
            self.window.cwnd(),
            self.window.ssthresh(),
            self.in_flight()
        );

        let ev_data = EventData::RecoveryCongestionStateUpdated {
            old: Some(self.ca_state),
            new: state,
            trigger: Some(trigger),
        };
        self.ca_state = state;
        self.qlog_event(now, ev_data);
    }
}
