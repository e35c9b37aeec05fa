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

//! The retransmission queue and its SACK scoreboard.

use std::cmp;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

use crate::seqnum::SeqNum;

/// Maximum number of SACK blocks carried by a single ACK.
pub const MAX_SACK_BLOCKS: usize = 4;

/// Scoreboard state of an outstanding segment.
///
/// A segment may be selectively acknowledged, presumed lost, and have a
/// retransmission in flight. Lost and SACKed are mutually exclusive, which
/// leaves six legal states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SackTag {
    /// Sent once, no news about it yet.
    #[default]
    InFlight,

    /// Reported by a SACK block.
    Sacked,

    /// Presumed lost and not retransmitted since.
    Lost,

    /// Retransmitted without having been presumed lost (forward
    /// retransmission or RTO head), retransmission still in flight.
    RetransInFlight,

    /// SACKed while a retransmission of it is still in flight.
    SackedRetrans,

    /// Presumed lost and retransmitted, retransmission in flight.
    LostRetrans,
}

impl SackTag {
    /// Whether the segment is counted in `sacked_out`.
    pub fn is_sacked(self) -> bool {
        matches!(self, SackTag::Sacked | SackTag::SackedRetrans)
    }

    /// Whether the segment is counted in `lost_out`.
    pub fn is_lost(self) -> bool {
        matches!(self, SackTag::Lost | SackTag::LostRetrans)
    }

    /// Whether a retransmission of the segment is in flight, i.e. it is
    /// counted in `retrans_out`.
    pub fn is_retrans(self) -> bool {
        matches!(
            self,
            SackTag::RetransInFlight | SackTag::SackedRetrans | SackTag::LostRetrans
        )
    }

    /// Tag after the segment has been retransmitted.
    fn retransmitted(self) -> SackTag {
        match self {
            SackTag::InFlight => SackTag::RetransInFlight,
            SackTag::Lost => SackTag::LostRetrans,
            other => other,
        }
    }

    /// Tag after a SACK block covered the segment.
    fn sacked(self) -> SackTag {
        match self {
            // The retransmission of a lost segment is what arrived.
            SackTag::LostRetrans => SackTag::Sacked,
            // The original arrived; the retransmission is still in flight.
            SackTag::RetransInFlight => SackTag::SackedRetrans,
            SackTag::InFlight | SackTag::Lost => SackTag::Sacked,
            other => other,
        }
    }

    /// Tag after the LOST mark is withdrawn.
    fn unlost(self) -> SackTag {
        match self {
            SackTag::Lost => SackTag::InFlight,
            SackTag::LostRetrans => SackTag::RetransInFlight,
            other => other,
        }
    }
}

/// An outstanding transmitted byte range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentRecord {
    /// First sequence number of the segment.
    pub seq: SeqNum,

    /// Sequence number following the last byte of the segment.
    pub end_seq: SeqNum,

    /// Scoreboard state.
    pub tag: SackTag,

    /// Whether the segment has ever been retransmitted.
    pub ever_retrans: bool,

    /// The value of `snd_nxt` at the most recent retransmission. Only
    /// meaningful if `ever_retrans` is set.
    pub ack_seq: SeqNum,

    /// Timestamp of the last (re)transmission in milliseconds.
    pub when: u32,
}

impl SegmentRecord {
    pub fn new(seq: SeqNum, end_seq: SeqNum, when: u32) -> Self {
        SegmentRecord {
            seq,
            end_seq,
            tag: SackTag::InFlight,
            ever_retrans: false,
            ack_seq: seq,
            when,
        }
    }

    /// Length of the segment in bytes.
    pub fn len(&self) -> u32 {
        self.end_seq - self.seq
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the record was retransmitted at some point, either currently
    /// in flight or earlier.
    fn any_retrans(&self) -> bool {
        self.ever_retrans || self.tag.is_retrans()
    }

    fn timed_out(&self, now: u32, rto: u32) -> bool {
        now.wrapping_sub(self.when) > rto
    }
}

/// A selective acknowledgment block `[start_seq, end_seq)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SackBlock {
    pub start_seq: SeqNum,
    pub end_seq: SeqNum,
}

impl SackBlock {
    pub fn new(start_seq: u32, end_seq: u32) -> Self {
        SackBlock {
            start_seq: SeqNum(start_seq),
            end_seq: SeqNum(end_seq),
        }
    }

    /// Whether the block fully covers `[seq, end_seq)`.
    fn covers(&self, seq: SeqNum, end_seq: SeqNum) -> bool {
        !self.start_seq.after(seq) && !self.end_seq.before(end_seq)
    }
}

/// How a duplicate SACK was recognised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DsackKind {
    /// The first block lies below the cumulative ACK.
    BelowAck,

    /// The first block lies inside the second block.
    OutOfOrder,
}

/// Connection state consulted while tagging SACK blocks.
#[derive(Clone, Debug)]
pub struct SackContext {
    /// The cumulative ACK carried by the segment.
    pub ack: SeqNum,

    /// `snd_una` before this ACK.
    pub prior_snd_una: SeqNum,

    /// `snd_una` after this ACK.
    pub snd_una: SeqNum,

    pub snd_nxt: SeqNum,

    pub high_seq: SeqNum,

    pub undo_marker: Option<SeqNum>,

    /// Largest window ever advertised by the peer.
    pub max_window: u32,

    /// Whether the connection is in the Recovery state.
    pub in_recovery: bool,

    /// Whether the connection is in the Loss state.
    pub in_loss: bool,

    /// Whether FACK loss accounting is in use.
    pub fack: bool,

    pub reordering: u32,

    pub mss: u32,
}

/// Summary of a SACK tagging pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SackOutcome {
    /// At least one segment became SACKed.
    pub data_sacked: bool,

    /// A block reported data above `high_seq`.
    pub data_lost: bool,

    /// Change to apply to `undo_retrans`.
    pub undo_retrans_delta: i32,

    /// Reordering distance implied by the SACK, if any.
    pub reordering: Option<u32>,

    /// Set if the first block was a duplicate SACK.
    pub dsack: Option<DsackKind>,

    /// Number of retransmissions found lost.
    pub lost_retransmits: u32,

    /// Number of blocks dropped as invalid.
    pub discarded: u32,

    /// The ACK was too old for its SACK information to be trusted.
    pub too_old: bool,
}

/// Summary of the removal of cumulatively acknowledged segments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AckedSegments {
    /// Number of removed segments.
    pub acked: u32,

    /// Whether a removed segment had been retransmitted.
    pub retrans_acked: bool,

    /// RTT sample taken from a never retransmitted segment (Karn).
    pub seq_rtt: Option<u32>,

    /// Counters had drifted and were reset once the queue drained.
    pub resynced: bool,
}

/// The retransmission queue with per-segment SACK tags and the aggregate
/// counters derived from them.
///
/// Without SACK, `sacked_out` does not count tagged segments; it counts
/// duplicate ACKs instead (Reno emulation).
#[derive(Debug, Default)]
pub struct Scoreboard {
    /// Outstanding segments, oldest first.
    segments: VecDeque<SegmentRecord>,

    sacked_out: u32,

    lost_out: u32,

    retrans_out: u32,

    /// Position of the forward-most SACKed segment, counted from the head.
    fackets_out: u32,

    /// Whether the peer supports SACK.
    sack: bool,
}

impl Scoreboard {
    pub fn new(sack: bool) -> Self {
        Scoreboard {
            sack,
            ..Default::default()
        }
    }

    /// Whether the SACK scoreboard is used instead of dupack counting.
    pub fn is_sack(&self) -> bool {
        self.sack
    }

    pub(crate) fn set_sack(&mut self, sack: bool) {
        self.sack = sack;
    }

    /// Append a newly transmitted segment.
    pub fn push(&mut self, record: SegmentRecord) {
        self.segments.push_back(record);
    }

    pub fn packets_out(&self) -> u32 {
        self.segments.len() as u32
    }

    pub fn sacked_out(&self) -> u32 {
        self.sacked_out
    }

    pub fn lost_out(&self) -> u32 {
        self.lost_out
    }

    pub fn retrans_out(&self) -> u32 {
        self.retrans_out
    }

    pub fn fackets_out(&self) -> u32 {
        self.fackets_out
    }

    /// Segments that left the network without being acknowledged
    /// cumulatively.
    pub fn left_out(&self) -> u32 {
        self.sacked_out + self.lost_out
    }

    /// Segments believed to be in the network.
    pub fn in_flight(&self) -> u32 {
        (self.packets_out() + self.retrans_out).saturating_sub(self.left_out())
    }

    /// Forward-most SACKed position used for loss detection. Reno pretends
    /// the segment after the duplicate ACK point was received.
    pub fn fackets_for_recovery(&self) -> u32 {
        if self.sack {
            self.fackets_out
        } else {
            self.sacked_out + 1
        }
    }

    pub fn head(&self) -> Option<&SegmentRecord> {
        self.segments.front()
    }

    pub fn get(&self, idx: usize) -> Option<&SegmentRecord> {
        self.segments.get(idx)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Iterate outstanding segments in send order.
    pub fn iter(&self) -> impl Iterator<Item = &SegmentRecord> {
        self.segments.iter()
    }

    /// Index of the first segment ending after `high_seq`.
    pub fn high_seq_cut(&self, high_seq: SeqNum) -> usize {
        self.segments
            .partition_point(|r| !r.end_seq.after(high_seq))
    }

    fn count(&mut self, tag: SackTag) {
        if tag.is_sacked() {
            self.sacked_out += 1;
        }
        if tag.is_lost() {
            self.lost_out += 1;
        }
        if tag.is_retrans() {
            self.retrans_out += 1;
        }
    }

    fn uncount(&mut self, tag: SackTag) {
        if tag.is_sacked() {
            self.sacked_out = self.sacked_out.saturating_sub(1);
        }
        if tag.is_lost() {
            self.lost_out = self.lost_out.saturating_sub(1);
        }
        if tag.is_retrans() {
            self.retrans_out = self.retrans_out.saturating_sub(1);
        }
    }

    /// Move a segment to a new tag, keeping the counters consistent.
    fn retag(&mut self, idx: usize, tag: SackTag) {
        let old = self.segments[idx].tag;
        if old == tag {
            return;
        }
        self.uncount(old);
        self.count(tag);
        self.segments[idx].tag = tag;
    }

    /// Record a retransmission of the segment at `idx`.
    pub(crate) fn mark_retransmitted(&mut self, idx: usize, snd_nxt: SeqNum, now: u32) {
        let tag = self.segments[idx].tag.retransmitted();
        self.retag(idx, tag);

        let rec = &mut self.segments[idx];
        rec.ever_retrans = true;
        rec.ack_seq = snd_nxt;
        rec.when = now;
    }

    /// Process the SACK blocks of an ACK.
    pub fn apply_sack(&mut self, blocks: &[SackBlock], ctx: &SackContext) -> SackOutcome {
        let mut out = SackOutcome::default();

        if self.sacked_out == 0 {
            self.fackets_out = 0;
        }
        let prior_fackets = self.fackets_out;
        let mut reord = self.packets_out();
        let mut lost_retrans: Option<SeqNum> = None;
        let blocks = &blocks[..cmp::min(blocks.len(), MAX_SACK_BLOCKS)];

        for (i, block) in blocks.iter().enumerate() {
            let mut dup_sack = false;

            if i == 0 {
                if block.start_seq.before(ctx.ack) {
                    dup_sack = true;
                    out.dsack = Some(DsackKind::BelowAck);
                } else if let Some(next) = blocks.get(1) {
                    if !block.end_seq.after(next.end_seq) && !block.start_seq.before(next.start_seq)
                    {
                        dup_sack = true;
                        out.dsack = Some(DsackKind::OutOfOrder);
                    }
                }

                // Duplicate report for data that already left the queue.
                if dup_sack && !block.end_seq.after(ctx.prior_snd_una) {
                    if let Some(marker) = ctx.undo_marker {
                        if block.end_seq.after(marker) {
                            out.undo_retrans_delta -= 1;
                        }
                    }
                }

                if ctx.ack.before(ctx.prior_snd_una - ctx.max_window) {
                    out.too_old = true;
                    return out;
                }
            }

            if !block.end_seq.after(block.start_seq) || block.end_seq.after(ctx.snd_nxt) {
                out.discarded += 1;
                continue;
            }

            if block.end_seq.after(ctx.high_seq) {
                out.data_lost = true;
            }

            for idx in 0..self.segments.len() {
                let rec = &self.segments[idx];
                if !rec.seq.before(block.end_seq) {
                    break;
                }

                let fack_count = idx as u32 + 1;
                let in_sack = block.covers(rec.seq, rec.end_seq);
                let tag = rec.tag;
                let any_retrans = rec.any_retrans();

                if dup_sack && in_sack && any_retrans {
                    if let Some(marker) = ctx.undo_marker {
                        if rec.end_seq.after(marker) {
                            out.undo_retrans_delta -= 1;
                        }
                    }
                }

                // Acknowledged by this ACK, about to be dropped.
                if !rec.end_seq.after(ctx.snd_una) {
                    if any_retrans {
                        if dup_sack && in_sack && tag.is_sacked() {
                            reord = cmp::min(fack_count, reord);
                        }
                    } else if fack_count < prior_fackets && !tag.is_sacked() {
                        // It was in a hole.
                        reord = cmp::min(fack_count, reord);
                    }
                    continue;
                }

                if tag.is_retrans()
                    && block.end_seq.after(rec.ack_seq)
                    && lost_retrans.map_or(true, |l| block.end_seq.after(l))
                {
                    lost_retrans = Some(block.end_seq);
                }

                if !in_sack {
                    continue;
                }

                if !tag.is_sacked() {
                    if !tag.is_retrans() && !any_retrans && fack_count < prior_fackets {
                        // New SACK for data that was in a hole.
                        reord = cmp::min(fack_count, reord);
                    }

                    self.retag(idx, tag.sacked());
                    out.data_sacked = true;
                    if fack_count > self.fackets_out {
                        self.fackets_out = fack_count;
                    }
                } else if dup_sack && any_retrans {
                    reord = cmp::min(fack_count, reord);
                }

                // The retransmission was redundant.
                if dup_sack && self.segments[idx].tag == SackTag::SackedRetrans {
                    self.retag(idx, SackTag::Sacked);
                }
            }
        }

        if let Some(lost_retrans) = lost_retrans {
            if ctx.in_recovery {
                out.lost_retransmits = self.detect_lost_retransmits(lost_retrans, ctx);
                if out.lost_retransmits > 0 {
                    out.data_sacked = true;
                }
            }
        }

        if reord < self.fackets_out && !ctx.in_loss {
            out.reordering = Some(self.fackets_out + 1 - reord);
        }

        self.check_invariants();
        out
    }

    /// Retransmissions sent before data that is now SACKed were lost again.
    fn detect_lost_retransmits(&mut self, lost_retrans: SeqNum, ctx: &SackContext) -> u32 {
        let mut lost = 0;
        for idx in 0..self.segments.len() {
            let rec = &self.segments[idx];
            if rec.seq.after(lost_retrans) {
                break;
            }
            if !rec.end_seq.after(ctx.snd_una) || !rec.tag.is_retrans() {
                continue;
            }
            if !lost_retrans.after(rec.ack_seq) {
                continue;
            }
            let threshold = rec.ack_seq + ctx.reordering.saturating_mul(ctx.mss);
            if !ctx.fack && lost_retrans.before(threshold) {
                continue;
            }

            let tag = match rec.tag {
                SackTag::RetransInFlight => {
                    lost += 1;
                    SackTag::Lost
                }
                SackTag::LostRetrans => SackTag::Lost,
                SackTag::SackedRetrans => SackTag::Sacked,
                other => other,
            };
            self.retag(idx, tag);
        }
        lost
    }

    /// Mark untagged segments lost among the first `packets` segments that
    /// end at or below `high_seq`. Return the number of newly lost segments.
    pub fn mark_head_lost(&mut self, packets: u32, high_seq: SeqNum) -> u32 {
        let end = cmp::min(packets as usize, self.high_seq_cut(high_seq));
        let mut marked = 0;
        for idx in 0..end {
            if self.segments[idx].tag == SackTag::InFlight {
                self.retag(idx, SackTag::Lost);
                marked += 1;
            }
        }
        marked
    }

    /// Whether the oldest outstanding segment was sent more than `rto` ago.
    pub fn head_timed_out(&self, now: u32, rto: u32) -> bool {
        self.segments
            .front()
            .map_or(false, |r| r.timed_out(now, rto))
    }

    /// Mark timed out untagged segments at the head of the queue lost.
    pub fn mark_timed_out(&mut self, now: u32, rto: u32) -> u32 {
        let mut marked = 0;
        for idx in 0..self.segments.len() {
            if !self.segments[idx].timed_out(now, rto) {
                break;
            }
            if self.segments[idx].tag == SackTag::InFlight {
                self.retag(idx, SackTag::Lost);
                marked += 1;
            }
        }
        marked
    }

    /// Whether the head of the queue is SACKed, meaning the receiver dropped
    /// data it had reported.
    pub fn is_reneging(&self) -> bool {
        self.segments.front().map_or(false, |r| r.tag.is_sacked())
    }

    /// Remove the segments acknowledged by `snd_una`.
    pub fn clean_acked(&mut self, snd_una: SeqNum, now: u32) -> AckedSegments {
        let mut out = AckedSegments::default();

        while let Some(rec) = self.segments.front() {
            if rec.end_seq.after(snd_una) {
                break;
            }

            if rec.any_retrans() {
                out.retrans_acked = true;
                out.seq_rtt = None;
            } else if out.seq_rtt.is_none() {
                out.seq_rtt = Some(now.wrapping_sub(rec.when));
            }

            let tag = rec.tag;
            self.uncount(tag);
            self.fackets_out = self.fackets_out.saturating_sub(1);
            self.segments.pop_front();
            out.acked += 1;
        }

        if self.segments.is_empty()
            && (self.sacked_out != 0 || self.lost_out != 0 || self.retrans_out != 0)
        {
            self.sacked_out = 0;
            self.lost_out = 0;
            self.retrans_out = 0;
            out.resynced = true;
        }
        if self.segments.is_empty() {
            self.fackets_out = 0;
        }

        self.check_invariants();
        out
    }

    /// Retag the whole queue after a retransmission timeout or reneging.
    ///
    /// Every segment becomes lost, except SACKed ones when the receiver is
    /// still trusted. Return whether any segment had been retransmitted.
    pub fn enter_loss(&mut self, reneging: bool) -> bool {
        self.sacked_out = 0;
        self.lost_out = 0;
        self.retrans_out = 0;
        self.fackets_out = 0;

        let mut retransmitted = false;
        for idx in 0..self.segments.len() {
            let rec = &mut self.segments[idx];
            if rec.any_retrans() {
                retransmitted = true;
            }

            let tag = if rec.tag.is_sacked() && !reneging {
                SackTag::Sacked
            } else {
                SackTag::Lost
            };
            rec.tag = tag;
            self.count(tag);
            if tag == SackTag::Sacked {
                self.fackets_out = idx as u32 + 1;
            }
        }

        self.check_invariants();
        retransmitted
    }

    /// Withdraw every LOST mark.
    pub fn clear_lost(&mut self) {
        for idx in 0..self.segments.len() {
            let tag = self.segments[idx].tag.unlost();
            self.retag(idx, tag);
        }
        self.lost_out = 0;
    }

    /// Count a duplicate ACK as a SACKed segment. Return the reordering
    /// distance if the count exceeded what is possible.
    pub fn add_reno_sack(&mut self) -> Option<u32> {
        self.sacked_out += 1;
        self.check_reno_reordering(0)
    }

    /// Account for `acked` segments leaving the queue. The first one is the
    /// segment the duplicate ACKs were waiting for.
    pub fn remove_reno_sacks(&mut self, acked: u32) -> Option<u32> {
        if acked > 0 {
            if acked - 1 >= self.sacked_out {
                self.sacked_out = 0;
            } else {
                self.sacked_out -= acked - 1;
            }
        }
        self.check_reno_reordering(acked)
    }

    pub fn reset_reno_sack(&mut self) {
        self.sacked_out = 0;
    }

    /// More duplicate ACKs than holes allow means the network reordered
    /// segments.
    fn check_reno_reordering(&mut self, addend: u32) -> Option<u32> {
        let packets_out = self.packets_out();
        let holes = cmp::min(cmp::max(self.lost_out, 1), packets_out);

        if self.sacked_out + holes > packets_out {
            self.sacked_out = packets_out - holes;
            return Some(packets_out + addend);
        }
        None
    }

    /// Debug check of the counter invariants.
    pub(crate) fn check_invariants(&self) {
        if !cfg!(debug_assertions) {
            return;
        }

        let (mut sacked, mut lost, mut retrans) = (0, 0, 0);
        for rec in &self.segments {
            sacked += rec.tag.is_sacked() as u32;
            lost += rec.tag.is_lost() as u32;
            retrans += rec.tag.is_retrans() as u32;
        }

        if self.sack {
            debug_assert_eq!(sacked, self.sacked_out, "sacked_out drifted");
        } else {
            debug_assert_eq!(sacked, 0, "SACK tag without SACK");
        }
        debug_assert_eq!(lost, self.lost_out, "lost_out drifted");
        debug_assert_eq!(retrans, self.retrans_out, "retrans_out drifted");
        debug_assert!(self.fackets_out <= self.packets_out());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const MSS: u32 = 1000;

    pub fn new_test_scoreboard(n: u32, sack: bool) -> Scoreboard {
        let mut sb = Scoreboard::new(sack);
        for i in 0..n {
            sb.push(SegmentRecord::new(
                SeqNum(i * MSS),
                SeqNum((i + 1) * MSS),
                0,
            ));
        }
        sb
    }

    fn new_test_context(snd_una: u32, snd_nxt: u32) -> SackContext {
        SackContext {
            ack: SeqNum(snd_una),
            prior_snd_una: SeqNum(snd_una),
            snd_una: SeqNum(snd_una),
            snd_nxt: SeqNum(snd_nxt),
            high_seq: SeqNum(snd_nxt),
            undo_marker: None,
            max_window: 65535,
            in_recovery: false,
            in_loss: false,
            fack: true,
            reordering: 3,
            mss: MSS,
        }
    }

    fn tags(sb: &Scoreboard) -> Vec<SackTag> {
        sb.iter().map(|r| r.tag).collect()
    }

    #[test]
    fn scoreboard_counters() {
        let sb = new_test_scoreboard(10, true);
        assert_eq!(sb.packets_out(), 10);
        assert_eq!(sb.left_out(), 0);
        assert_eq!(sb.in_flight(), 10);
        assert_eq!(sb.head().map(|r| r.len()), Some(MSS));
        assert_eq!(sb.high_seq_cut(SeqNum(3 * MSS)), 3);
        assert_eq!(sb.high_seq_cut(SeqNum(3 * MSS + 1)), 3);
        assert_eq!(sb.high_seq_cut(SeqNum(100 * MSS)), 10);
    }

    #[test]
    fn sack_marks_covered_segments() {
        let mut sb = new_test_scoreboard(10, true);
        let ctx = new_test_context(0, 10 * MSS);

        // Covers segments 2 and 3 fully and segment 4 partially.
        let out = sb.apply_sack(&[SackBlock::new(2 * MSS, 4 * MSS + 500)], &ctx);
        assert!(out.data_sacked);
        assert_eq!(out.dsack, None);
        assert_eq!(sb.sacked_out(), 2);
        assert_eq!(sb.fackets_out(), 4);
        assert_eq!(sb.in_flight(), 8);
        assert_eq!(sb.get(4).map(|r| r.tag), Some(SackTag::InFlight));
        assert_eq!(sb.get(3).map(|r| r.tag), Some(SackTag::Sacked));
    }

    #[test]
    fn sack_idempotent() {
        let mut sb = new_test_scoreboard(10, true);
        let ctx = new_test_context(0, 10 * MSS);
        let blocks = [
            SackBlock::new(6 * MSS, 8 * MSS),
            SackBlock::new(2 * MSS, 4 * MSS),
        ];

        sb.apply_sack(&blocks, &ctx);
        let before = tags(&sb);
        let (sacked, lost) = (sb.sacked_out(), sb.lost_out());

        let out = sb.apply_sack(&blocks, &ctx);
        assert!(!out.data_sacked);
        assert_eq!(tags(&sb), before);
        assert_eq!(sb.sacked_out(), sacked);
        assert_eq!(sb.lost_out(), lost);
    }

    #[test]
    fn sack_clears_lost() {
        let mut sb = new_test_scoreboard(5, true);
        assert_eq!(sb.mark_head_lost(2, SeqNum(5 * MSS)), 2);
        assert_eq!(sb.lost_out(), 2);

        let ctx = new_test_context(0, 5 * MSS);
        sb.apply_sack(&[SackBlock::new(MSS, 2 * MSS)], &ctx);
        assert_eq!(sb.lost_out(), 1);
        assert_eq!(sb.sacked_out(), 1);
        assert_eq!(sb.left_out(), 2);
        assert_eq!(sb.get(1).map(|r| r.tag), Some(SackTag::Sacked));
    }

    #[test]
    fn sack_of_retransmitted_segments() {
        let mut sb = new_test_scoreboard(5, true);
        sb.mark_head_lost(1, SeqNum(5 * MSS));
        sb.mark_retransmitted(0, SeqNum(5 * MSS), 10);
        sb.mark_retransmitted(1, SeqNum(5 * MSS), 10);
        assert_eq!(tags(&sb)[..2], [SackTag::LostRetrans, SackTag::RetransInFlight]);
        assert_eq!(sb.retrans_out(), 2);
        assert_eq!(sb.in_flight(), 6);

        let ctx = new_test_context(0, 5 * MSS);
        sb.apply_sack(&[SackBlock::new(0, 2 * MSS)], &ctx);

        // The lost one is done; the other keeps its retransmission in flight.
        assert_eq!(tags(&sb)[..2], [SackTag::Sacked, SackTag::SackedRetrans]);
        assert_eq!(sb.retrans_out(), 1);
        assert_eq!(sb.lost_out(), 0);
        assert_eq!(sb.sacked_out(), 2);
        assert_eq!(sb.in_flight(), 4);
    }

    #[test]
    fn dsack_below_ack() {
        let mut sb = new_test_scoreboard(5, true);
        sb.mark_retransmitted(0, SeqNum(5 * MSS), 10);

        // Segment 0 was cumulatively acknowledged by this ACK and reported
        // again as a duplicate.
        let mut ctx = new_test_context(MSS, 5 * MSS);
        ctx.ack = SeqNum(MSS);
        ctx.prior_snd_una = SeqNum(0);
        ctx.undo_marker = Some(SeqNum(0));

        let out = sb.apply_sack(&[SackBlock::new(0, MSS)], &ctx);
        assert_eq!(out.dsack, Some(DsackKind::BelowAck));
        assert_eq!(out.undo_retrans_delta, -1);
        assert!(!out.data_sacked);
    }

    #[test]
    fn dsack_already_removed() {
        let mut sb = new_test_scoreboard(4, true);
        let mut ctx = new_test_context(MSS, 5 * MSS);
        ctx.undo_marker = Some(SeqNum(0));

        let out = sb.apply_sack(&[SackBlock::new(0, MSS)], &ctx);
        assert_eq!(out.dsack, Some(DsackKind::BelowAck));
        assert_eq!(out.undo_retrans_delta, -1);

        // No undo bookkeeping without an undo marker.
        ctx.undo_marker = None;
        let out = sb.apply_sack(&[SackBlock::new(0, MSS)], &ctx);
        assert_eq!(out.undo_retrans_delta, 0);
    }

    #[test]
    fn dsack_out_of_order() {
        let mut sb = new_test_scoreboard(10, true);
        let ctx = new_test_context(0, 10 * MSS);
        sb.apply_sack(&[SackBlock::new(4 * MSS, 8 * MSS)], &ctx);

        let out = sb.apply_sack(
            &[
                SackBlock::new(5 * MSS, 6 * MSS),
                SackBlock::new(4 * MSS, 8 * MSS),
            ],
            &ctx,
        );
        assert_eq!(out.dsack, Some(DsackKind::OutOfOrder));
        assert_eq!(sb.sacked_out(), 4);
    }

    #[test]
    fn sack_detects_reordering() {
        let mut sb = new_test_scoreboard(10, true);
        let ctx = new_test_context(0, 10 * MSS);
        sb.apply_sack(&[SackBlock::new(7 * MSS, 8 * MSS)], &ctx);
        assert_eq!(sb.fackets_out(), 8);

        // Segment 2 was in the hole below the forward-most SACK, never
        // retransmitted: it was reordered.
        let out = sb.apply_sack(&[SackBlock::new(2 * MSS, 3 * MSS)], &ctx);
        assert_eq!(out.reordering, Some(8 + 1 - 3));

        // Not reported while in Loss.
        let mut ctx = ctx;
        ctx.in_loss = true;
        let out = sb.apply_sack(&[SackBlock::new(MSS, 2 * MSS)], &ctx);
        assert_eq!(out.reordering, None);
    }

    #[test]
    fn sack_data_lost_above_high_seq() {
        let mut sb = new_test_scoreboard(10, true);
        let mut ctx = new_test_context(0, 10 * MSS);
        ctx.high_seq = SeqNum(5 * MSS);

        let out = sb.apply_sack(&[SackBlock::new(3 * MSS, 4 * MSS)], &ctx);
        assert!(!out.data_lost);
        let out = sb.apply_sack(&[SackBlock::new(5 * MSS, 7 * MSS)], &ctx);
        assert!(out.data_lost);
    }

    #[test]
    fn sack_invalid_blocks() {
        let mut sb = new_test_scoreboard(5, true);
        let ctx = new_test_context(0, 5 * MSS);

        let out = sb.apply_sack(
            &[
                SackBlock::new(2 * MSS, 2 * MSS),
                SackBlock::new(4 * MSS, 9 * MSS),
            ],
            &ctx,
        );
        assert_eq!(out.discarded, 2);
        assert_eq!(sb.sacked_out(), 0);
    }

    #[test]
    fn sack_too_old() {
        let mut sb = new_test_scoreboard(5, true);
        let mut ctx = new_test_context(100_000, 105_000);
        ctx.ack = SeqNum(1000);
        ctx.max_window = 10_000;

        let out = sb.apply_sack(&[SackBlock::new(2 * MSS, 3 * MSS)], &ctx);
        assert!(out.too_old);
        assert_eq!(sb.sacked_out(), 0);
    }

    #[test]
    fn sack_lost_retransmit() {
        let mut sb = new_test_scoreboard(10, true);
        sb.mark_head_lost(1, SeqNum(10 * MSS));
        // Retransmitted when snd_nxt was 10 * MSS.
        sb.mark_retransmitted(0, SeqNum(10 * MSS), 10);
        sb.mark_retransmitted(1, SeqNum(10 * MSS), 10);

        let mut ctx = new_test_context(0, 12 * MSS);
        ctx.in_recovery = true;
        sb.push(SegmentRecord::new(SeqNum(10 * MSS), SeqNum(11 * MSS), 20));
        sb.push(SegmentRecord::new(SeqNum(11 * MSS), SeqNum(12 * MSS), 20));

        // Data sent after the retransmission arrived, the retransmission did
        // not.
        let out = sb.apply_sack(&[SackBlock::new(11 * MSS, 12 * MSS)], &ctx);
        assert_eq!(out.lost_retransmits, 1);
        assert!(out.data_sacked);
        assert_eq!(sb.get(0).map(|r| r.tag), Some(SackTag::Lost));
        assert_eq!(sb.get(1).map(|r| r.tag), Some(SackTag::Lost));
        assert_eq!(sb.retrans_out(), 0);
        assert_eq!(sb.lost_out(), 2);

        // Without FACK the SACKed data must lie well beyond the point where
        // the retransmission was sent.
        let mut sb = new_test_scoreboard(10, true);
        sb.mark_retransmitted(0, SeqNum(10 * MSS), 10);
        sb.push(SegmentRecord::new(SeqNum(10 * MSS), SeqNum(11 * MSS), 20));
        sb.push(SegmentRecord::new(SeqNum(11 * MSS), SeqNum(12 * MSS), 20));
        ctx.fack = false;
        let out = sb.apply_sack(&[SackBlock::new(11 * MSS, 12 * MSS)], &ctx);
        assert_eq!(out.lost_retransmits, 0);
        assert_eq!(sb.retrans_out(), 1);
    }

    #[test]
    fn mark_head_lost_limits() {
        let mut sb = new_test_scoreboard(10, true);
        let ctx = new_test_context(0, 10 * MSS);
        sb.apply_sack(&[SackBlock::new(MSS, 2 * MSS)], &ctx);

        // Walks the first 3 segments; the SACKed one is skipped.
        assert_eq!(sb.mark_head_lost(3, SeqNum(10 * MSS)), 2);
        assert_eq!(
            tags(&sb)[..4],
            [
                SackTag::Lost,
                SackTag::Sacked,
                SackTag::Lost,
                SackTag::InFlight
            ]
        );

        // Bounded by high_seq.
        assert_eq!(sb.mark_head_lost(10, SeqNum(5 * MSS)), 2);
        assert_eq!(sb.lost_out(), 4);
        assert_eq!(sb.sacked_out() + sb.lost_out(), sb.left_out());
    }

    #[test]
    fn mark_timed_out_head() {
        let mut sb = Scoreboard::new(true);
        sb.push(SegmentRecord::new(SeqNum(0), SeqNum(MSS), 0));
        sb.push(SegmentRecord::new(SeqNum(MSS), SeqNum(2 * MSS), 0));
        sb.push(SegmentRecord::new(SeqNum(2 * MSS), SeqNum(3 * MSS), 900));

        assert!(!sb.head_timed_out(1000, 1000));
        assert!(sb.head_timed_out(1001, 1000));
        assert_eq!(sb.mark_timed_out(1001, 1000), 2);
        assert_eq!(sb.lost_out(), 2);
        assert_eq!(sb.get(2).map(|r| r.tag), Some(SackTag::InFlight));
    }

    #[test]
    fn clean_acked_karn() {
        let mut sb = new_test_scoreboard(4, true);
        let out = sb.clean_acked(SeqNum(MSS), 100);
        assert_eq!(out.acked, 1);
        assert_eq!(out.seq_rtt, Some(100));
        assert!(!out.retrans_acked);

        sb.mark_retransmitted(0, SeqNum(4 * MSS), 50);
        let out = sb.clean_acked(SeqNum(3 * MSS), 200);
        assert_eq!(out.acked, 2);
        assert!(out.retrans_acked);
        assert_eq!(sb.packets_out(), 1);
        assert_eq!(sb.retrans_out(), 0);

        // Partially acknowledged segments stay.
        let out = sb.clean_acked(SeqNum(3 * MSS + 10), 300);
        assert_eq!(out.acked, 0);
        assert_eq!(out.seq_rtt, None);
    }

    #[test]
    fn clean_acked_resync() {
        let mut sb = new_test_scoreboard(2, false);
        sb.add_reno_sack();
        assert_eq!(sb.sacked_out(), 1);

        let out = sb.clean_acked(SeqNum(2 * MSS), 10);
        assert_eq!(out.acked, 2);
        assert!(out.resynced);
        assert_eq!(sb.sacked_out(), 0);
        assert_eq!(sb.in_flight(), 0);
    }

    #[test]
    fn enter_loss_marks_all() {
        let mut sb = new_test_scoreboard(5, true);
        let ctx = new_test_context(0, 5 * MSS);
        sb.apply_sack(&[SackBlock::new(3 * MSS, 4 * MSS)], &ctx);

        assert!(!sb.enter_loss(false));
        assert_eq!(sb.lost_out(), 4);
        assert_eq!(sb.sacked_out(), 1);
        assert_eq!(sb.fackets_out(), 4);

        sb.mark_retransmitted(0, SeqNum(5 * MSS), 10);
        assert!(sb.enter_loss(true));
        assert_eq!(sb.lost_out(), 5);
        assert_eq!(sb.sacked_out(), 0);
        assert_eq!(sb.retrans_out(), 0);
        assert!(sb.get(0).map_or(false, |r| r.ever_retrans));

        sb.clear_lost();
        assert_eq!(sb.lost_out(), 0);
        assert_eq!(sb.in_flight(), 5);
    }

    #[test]
    fn reneging_head() {
        let mut sb = new_test_scoreboard(3, true);
        let ctx = new_test_context(0, 3 * MSS);
        sb.apply_sack(&[SackBlock::new(MSS, 2 * MSS)], &ctx);
        assert!(!sb.is_reneging());

        sb.clean_acked(SeqNum(MSS), 10);
        assert!(sb.is_reneging());
    }

    #[test]
    fn reno_dupack_counting() {
        let mut sb = new_test_scoreboard(4, false);
        assert_eq!(sb.fackets_for_recovery(), 1);

        assert_eq!(sb.add_reno_sack(), None);
        assert_eq!(sb.add_reno_sack(), None);
        assert_eq!(sb.add_reno_sack(), None);
        assert_eq!(sb.fackets_for_recovery(), 4);

        // A fourth duplicate ACK cannot be explained by a single hole.
        assert_eq!(sb.add_reno_sack(), Some(4));
        assert_eq!(sb.sacked_out(), 3);

        sb.clean_acked(SeqNum(2 * MSS), 10);
        assert_eq!(sb.remove_reno_sacks(2), Some(2 + 2));
        assert_eq!(sb.sacked_out(), 1);

        sb.reset_reno_sack();
        assert_eq!(sb.sacked_out(), 0);
    }
}
