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

use std::time::Instant;

use log::*;

use super::Recovery;
use super::RetransmitHandler;
use super::SackTag;
use super::Timer;
use crate::congestion_control::CaState;
use crate::qlog::events::EventData;
use crate::qlog::events::RetransmitTrigger;
use crate::Error;
use crate::Result;

impl Recovery {
    /// Retransmit what the congestion window allows: first the segments
    /// marked lost, then, during SACK recovery with nothing new to send,
    /// the holes below the forward-most SACK.
    pub(super) fn xmit_retransmit_queue(&mut self, handler: &mut dyn RetransmitHandler, now: Instant) {
        let lost_out = self.scoreboard.lost_out();
        if lost_out > 0 {
            let trigger = if self.ca_state == CaState::Loss {
                RetransmitTrigger::SlowStart
            } else {
                RetransmitTrigger::Fast
            };

            let mut lost = 0;
            for idx in 0..self.scoreboard.len() {
                if self.in_flight() >= self.window.cwnd() {
                    return;
                }

                let tag = match self.scoreboard.get(idx) {
                    Some(seg) => seg.tag,
                    None => break,
                };
                if !tag.is_lost() {
                    continue;
                }

                if tag == SackTag::Lost {
                    if self.send_segment(idx, trigger, handler, now).is_err() {
                        return;
                    }
                    if trigger == RetransmitTrigger::SlowStart {
                        self.stats.slow_start_retrans += 1;
                    } else {
                        self.stats.fast_retrans += 1;
                    }
                }

                lost += 1;
                if lost >= lost_out {
                    break;
                }
            }
        }

        // Forward retransmission of holes not yet marked lost.
        if self.ca_state != CaState::Recovery || !self.scoreboard.is_sack() || self.may_send_now()
        {
            return;
        }

        let fackets_out = self.scoreboard.fackets_out() as usize;
        for idx in 0..fackets_out {
            if self.in_flight() >= self.window.cwnd() {
                break;
            }

            match self.scoreboard.get(idx) {
                Some(seg) if seg.tag == SackTag::InFlight => (),
                Some(_) => continue,
                None => break,
            }

            if self
                .send_segment(idx, RetransmitTrigger::Forward, handler, now)
                .is_err()
            {
                break;
            }
            self.stats.forward_retrans += 1;
        }
    }

    /// Retransmit the segment at `idx` and restart the timer if it is the
    /// head of the queue.
    fn send_segment(
        &mut self,
        idx: usize,
        trigger: RetransmitTrigger,
        handler: &mut dyn RetransmitHandler,
        now: Instant,
    ) -> Result<()> {
        self.retransmit_trigger(idx, trigger, handler, now)?;
        if idx == 0 {
            self.timers
                .set(Timer::Retransmit, now + self.rtt.rto_duration());
        }
        Ok(())
    }

    /// Retransmit the segment at `idx` after a timeout or reneging.
    pub(super) fn retransmit_segment(
        &mut self,
        idx: usize,
        handler: &mut dyn RetransmitHandler,
        now: Instant,
    ) -> Result<()> {
        self.retransmit_trigger(idx, RetransmitTrigger::Timeout, handler, now)
    }

    fn retransmit_trigger(
        &mut self,
        idx: usize,
        trigger: RetransmitTrigger,
        handler: &mut dyn RetransmitHandler,
        now: Instant,
    ) -> Result<()> {
        let seg = match self.scoreboard.get(idx) {
            Some(seg) => seg.clone(),
            None => return Err(Error::Done),
        };

        // Only the first segment may be sent beyond the send window, to
        // probe it.
        if !seg.seq.before(self.snd_una + self.snd_wnd) && seg.seq != self.snd_una {
            self.stats.retrans_fail += 1;
            return Err(Error::Done);
        }

        if let Err(e) = handler.retransmit(&seg) {
            self.stats.retrans_fail += 1;
            return Err(e);
        }

        let ts = self.timestamp(now);
        self.scoreboard.mark_retransmitted(idx, self.snd_nxt, ts);
        if self.retrans_stamp.is_none() {
            self.retrans_stamp = Some(ts);
        }
        if self.undo_marker.is_some() {
            self.undo_retrans += 1;
        }
        self.stats.total_retrans += 1;

        trace!(
            "{} RETRANSMIT seq={} end={} {:?} inflight={} cwnd={}",
            self.trace_id,
            seg.seq,
            seg.end_seq,
            trigger,
            self.in_flight(),
            self.window.cwnd()
        );

        let ev_data = EventData::RecoverySegmentRetransmitted {
            seq: seg.seq.0,
            end_seq: seg.end_seq.0,
            trigger: Some(trigger),
        };
        self.qlog_event(now, ev_data);
        Ok(())
    }

    /// Whether the next new segment may be sent right now.
    pub(super) fn may_send_now(&self) -> bool {
        self.send_head.is_some() && self.in_flight() < self.window.cwnd() && self.send_head_fits()
    }
}
