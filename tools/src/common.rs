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

//! Discrete event simulation of a bulk transfer over a lossy, reordering
//! path. The sender is driven by the recovery engine. The receiver answers
//! with cumulative ACKs, SACK blocks and D-SACK reports, delaying ACKs of in
//! order data unless it is in quick ACK mode.

use std::cmp;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::trace;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use tcp_recovery::AckInfo;
use tcp_recovery::Config;
use tcp_recovery::Recovery;
use tcp_recovery::RecoveryStats;
use tcp_recovery::RetransmitHandler;
use tcp_recovery::SackBlock;
use tcp_recovery::SegmentRecord;
use tcp_recovery::SeqNum;
use tcp_recovery::MAX_SACK_BLOCKS;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Return the log target for env_logger.
pub fn log_target(log_file: &Option<String>) -> Result<env_logger::Target> {
    if let Some(log_file) = log_file {
        let file = File::create(log_file)?;
        return Ok(env_logger::Target::Pipe(Box::new(file)));
    }
    Ok(env_logger::Target::Stderr)
}

/// Path characteristics, times in milliseconds.
#[derive(Clone, Debug)]
pub struct LinkModel {
    /// One way propagation delay.
    pub delay: u64,

    /// Maximum extra delay added to each data segment. Jitter larger than
    /// the segment spacing reorders segments.
    pub jitter: u64,

    /// Drop probability of data segments.
    pub loss: f64,

    /// Drop probability of ACKs.
    pub ack_loss: f64,
}

/// Parameters of a simulated transfer.
#[derive(Clone, Debug)]
pub struct SimulationOpt {
    /// Number of full sized segments to deliver.
    pub segments: u32,

    /// Receive window advertised by the receiver, in bytes.
    pub window: u32,

    /// Initial sequence number.
    pub isn: u32,

    /// Seed of the random generator.
    pub seed: u64,

    /// Give up after this much simulated time, in milliseconds.
    pub time_limit: u64,

    /// Delayed ACK timeout of the receiver in milliseconds, 0 to ACK every
    /// segment.
    pub delayed_ack: u64,

    pub link: LinkModel,
}

/// Outcome of a simulated transfer.
#[derive(Clone, Debug, Default)]
pub struct Report {
    /// Whether every segment was acknowledged.
    pub completed: bool,

    /// Simulated duration of the transfer.
    pub duration: Duration,

    /// Bytes acknowledged by the receiver.
    pub delivered: u64,

    /// Data segments put on the wire, retransmissions included.
    pub transmissions: u64,

    /// Data segments dropped by the link.
    pub dropped: u64,

    /// ACKs sent by the receiver.
    pub acks: u64,

    /// ACKs dropped by the link.
    pub acks_dropped: u64,

    /// Congestion window after each ACK.
    pub cwnd_samples: Vec<f64>,

    pub stats: RecoveryStats,
}

/// Something travelling on the link.
enum Packet {
    Data { seq: SeqNum, len: u32, tsval: u32 },
    Ack(AckInfo),

    /// Expiry of the receiver's delayed ACK timer. Never on the link.
    DelayedAck,
}

struct Event {
    /// Arrival time in milliseconds.
    at: u64,

    /// Tie breaker keeping FIFO order between events of the same time.
    id: u64,

    packet: Packet,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    // Reversed, BinaryHeap is a max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Segments handed out by the engine for retransmission.
#[derive(Default)]
struct Wire {
    pending: Vec<(SeqNum, u32)>,
    probes: u64,
}

impl RetransmitHandler for Wire {
    fn retransmit(&mut self, segment: &SegmentRecord) -> tcp_recovery::Result<()> {
        self.pending.push((segment.seq, segment.len()));
        Ok(())
    }

    fn send_probe(&mut self) -> tcp_recovery::Result<()> {
        self.probes += 1;
        Ok(())
    }
}

/// A SACK capable receiver of full sized segments.
struct Receiver {
    isn: SeqNum,
    mss: u32,
    window: u32,

    /// Received segments by index.
    received: Vec<bool>,

    /// Index of the first missing segment.
    rcv_nxt: usize,

    /// Highest index received plus one.
    rcv_high: usize,

    /// Sequence number of the receiver's own (empty) segments.
    seq: SeqNum,

    /// Whether in order data may be acknowledged every other segment.
    delayed: bool,

    /// Quick ACKs granted on entering quick ACK mode.
    max_quickacks: u32,

    /// Quick ACKs left before delayed ACKs resume.
    quickacks: u32,

    /// Segments received since the last ACK.
    unacked: u32,

    /// Index of the last segment received.
    last_idx: usize,

    /// Timestamp value to echo.
    ts_recent: u32,
}

impl Receiver {
    fn new(isn: SeqNum, mss: u32, window: u32, segments: u32, max_quickacks: u32, delayed: bool) -> Self {
        Receiver {
            isn,
            mss,
            window,
            received: vec![false; segments as usize],
            rcv_nxt: 0,
            rcv_high: 0,
            seq: SeqNum(1),
            delayed,
            max_quickacks,
            // The start of a connection is acknowledged quickly.
            quickacks: max_quickacks,
            unacked: 0,
            last_idx: 0,
            ts_recent: 0,
        }
    }

    fn ack_seq(&self) -> SeqNum {
        self.isn + self.rcv_nxt as u32 * self.mss
    }

    fn seq_of(&self, idx: usize) -> u32 {
        (self.isn + idx as u32 * self.mss).0
    }

    /// Accept a data segment. Return the ACK answering it, or `None` if the
    /// ACK is delayed.
    fn on_data(&mut self, seq: SeqNum, len: u32, tsval: u32, now_ts: u32) -> Option<AckInfo> {
        let idx = ((seq - self.isn) / self.mss) as usize;
        if self.unacked == 0 {
            self.ts_recent = tsval;
        }
        self.unacked += 1;
        self.last_idx = idx;

        if idx >= self.received.len() || self.received[idx] {
            // Duplicate: report it first.
            self.quickacks = self.max_quickacks;
            let dsack = SackBlock::new(seq.0, (seq + len).0);
            return Some(self.build_ack(Some(dsack), now_ts));
        }

        let in_order = idx == self.rcv_nxt && self.rcv_high <= idx;
        self.received[idx] = true;
        self.rcv_high = cmp::max(self.rcv_high, idx + 1);
        while self.rcv_nxt < self.received.len() && self.received[self.rcv_nxt] {
            self.rcv_nxt += 1;
        }

        if !in_order {
            // Out of order data, or data filling a hole.
            if self.rcv_nxt < self.rcv_high {
                self.quickacks = self.max_quickacks;
            }
            return Some(self.build_ack(None, now_ts));
        }

        if !self.delayed || self.unacked >= 2 || self.is_complete() {
            return Some(self.build_ack(None, now_ts));
        }
        if self.quickacks > 0 {
            self.quickacks -= 1;
            return Some(self.build_ack(None, now_ts));
        }
        None
    }

    /// Expiry of the delayed ACK timer.
    fn on_delayed_ack_timeout(&mut self, now_ts: u32) -> Option<AckInfo> {
        if self.unacked == 0 {
            return None;
        }
        Some(self.build_ack(None, now_ts))
    }

    fn build_ack(&mut self, dsack: Option<SackBlock>, now_ts: u32) -> AckInfo {
        let mut blocks: Vec<SackBlock> = Vec::with_capacity(MAX_SACK_BLOCKS);
        blocks.extend(dsack);

        // Out of order ranges, the one holding the last segment first, then
        // the others from the highest down.
        let idx = self.last_idx;
        let mut ranges = Vec::new();
        let mut i = self.rcv_nxt;
        while i < self.rcv_high {
            if !self.received[i] {
                i += 1;
                continue;
            }
            let start = i;
            while i < self.rcv_high && self.received[i] {
                i += 1;
            }
            ranges.push((start, i));
        }
        ranges.sort_by_key(|&(start, end)| (!(start <= idx && idx < end), cmp::Reverse(start)));

        // One slot is taken by the timestamp option.
        for (start, end) in ranges {
            if blocks.len() >= MAX_SACK_BLOCKS - 1 {
                break;
            }
            blocks.push(SackBlock::new(self.seq_of(start), self.seq_of(end)));
        }

        self.unacked = 0;
        AckInfo::new(self.seq, self.ack_seq(), self.window)
            .with_sack(&blocks)
            .with_timestamp(now_ts, self.ts_recent)
    }

    fn is_complete(&self) -> bool {
        self.rcv_nxt == self.received.len()
    }
}

/// A sender and a receiver connected by a `LinkModel`.
pub struct Simulation {
    opt: SimulationOpt,
    recovery: Recovery,
    receiver: Receiver,
    wire: Wire,
    events: BinaryHeap<Event>,
    rng: StdRng,
    mss: u32,

    /// Start of the simulated clock.
    epoch: Instant,

    /// Simulated time in milliseconds.
    now: u64,

    /// Segments sent for the first time.
    sent: u32,

    next_id: u64,
    report: Report,
}

impl Simulation {
    pub fn new(conf: &Config, opt: SimulationOpt) -> Self {
        let epoch = Instant::now();
        let isn = SeqNum(opt.isn);
        let mut recovery = Recovery::new(conf, isn, epoch);
        recovery.set_trace_id("SIM");
        recovery.set_send_window(opt.window, SeqNum(0));
        let receiver = Receiver::new(
            isn,
            conf.mss(),
            opt.window,
            opt.segments,
            recovery.max_quickacks(),
            opt.delayed_ack > 0,
        );

        Simulation {
            receiver,
            rng: StdRng::seed_from_u64(opt.seed),
            mss: conf.mss(),
            opt,
            recovery,
            wire: Wire::default(),
            events: BinaryHeap::new(),
            epoch,
            now: 0,
            sent: 0,
            next_id: 0,
            report: Report::default(),
        }
    }

    /// Write a qlog trace of the sender.
    pub fn set_qlog(&mut self, file: File) {
        self.recovery.set_qlog(
            Box::new(file),
            "tcp-recovery-sim qlog".into(),
            "simulated bulk transfer".into(),
            self.epoch,
        );
    }

    fn instant(&self) -> Instant {
        self.epoch + Duration::from_millis(self.now)
    }

    /// Run the transfer to completion or to the time limit.
    pub fn run(mut self) -> Report {
        loop {
            self.send_new_data();
            self.flush_retransmissions();

            if self.receiver.is_complete() && self.recovery.packets_out() == 0 {
                self.report.completed = true;
                break;
            }

            let next_event = self.events.peek().map(|e| e.at);
            // Rounded up, the timer must be due once the clock gets there.
            let next_timer = self.recovery.timeout().map(|t| {
                let d = t.saturating_duration_since(self.epoch);
                d.as_millis() as u64 + u64::from(d.subsec_nanos() % 1_000_000 != 0)
            });

            let timer_first = match (next_event, next_timer) {
                (Some(e), Some(t)) => t < e,
                (None, Some(_)) => true,
                (Some(_), None) => false,
                (None, None) => {
                    debug!("transfer stalled at {}ms", self.now);
                    break;
                }
            };

            if timer_first {
                self.now = cmp::max(self.now, next_timer.unwrap_or(self.now));
                if self.now > self.opt.time_limit {
                    break;
                }
                let now = self.instant();
                self.recovery.on_timeout(&mut self.wire, now);
                continue;
            }

            let event = match self.events.pop() {
                Some(event) => event,
                None => break,
            };
            self.now = cmp::max(self.now, event.at);
            if self.now > self.opt.time_limit {
                break;
            }
            self.deliver(event.packet);
        }

        self.report.duration = Duration::from_millis(self.now);
        self.report.delivered = self.receiver.rcv_nxt as u64 * self.mss as u64;
        self.report.stats = self.recovery.stats().clone();
        self.report
    }

    fn deliver(&mut self, packet: Packet) {
        let now = self.instant();
        match packet {
            Packet::Data { seq, len, tsval } => {
                let ts = self.recovery.timestamp(now);
                match self.receiver.on_data(seq, len, tsval, ts) {
                    Some(ack) => self.send_ack(ack),
                    None => self.schedule(self.now + self.opt.delayed_ack, Packet::DelayedAck),
                }
            }

            Packet::DelayedAck => {
                let ts = self.recovery.timestamp(now);
                if let Some(ack) = self.receiver.on_delayed_ack_timeout(ts) {
                    self.send_ack(ack);
                }
            }

            Packet::Ack(ack) => {
                let outcome = self.recovery.on_ack(&ack, &mut self.wire, now);
                trace!(
                    "{}ms sender {:?} {:?}",
                    self.now,
                    outcome.flags,
                    self.recovery
                );
                self.report
                    .cwnd_samples
                    .push(self.recovery.current_cwnd() as f64);
            }
        }
    }

    /// Send as much new data as the congestion and receive windows allow.
    fn send_new_data(&mut self) {
        let now = self.instant();
        while self.sent < self.opt.segments {
            self.recovery.set_send_head(Some(self.mss), now);
            let window_end = self.recovery.snd_una() + self.recovery.snd_wnd();
            if !self.recovery.can_send() || (self.recovery.snd_nxt() + self.mss).after(window_end) {
                return;
            }

            let seq = match self.recovery.on_segment_sent(self.mss, now) {
                Ok(seq) => seq,
                Err(_) => return,
            };
            self.sent += 1;
            let tsval = self.recovery.timestamp(now);
            self.transmit(Packet::Data {
                seq,
                len: self.mss,
                tsval,
            });
        }
        self.recovery.set_send_head(None, now);
    }

    fn flush_retransmissions(&mut self) {
        let tsval = self.recovery.timestamp(self.instant());
        let pending = std::mem::take(&mut self.wire.pending);
        for (seq, len) in pending {
            self.transmit(Packet::Data { seq, len, tsval });
        }
    }

    fn send_ack(&mut self, ack: AckInfo) {
        trace!("{}ms receiver ack {} sack {:?}", self.now, ack.ack_seq, ack.sack_blocks);
        self.report.acks += 1;
        self.transmit(Packet::Ack(ack));
    }

    /// Put a packet on the link, unless the link drops it.
    fn transmit(&mut self, packet: Packet) {
        let (loss, jitter) = match packet {
            Packet::Data { .. } => {
                self.report.transmissions += 1;
                (self.opt.link.loss, self.opt.link.jitter)
            }
            Packet::Ack(_) => (self.opt.link.ack_loss, 0),
            Packet::DelayedAck => (0.0, 0),
        };

        if loss > 0.0 && self.rng.gen_bool(loss.min(1.0)) {
            match packet {
                Packet::Data { .. } => self.report.dropped += 1,
                _ => self.report.acks_dropped += 1,
            }
            return;
        }

        let jitter = if jitter > 0 {
            self.rng.gen_range(0..=jitter)
        } else {
            0
        };
        self.schedule(self.now + self.opt.link.delay + jitter, packet);
    }

    fn schedule(&mut self, at: u64, packet: Packet) {
        self.next_id += 1;
        self.events.push(Event {
            at,
            id: self.next_id,
            packet,
        });
    }
}
