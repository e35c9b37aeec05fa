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

use std::time::Duration;
use std::time::Instant;

use criterion::criterion_group;
use criterion::criterion_main;
use criterion::BatchSize;
use criterion::Criterion;

use tcp_recovery::AckInfo;
use tcp_recovery::Config;
use tcp_recovery::Recovery;
use tcp_recovery::RetransmitHandler;
use tcp_recovery::SackBlock;
use tcp_recovery::SegmentRecord;
use tcp_recovery::SeqNum;

const MSS: u32 = 1000;
const SEGMENTS: u32 = 1000;

struct Sink;

impl RetransmitHandler for Sink {
    fn retransmit(&mut self, _segment: &SegmentRecord) -> tcp_recovery::Result<()> {
        Ok(())
    }

    fn send_probe(&mut self) -> tcp_recovery::Result<()> {
        Ok(())
    }
}

fn new_recovery(now: Instant) -> Recovery {
    let mut conf = Config::new().unwrap();
    conf.set_mss(MSS);
    let mut r = Recovery::new(&conf, SeqNum(0), now);
    r.set_send_window(SEGMENTS * MSS, SeqNum(0));
    for _ in 0..SEGMENTS {
        r.on_segment_sent(MSS, now).unwrap();
    }
    r
}

/// Cumulative ACKs, one per segment.
pub fn cumulative_ack_benchmark(c: &mut Criterion) {
    let now = Instant::now();
    let acks: Vec<AckInfo> = (1..=SEGMENTS)
        .map(|i| AckInfo::new(SeqNum(1), SeqNum(i * MSS), SEGMENTS * MSS))
        .collect();

    c.bench_function("cumulative ack", |b| {
        b.iter_batched(
            || new_recovery(now),
            |mut r| {
                let later = now + Duration::from_millis(50);
                for ack in &acks {
                    r.on_ack(ack, &mut Sink, later);
                }
                r
            },
            BatchSize::SmallInput,
        )
    });
}

/// The head segment is lost, the rest is reported by growing SACK blocks.
pub fn sack_benchmark(c: &mut Criterion) {
    let now = Instant::now();
    let acks: Vec<AckInfo> = (2..=SEGMENTS)
        .map(|i| {
            AckInfo::new(SeqNum(1), SeqNum(0), SEGMENTS * MSS)
                .with_sack(&[SackBlock::new(MSS, i * MSS)])
        })
        .collect();

    c.bench_function("sack scoreboard", |b| {
        b.iter_batched(
            || new_recovery(now),
            |mut r| {
                let later = now + Duration::from_millis(50);
                for ack in &acks {
                    r.on_ack(ack, &mut Sink, later);
                }
                r
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, cumulative_ack_benchmark, sack_benchmark);
criterion_main!(benches);
