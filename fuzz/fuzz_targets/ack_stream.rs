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

#![no_main]

use std::time::Duration;
use std::time::Instant;

use lazy_static::lazy_static;
use libfuzzer_sys::fuzz_target;

use tcp_recovery::AckInfo;
use tcp_recovery::Config;
use tcp_recovery::Recovery;
use tcp_recovery::RetransmitHandler;
use tcp_recovery::SackBlock;
use tcp_recovery::SegmentRecord;
use tcp_recovery::SeqNum;

const MSS: u32 = 1000;
const SEGMENTS: u32 = 32;

lazy_static! {
    static ref CONFIG: Config = {
        let mut conf = Config::new().unwrap();
        conf.set_mss(MSS);
        conf.enable_ecn(true);
        conf
    };
}

struct Sink;

impl RetransmitHandler for Sink {
    fn retransmit(&mut self, _segment: &SegmentRecord) -> tcp_recovery::Result<()> {
        Ok(())
    }

    fn send_probe(&mut self) -> tcp_recovery::Result<()> {
        Ok(())
    }
}

fn check_counters(r: &Recovery) {
    assert!(r.left_out() <= r.packets_out());
    assert!(r.sacked_out() <= r.packets_out());
    assert!(r.fackets_out() <= r.packets_out());
    assert!(r.retrans_out() <= r.packets_out());
    assert!(r.current_cwnd() >= 1);
    assert!(r.current_ssthresh() >= 2);
}

// Each 6 byte chunk is one event: an ACK with up to two SACK blocks, a
// timeout or new data. Sequence numbers are segment indexes around snd_una.
fuzz_target!(|data: &[u8]| {
    let epoch = Instant::now();
    let isn = SeqNum(0xffff_f000);
    let mut r = Recovery::new(&CONFIG, isn, epoch);
    r.set_ecn_enabled(true);
    r.set_send_window(SEGMENTS * MSS * 2, isn);
    let mut now = epoch;

    for _ in 0..SEGMENTS {
        if r.on_segment_sent(MSS, now).is_err() {
            return;
        }
    }

    for chunk in data.chunks_exact(6) {
        now += Duration::from_millis(chunk[0] as u64);
        let seg = |b: u8| isn + (b as u32 % (SEGMENTS * 2)) * MSS;

        match chunk[1] % 8 {
            0 => r.on_timeout(&mut Sink, now),
            1 => {
                r.on_segment_sent(MSS, now).ok();
            }
            2 => r.on_congestion_notification(now),
            _ => {
                let mut blocks = Vec::new();
                if chunk[3] != 0 {
                    blocks.push(SackBlock::new(seg(chunk[3]).0, seg(chunk[3].wrapping_add(chunk[4] % 4 + 1)).0));
                }
                if chunk[5] & 1 != 0 {
                    blocks.push(SackBlock::new(seg(chunk[4]).0, seg(chunk[4].wrapping_add(1)).0));
                }
                let ack = AckInfo {
                    ecn_echo: chunk[5] & 2 != 0,
                    ..AckInfo::new(SeqNum(1), seg(chunk[2]), SEGMENTS * MSS * 2)
                }
                .with_sack(&blocks);
                let ack = if chunk[5] & 4 != 0 {
                    ack.with_timestamp(chunk[0] as u32, r.timestamp(now) / 2)
                } else {
                    ack
                };
                r.on_ack(&ack, &mut Sink, now);
            }
        }
        check_counters(&r);
    }
});
