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

//! Concrete qlog event definitions for TCP loss recovery and congestion
//! control. Event names follow the qlog "recovery" category.

use serde::Deserialize;
use serde::Serialize;

use crate::congestion_control::CaState;
use crate::recovery::ReorderSource;

/// One record of the trace.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct Event {
    /// Milliseconds since the start of the trace.
    pub time: f32,

    #[serde(flatten)]
    pub data: EventData,
}

impl Event {
    pub fn new(time: f32, data: EventData) -> Self {
        Event { time, data }
    }

    /// Return the importance of the event.
    pub fn importance(&self) -> EventImportance {
        self.data.importance()
    }
}

#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(tag = "name", content = "data")]
pub enum EventData {
    /// Emitted once per connection with the recovery tunables in use.
    #[serde(rename = "recovery:parameters_set")]
    RecoveryParametersSet {
        mss: Option<u32>,
        reordering_threshold: Option<u32>,
        initial_congestion_window: Option<u32>,
        rto_min: Option<f32>,
        rto_max: Option<f32>,
        sack: Option<bool>,
        fack: Option<bool>,
        congestion_control: Option<String>,
    },

    /// Emitted when one or more of the observable recovery metrics changes.
    /// Only changed fields are logged.
    #[serde(rename = "recovery:metrics_updated")]
    RecoveryMetricsUpdated {
        smoothed_rtt: Option<f32>,
        latest_rtt: Option<f32>,
        rtt_variance: Option<f32>,
        rto: Option<f32>,
        congestion_window: Option<u32>,
        ssthresh: Option<u32>,
        packets_in_flight: Option<u32>,
        sacked_out: Option<u32>,
        lost_out: Option<u32>,
        retrans_out: Option<u32>,
    },

    /// Emitted when the congestion avoidance state changes.
    #[serde(rename = "recovery:congestion_state_updated")]
    RecoveryCongestionStateUpdated {
        old: Option<CaState>,
        new: CaState,
        trigger: Option<CongestionStateUpdatedTrigger>,
    },

    /// Emitted when segments are marked lost by the scoreboard.
    #[serde(rename = "recovery:segments_lost")]
    RecoverySegmentsLost {
        count: u32,
        high_seq: Option<u32>,
        trigger: Option<SegmentsLostTrigger>,
    },

    /// Emitted for each retransmitted segment.
    #[serde(rename = "recovery:segment_retransmitted")]
    RecoverySegmentRetransmitted {
        seq: u32,
        end_seq: u32,
        trigger: Option<RetransmitTrigger>,
    },

    /// Emitted when a window reduction is reverted because it turned out to
    /// be spurious.
    #[serde(rename = "recovery:spurious_congestion_undone")]
    RecoverySpuriousCongestionUndone {
        kind: UndoKind,
        congestion_window: u32,
        ssthresh: u32,
    },

    /// Emitted when the reordering threshold is raised.
    #[serde(rename = "recovery:reordering_updated")]
    RecoveryReorderingUpdated {
        old: u32,
        new: u32,
        source: ReorderSource,
    },
}

impl EventData {
    /// Return the importance of the event.
    pub fn importance(&self) -> EventImportance {
        use EventData::*;
        match *self {
            RecoveryParametersSet { .. } => EventImportance::Base,
            RecoveryMetricsUpdated { .. } => EventImportance::Core,
            RecoveryCongestionStateUpdated { .. } => EventImportance::Base,
            RecoverySegmentsLost { .. } => EventImportance::Core,
            RecoverySegmentRetransmitted { .. } => EventImportance::Extra,
            RecoverySpuriousCongestionUndone { .. } => EventImportance::Base,
            RecoveryReorderingUpdated { .. } => EventImportance::Base,
        }
    }
}

/// An "importance indicator" in decreasing order of importance and expected
/// usage.
#[derive(Clone, Debug, PartialEq, PartialOrd)]
pub enum EventImportance {
    /// The "Core" events are the events that SHOULD be present in all qlog
    /// files for a given protocol.
    Core = 0,

    /// The "Base" events add additional debugging options and CAN be present
    /// in qlog files.
    Base = 1,

    /// The "Extra" events are considered mostly useful for low-level debugging
    /// of the implementation, rather than the protocol.
    Extra = 2,
}

impl EventImportance {
    /// Return true if this importance level is included by `other`.
    pub fn is_contained_in(&self, other: &EventImportance) -> bool {
        self <= other
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum CongestionStateUpdatedTrigger {
    DuplicateAck,
    Sack,
    Ecn,
    Timeout,
    Reneging,
    Undo,
    Completed,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum SegmentsLostTrigger {
    /// Marked by the forward-most SACK or the duplicate ACK count.
    ReorderingThreshold,

    /// The head of the queue was outstanding longer than the RTO.
    HeadTimedOut,

    /// A retransmission was found lost.
    LostRetransmit,

    /// A retransmission timeout marked the whole queue.
    Timeout,

    /// The receiver dropped SACKed data.
    Reneging,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum RetransmitTrigger {
    /// Retransmission of a segment marked lost.
    Fast,

    /// Retransmission of a segment in a hole not yet marked lost.
    Forward,

    /// Retransmission in the Loss state.
    SlowStart,

    /// Retransmission of the head on timeout or reneging.
    Timeout,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum UndoKind {
    /// The whole recovery episode was spurious.
    Full,

    /// A partial ACK proved the reduction spurious.
    Partial,

    /// Duplicate SACKs reported every retransmission as redundant.
    Dsack,

    /// A retransmission timeout was spurious.
    Loss,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn serialize_congestion_state_updated() {
        let event = Event::new(
            1.5,
            EventData::RecoveryCongestionStateUpdated {
                old: Some(CaState::Disorder),
                new: CaState::Recovery,
                trigger: Some(CongestionStateUpdatedTrigger::DuplicateAck),
            },
        );
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"time":1.5,"name":"recovery:congestion_state_updated","data":{"old":"disorder","new":"recovery","trigger":"duplicate_ack"}}"#
        );
    }

    #[test]
    fn serialize_metrics_updated() {
        let event = Event::new(
            0.0,
            EventData::RecoveryMetricsUpdated {
                smoothed_rtt: None,
                latest_rtt: None,
                rtt_variance: None,
                rto: None,
                congestion_window: Some(10),
                ssthresh: None,
                packets_in_flight: Some(7),
                sacked_out: None,
                lost_out: None,
                retrans_out: None,
            },
        );
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"time":0.0,"name":"recovery:metrics_updated","data":{"congestion_window":10,"packets_in_flight":7}}"#
        );

        let back: Event = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn serialize_reordering_updated() {
        let event = Event::new(
            2.0,
            EventData::RecoveryReorderingUpdated {
                old: 3,
                new: 6,
                source: ReorderSource::Fack,
            },
        );
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"time":2.0,"name":"recovery:reordering_updated","data":{"old":3,"new":6,"source":"fack"}}"#
        );
    }

    #[test]
    fn event_importance() {
        let lost = EventData::RecoverySegmentsLost {
            count: 1,
            high_seq: None,
            trigger: None,
        };
        assert_eq!(lost.importance(), EventImportance::Core);
        assert!(EventImportance::Core.is_contained_in(&EventImportance::Base));
        assert!(!EventImportance::Extra.is_contained_in(&EventImportance::Base));
    }
}
