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

//! Streaming qlog trace of the recovery engine of one TCP sender.
//!
//! A trace file is a JSON text sequence (RFC 7464): a header record naming
//! the sender, followed by one record per recovery event. Event times are
//! milliseconds relative to the creation of the writer.

use std::io::Write;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

use self::events::Event;
use self::events::EventData;
use self::events::EventImportance;
use crate::Error;
use crate::Result;

/// Version of the qlog main schema the records follow.
pub const QLOG_VERSION: &str = "0.4";

/// Serialization format of the trace file.
pub const JSON_TEXT_SEQS: &str = "JSON-SEQ";

/// Protocol tag of every event in the trace.
pub const PROTOCOL_TYPE: &str = "TCP";

/// Header record of a trace file.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct QlogFileSeq {
    /// Always "JSON-SEQ".
    pub qlog_format: String,

    pub qlog_version: String,

    pub title: Option<String>,

    pub description: Option<String>,

    pub trace: TraceSeq,
}

/// The single trace of a file: one sender, one connection.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct TraceSeq {
    pub common_fields: CommonFields,
    pub vantage_point: VantagePoint,
}

impl TraceSeq {
    /// Create the trace of the connection `group_id`, seen from
    /// `vantage_point`.
    pub fn new(group_id: Option<String>, vantage_point: VantagePoint) -> Self {
        TraceSeq {
            common_fields: CommonFields {
                protocol_type: vec![PROTOCOL_TYPE.to_string()],
                time_format: "relative".to_string(),
                group_id,
            },
            vantage_point,
        }
    }
}

/// Fields shared by all events of the trace, so they are written once.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct CommonFields {
    pub protocol_type: Vec<String>,

    /// Event times are relative to the start of the writer.
    pub time_format: String,

    /// Trace id of the connection.
    pub group_id: Option<String>,
}

/// The endpoint the events are recorded at.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct VantagePoint {
    pub name: Option<String>,

    pub r#type: VantagePointType,
}

impl VantagePoint {
    pub fn new(name: Option<String>, is_sender: bool) -> VantagePoint {
        let r#type = if is_sender {
            VantagePointType::Sender
        } else {
            VantagePointType::Receiver
        };
        VantagePoint { name, r#type }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum VantagePointType {
    /// The data sender, where loss recovery runs.
    Sender,

    /// The data receiver, generating ACKs and SACK blocks.
    Receiver,
}

/// Streaming writer of a recovery trace.
pub struct QlogWriter {
    header: QlogFileSeq,

    /// Events less important than this level are dropped.
    level: EventImportance,

    writer: Box<dyn std::io::Write + Send + Sync>,

    /// Whether the header record has been written.
    ready: bool,

    start_time: Instant,

    /// Number of event records written.
    events_written: u64,
}

impl QlogWriter {
    pub fn new(
        title: Option<String>,
        description: Option<String>,
        trace: TraceSeq,
        level: EventImportance,
        writer: Box<dyn std::io::Write + Send + Sync>,
        start_time: Instant,
    ) -> Self {
        let header = QlogFileSeq {
            qlog_format: JSON_TEXT_SEQS.to_string(),
            qlog_version: QLOG_VERSION.to_string(),
            title,
            description,
            trace,
        };

        QlogWriter {
            header,
            level,
            writer,
            ready: false,
            start_time,
            events_written: 0,
        }
    }

    /// Write the header record. Events are rejected until it is written.
    pub fn start(&mut self) -> Result<()> {
        if self.ready {
            return Err(Error::Done);
        }

        let header = self.header.clone();
        self.write_record(&header)?;
        self.ready = true;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.ready {
            return Err(Error::InvalidState("trace not started".into()));
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Write an event, unless it is below the level of the writer.
    pub fn add_event(&mut self, event: Event) -> Result<()> {
        self.check(event.importance())?;
        self.write_record(&event)?;
        self.events_written += 1;
        Ok(())
    }

    /// Write an event that happened at `time`.
    pub fn add_event_data(&mut self, time: Instant, event_data: EventData) -> Result<()> {
        let event = Event::new(self.relative_time(time), event_data);
        self.add_event(event)
    }

    /// Number of events written so far.
    pub fn events_written(&self) -> u64 {
        self.events_written
    }

    fn check(&self, ei: EventImportance) -> Result<()> {
        if !self.ready {
            return Err(Error::InvalidState("trace not started".into()));
        }
        if !ei.is_contained_in(&self.level) {
            return Err(Error::Done);
        }
        Ok(())
    }

    /// Write one JSON-SEQ record.
    fn write_record<T: Serialize>(&mut self, record: &T) -> Result<()> {
        self.writer.write_all(b" ")?;
        serde_json::to_writer(self.writer.as_mut(), record)
            .map_err(|e| Error::IoError(e.to_string()))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Milliseconds elapsed since the writer was created.
    pub fn relative_time(&self, time: Instant) -> f32 {
        let duration = time.saturating_duration_since(self.start_time);
        duration.as_secs_f32() * 1000.0
    }
}


pub mod events;
