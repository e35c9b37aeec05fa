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

use super::CongestionController;
use super::CongestionWindow;

/// Dummy is a congestion controller that neither grows the window nor lowers
/// the slow start threshold on congestion. Loss recovery still trims the
/// window to what is in flight.
/// It is intended to be used for testing and experiments.
#[derive(Debug, Default)]
pub struct Dummy {}

impl Dummy {
    pub fn new() -> Self {
        Self {}
    }
}

impl CongestionController for Dummy {
    fn name(&self) -> &str {
        "DUMMY"
    }

    fn ssthresh(&self, window: &CongestionWindow, _in_flight: u32) -> u32 {
        window.cwnd
    }

    fn cong_avoid(&mut self, _window: &mut CongestionWindow, _in_flight: u32) {
        // Do nothing.
    }
}
