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

//! Error type for recovery operations.

use strum_macros::EnumIter;

/// Recovery engine error.
///
/// Protocol anomalies reported by the peer never surface as errors; they are
/// absorbed by the congestion state machine. Errors only come from misuse of
/// the API, invalid configuration, the retransmit callback and qlog output.
#[derive(Clone, Debug, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// There is no more work to do.
    Done,

    /// The segment could not be transmitted now because of local resource
    /// shortage. The operation may be retried later.
    LocalCongestion,

    /// The operation cannot be completed because it was attempted in an
    /// invalid state.
    InvalidState(String),

    /// The operation is invalid.
    InvalidOperation(String),

    /// The configuration is invalid.
    InvalidConfig(String),

    /// I/O error.
    IoError(String),
}

impl Error {
    /// Return whether the error is transient and the operation may succeed if
    /// retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Done | Error::LocalCongestion)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl std::convert::From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(format!("{}", err))
    }
}

impl std::convert::From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidConfig(format!("{}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn error_transient() {
        for err in Error::iter() {
            match err {
                Error::Done | Error::LocalCongestion => assert!(err.is_transient()),
                _ => assert!(!err.is_transient()),
            }
        }
    }

    #[test]
    fn io_error() {
        use std::error::Error;
        let e = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        let e = super::Error::from(e);

        assert_eq!(format!("{}", e), "IoError(\"unexpected end of file\")");
        assert!(e.source().is_none());
    }

    #[test]
    fn json_error() {
        let e = serde_json::from_str::<u32>("{").unwrap_err();
        match super::Error::from(e) {
            super::Error::InvalidConfig(reason) => assert!(!reason.is_empty()),
            e => panic!("unexpected error {:?}", e),
        }
    }
}
