//! Stream entry ids of the form `{unix_millis}-{seq}`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ports::kv_store::StoreError;

/// Store-assigned stream id. Total order: by millis, then sequence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    /// The zero id, strictly before every assigned id. Readers use it to
    /// replay a stream from the start.
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The next id a store would assign at or after this one.
    pub fn successor(&self) -> Self {
        Self {
            ms: self.ms,
            seq: self.seq + 1,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = StoreError;

    /// Accepts `"ms-seq"` and the bare-millis shorthand `"ms"` (seq 0),
    /// so `"0"` parses as the zero id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let corrupt = || StoreError::Corrupt(format!("bad stream id: {s:?}"));
        match s.split_once('-') {
            Some((ms, seq)) => Ok(Self {
                ms: ms.parse().map_err(|_| corrupt())?,
                seq: seq.parse().map_err(|_| corrupt())?,
            }),
            None => Ok(Self {
                ms: s.parse().map_err(|_| corrupt())?,
                seq: 0,
            }),
        }
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for StreamId {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
