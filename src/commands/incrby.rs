use bytes::Bytes;

use crate::commands::{decode_integer, Command};
use crate::error::ClientError;
use crate::frame::Frame;

/// `INCRBY key delta` — the value after incrementing by `delta`.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrBy {
    pub key: String,
    pub delta: i64,
}

impl IncrBy {
    pub fn new(key: impl Into<String>, delta: i64) -> Self {
        Self {
            key: key.into(),
            delta,
        }
    }
}

impl Command for IncrBy {
    type Output = i64;
    const NAME: &'static str = "INCRBY";

    fn args(&self) -> Vec<Bytes> {
        vec![
            Bytes::from(self.key.clone()),
            Bytes::from(self.delta.to_string()),
        ]
    }

    fn decode(frame: Frame) -> Result<Self::Output, ClientError> {
        decode_integer(Self::NAME, frame)
    }
}
