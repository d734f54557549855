use bytes::Bytes;

use crate::commands::{decode_integer, Command};
use crate::error::ClientError;
use crate::frame::Frame;

/// `INCR key` — the value after incrementing.
#[derive(Debug, Clone, PartialEq)]
pub struct Incr {
    pub key: String,
}

impl Incr {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Command for Incr {
    type Output = i64;
    const NAME: &'static str = "INCR";

    fn args(&self) -> Vec<Bytes> {
        vec![Bytes::from(self.key.clone())]
    }

    fn decode(frame: Frame) -> Result<Self::Output, ClientError> {
        decode_integer(Self::NAME, frame)
    }
}
