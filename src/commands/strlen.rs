use bytes::Bytes;

use crate::commands::{decode_integer, Command};
use crate::error::ClientError;
use crate::frame::Frame;

/// `STRLEN key` — length of the value in bytes, `0` for a missing key.
#[derive(Debug, Clone, PartialEq)]
pub struct Strlen {
    pub key: String,
}

impl Strlen {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Command for Strlen {
    type Output = i64;
    const NAME: &'static str = "STRLEN";

    fn args(&self) -> Vec<Bytes> {
        vec![Bytes::from(self.key.clone())]
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn decode(frame: Frame) -> Result<Self::Output, ClientError> {
        decode_integer(Self::NAME, frame)
    }
}
