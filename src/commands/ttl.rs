use bytes::Bytes;

use crate::commands::{decode_integer, Command};
use crate::error::ClientError;
use crate::frame::Frame;

/// `TTL key` — remaining time to live in seconds, `-1` when the key has no
/// expiry, `-2` when the key does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct Ttl {
    pub key: String,
}

impl Ttl {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Command for Ttl {
    type Output = i64;
    const NAME: &'static str = "TTL";

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
