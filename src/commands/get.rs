use bytes::Bytes;

use crate::commands::{decode_optional_bulk, Command};
use crate::error::ClientError;
use crate::frame::Frame;

/// `GET key` — the value, or `None` when the key does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct Get {
    pub key: String,
}

impl Get {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Command for Get {
    type Output = Option<Bytes>;
    const NAME: &'static str = "GET";

    fn args(&self) -> Vec<Bytes> {
        vec![Bytes::from(self.key.clone())]
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn decode(frame: Frame) -> Result<Self::Output, ClientError> {
        decode_optional_bulk(Self::NAME, frame)
    }
}
