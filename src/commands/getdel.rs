use bytes::Bytes;

use crate::commands::{decode_optional_bulk, Command};
use crate::error::ClientError;
use crate::frame::Frame;

/// `GETDEL key` — the value before deletion, or `None` when the key did not
/// exist.
#[derive(Debug, Clone, PartialEq)]
pub struct GetDel {
    pub key: String,
}

impl GetDel {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Command for GetDel {
    type Output = Option<Bytes>;
    const NAME: &'static str = "GETDEL";

    fn args(&self) -> Vec<Bytes> {
        vec![Bytes::from(self.key.clone())]
    }

    fn decode(frame: Frame) -> Result<Self::Output, ClientError> {
        decode_optional_bulk(Self::NAME, frame)
    }
}
