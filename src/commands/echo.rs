use bytes::Bytes;

use crate::commands::{decode_bulk, Command};
use crate::error::ClientError;
use crate::frame::Frame;

/// `ECHO message` — the message, verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct Echo {
    pub message: Bytes,
}

impl Echo {
    pub fn new(message: Bytes) -> Self {
        Self { message }
    }
}

impl Command for Echo {
    type Output = Bytes;
    const NAME: &'static str = "ECHO";

    fn args(&self) -> Vec<Bytes> {
        vec![self.message.clone()]
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn decode(frame: Frame) -> Result<Self::Output, ClientError> {
        decode_bulk(Self::NAME, frame)
    }
}
