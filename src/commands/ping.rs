use bytes::Bytes;

use crate::commands::Command;
use crate::error::ClientError;
use crate::frame::Frame;

/// `PING [message]` — replies `PONG`, or echoes the message as a bulk string.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ping {
    pub message: Option<Bytes>,
}

impl Ping {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Command for Ping {
    type Output = String;
    const NAME: &'static str = "PING";

    fn args(&self) -> Vec<Bytes> {
        self.message.iter().cloned().collect()
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn decode(frame: Frame) -> Result<Self::Output, ClientError> {
        match frame {
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|_| ClientError::UnexpectedResponse("PING reply is not UTF-8".to_string())),
            frame => Err(ClientError::unexpected(Self::NAME, &frame)),
        }
    }
}
