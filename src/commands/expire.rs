use bytes::Bytes;

use crate::commands::{decode_bool, Command};
use crate::error::ClientError;
use crate::frame::Frame;

/// `EXPIRE key seconds` — `true` when the timeout was set, `false` when the
/// key does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct Expire {
    pub key: String,
    pub seconds: i64,
}

impl Expire {
    pub fn new(key: impl Into<String>, seconds: i64) -> Self {
        Self {
            key: key.into(),
            seconds,
        }
    }
}

impl Command for Expire {
    type Output = bool;
    const NAME: &'static str = "EXPIRE";

    fn args(&self) -> Vec<Bytes> {
        vec![
            Bytes::from(self.key.clone()),
            Bytes::from(self.seconds.to_string()),
        ]
    }

    fn decode(frame: Frame) -> Result<Self::Output, ClientError> {
        decode_bool(Self::NAME, frame)
    }
}
