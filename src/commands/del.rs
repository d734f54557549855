use bytes::Bytes;

use crate::commands::{decode_integer, Command};
use crate::error::ClientError;
use crate::frame::Frame;

/// `DEL key [key ...]` — the number of keys that were removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Del {
    pub keys: Vec<String>,
}

impl Del {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl Command for Del {
    type Output = i64;
    const NAME: &'static str = "DEL";

    fn args(&self) -> Vec<Bytes> {
        self.keys.iter().map(|k| Bytes::from(k.clone())).collect()
    }

    fn decode(frame: Frame) -> Result<Self::Output, ClientError> {
        decode_integer(Self::NAME, frame)
    }
}
