use bytes::Bytes;

use crate::commands::{decode_integer, Command};
use crate::error::ClientError;
use crate::frame::Frame;

/// `EXISTS key [key ...]` — how many of the named keys exist.
#[derive(Debug, Clone, PartialEq)]
pub struct Exists {
    pub keys: Vec<String>,
}

impl Exists {
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

impl Command for Exists {
    type Output = i64;
    const NAME: &'static str = "EXISTS";

    fn args(&self) -> Vec<Bytes> {
        self.keys.iter().map(|k| Bytes::from(k.clone())).collect()
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn decode(frame: Frame) -> Result<Self::Output, ClientError> {
        decode_integer(Self::NAME, frame)
    }
}
