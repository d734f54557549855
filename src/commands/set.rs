use bytes::Bytes;

use crate::commands::Command;
use crate::error::ClientError;
use crate::frame::Frame;

/// Existence guard for [`Set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetMode {
    #[default]
    Always,
    /// `NX` — only set the key if it does not already exist.
    IfAbsent,
    /// `XX` — only set the key if it already exists. Replaying after a drop
    /// cannot create a key that was not there, so this form is idempotent.
    IfPresent,
}

/// Expiry for [`Set`], in the unit sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// `EX` — time to live in seconds.
    Seconds(u64),
    /// `PX` — time to live in milliseconds.
    Milliseconds(u64),
}

/// `SET key value [EX s|PX ms] [NX|XX]` — `true` when the value was set,
/// `false` when the guard rejected it.
#[derive(Debug, Clone, PartialEq)]
pub struct Set {
    pub key: String,
    pub value: Bytes,
    pub expire: Option<Expiry>,
    pub mode: SetMode,
}

impl Set {
    pub fn new(key: impl Into<String>, value: Bytes) -> Self {
        Self {
            key: key.into(),
            value,
            expire: None,
            mode: SetMode::Always,
        }
    }
}

impl Command for Set {
    type Output = bool;
    const NAME: &'static str = "SET";

    fn args(&self) -> Vec<Bytes> {
        let mut args = vec![Bytes::from(self.key.clone()), self.value.clone()];
        match self.expire {
            Some(Expiry::Seconds(seconds)) => {
                args.push(Bytes::from_static(b"EX"));
                args.push(Bytes::from(seconds.to_string()));
            }
            Some(Expiry::Milliseconds(millis)) => {
                args.push(Bytes::from_static(b"PX"));
                args.push(Bytes::from(millis.to_string()));
            }
            None => {}
        }
        match self.mode {
            SetMode::Always => {}
            SetMode::IfAbsent => args.push(Bytes::from_static(b"NX")),
            SetMode::IfPresent => args.push(Bytes::from_static(b"XX")),
        }
        args
    }

    fn idempotent(&self) -> bool {
        matches!(self.mode, SetMode::IfPresent)
    }

    fn decode(frame: Frame) -> Result<Self::Output, ClientError> {
        match frame {
            Frame::Simple(ref s) if s == "OK" => Ok(true),
            Frame::Null => Ok(false),
            frame => Err(ClientError::unexpected(Self::NAME, &frame)),
        }
    }
}
