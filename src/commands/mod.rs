pub mod decr;
pub mod del;
pub mod echo;
pub mod exists;
pub mod expire;
pub mod get;
pub mod getdel;
pub mod incr;
pub mod incrby;
pub mod ping;
pub mod set;
pub mod strlen;
pub mod ttl;

use bytes::Bytes;

use crate::error::ClientError;
use crate::frame::{self, Frame};

pub use decr::Decr;
pub use del::Del;
pub use echo::Echo;
pub use exists::Exists;
pub use expire::Expire;
pub use get::Get;
pub use getdel::GetDel;
pub use incr::Incr;
pub use incrby::IncrBy;
pub use ping::Ping;
pub use set::{Expiry, Set, SetMode};
pub use strlen::Strlen;
pub use ttl::Ttl;

/// Descriptor for a single command: its name, argument encoding, reply
/// decoder, and whether it is safe to replay after a connection drop.
///
/// The connection core never inspects command semantics; everything it needs
/// travels through this trait. Custom commands are supported by implementing
/// it outside the crate.
pub trait Command {
    /// Typed result of the command.
    type Output;

    /// ASCII command name, e.g. `GET`.
    const NAME: &'static str;

    /// Arguments following the command name.
    fn args(&self) -> Vec<Bytes>;

    /// Whether the command's effect is unchanged if the server executed it
    /// zero or one times. Idempotent requests are replayed after a connection
    /// drop; others fail with `ConnectionClosed`.
    fn idempotent(&self) -> bool {
        false
    }

    /// Maps the reply frame into the typed result. Returns
    /// `UnexpectedResponse` when the reply shape does not match.
    fn decode(frame: Frame) -> Result<Self::Output, ClientError>;

    /// The full encoded wire frame for this command.
    fn encode(&self) -> Bytes {
        let mut argv = vec![Bytes::from_static(Self::NAME.as_bytes())];
        argv.extend(self.args());
        frame::encode_command(&argv)
    }
}

pub(crate) fn decode_integer(command: &str, frame: Frame) -> Result<i64, ClientError> {
    match frame {
        Frame::Integer(i) => Ok(i),
        frame => Err(ClientError::unexpected(command, &frame)),
    }
}

/// `:1` / `:0` replies.
pub(crate) fn decode_bool(command: &str, frame: Frame) -> Result<bool, ClientError> {
    match frame {
        Frame::Integer(0) => Ok(false),
        Frame::Integer(1) => Ok(true),
        frame => Err(ClientError::unexpected(command, &frame)),
    }
}

pub(crate) fn decode_bulk(command: &str, frame: Frame) -> Result<Bytes, ClientError> {
    match frame {
        Frame::Bulk(bytes) => Ok(bytes),
        frame => Err(ClientError::unexpected(command, &frame)),
    }
}

/// Bulk replies where null means absent.
pub(crate) fn decode_optional_bulk(command: &str, frame: Frame) -> Result<Option<Bytes>, ClientError> {
    match frame {
        Frame::Bulk(bytes) => Ok(Some(bytes)),
        Frame::Null => Ok(None),
        frame => Err(ClientError::unexpected(command, &frame)),
    }
}
