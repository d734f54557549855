use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::commands::{Command, Del, Echo, Exists, Get, Incr, Ping, Set, Ttl};
use crate::config::Config;
use crate::connection::{self, ConnectionState, Health};
use crate::error::ClientError;
use crate::frame::Frame;
use crate::request::Request;

/// Handle to one pipelined connection.
///
/// Cheap to clone; all clones share the connection. Submissions from one
/// task preserve their order on the wire, and each caller sees its own
/// results in submission order.
#[derive(Clone, Debug)]
pub struct Client {
    config: Arc<Config>,
    submit_tx: mpsc::Sender<Request>,
    health: watch::Receiver<Health>,
}

impl Client {
    /// Connects and completes the handshake. With auto-reconnect enabled
    /// this retries under the backoff policy; it returns once the
    /// connection is ready or has terminally failed.
    pub async fn connect(config: Config) -> Result<Client, ClientError> {
        let config = Arc::new(config);
        let (submit_tx, mut health) = connection::spawn(config.clone());

        connection::await_ready(&mut health).await?;

        Ok(Client {
            config,
            submit_tx,
            health,
        })
    }

    /// Submits any command descriptor and decodes its typed reply.
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output, ClientError> {
        let frame = self
            .submit(C::NAME, command.idempotent(), command.encode())
            .await?;
        C::decode(frame)
    }

    pub async fn ping(&self) -> Result<String, ClientError> {
        self.execute(Ping::new()).await
    }

    pub async fn echo(&self, message: Bytes) -> Result<Bytes, ClientError> {
        self.execute(Echo::new(message)).await
    }

    pub async fn get(&self, key: impl Into<String>) -> Result<Option<Bytes>, ClientError> {
        self.execute(Get::new(key)).await
    }

    pub async fn set(&self, key: impl Into<String>, value: Bytes) -> Result<bool, ClientError> {
        self.execute(Set::new(key, value)).await
    }

    pub async fn del<I, S>(&self, keys: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.execute(Del::new(keys)).await
    }

    pub async fn exists<I, S>(&self, keys: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.execute(Exists::new(keys)).await
    }

    pub async fn incr(&self, key: impl Into<String>) -> Result<i64, ClientError> {
        self.execute(Incr::new(key)).await
    }

    pub async fn ttl(&self, key: impl Into<String>) -> Result<i64, ClientError> {
        self.execute(Ttl::new(key)).await
    }

    /// Current connection health: state plus the last connection-scoped
    /// error, if any.
    pub fn health(&self) -> Health {
        self.health.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.health.borrow().state
    }

    /// Consumes this handle and waits for the connection to close. The
    /// connection starts draining once every clone is gone: in-flight
    /// replies complete, then the socket shuts.
    pub async fn close(self) {
        let mut health = self.health.clone();
        drop(self);
        loop {
            if health.borrow_and_update().state == ConnectionState::Closed {
                return;
            }
            if health.changed().await.is_err() {
                return;
            }
        }
    }

    async fn submit(
        &self,
        command: &'static str,
        idempotent: bool,
        frame: Bytes,
    ) -> Result<Frame, ClientError> {
        let (request, completion) = Request::new(command, idempotent, frame);

        self.submit_tx.try_send(request).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ClientError::BackpressureExceeded,
            mpsc::error::TrySendError::Closed(_) => self.terminal_error(),
        })?;

        let reply = match self.config.receive_timeout {
            Some(deadline) => match timeout(deadline, completion).await {
                Ok(completed) => completed,
                // The request stays pending; its wire reply is consumed and
                // discarded whenever it arrives.
                Err(_) => return Err(ClientError::Timeout),
            },
            None => completion.await,
        };

        match reply {
            Ok(result) => result,
            Err(_) => Err(self.terminal_error()),
        }
    }

    /// The error a submission should surface once the connection is gone:
    /// a latched handshake failure beats the generic closed error.
    fn terminal_error(&self) -> ClientError {
        match self.health.borrow().last_error.clone() {
            Some(err @ ClientError::AuthFailed { .. }) => err,
            _ => ClientError::ConnectionClosed,
        }
    }
}
