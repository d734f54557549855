use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::RespCodec;
use crate::config::Config;
use crate::error::ClientError;
use crate::frame::{self, Frame};
use crate::request::Request;

/// Frames buffered between the reader task and the supervisor.
pub(crate) const READ_QUEUE_DEPTH: usize = 128;

/// Extra writer-queue slots beyond the in-flight cap, for frames the
/// supervisor injects itself (replay, resubscribe).
pub(crate) const WRITE_QUEUE_HEADROOM: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Draining,
    Closed,
}

/// Connection health, observable through a `watch` channel.
///
/// `last_error` holds the most recent connection-scoped error; request-scoped
/// errors (server errors, decode mismatches) never appear here.
#[derive(Debug, Clone)]
pub struct Health {
    pub state: ConnectionState,
    pub last_error: Option<ClientError>,
}

/// Spawns the supervisor task for one connection and returns the submission
/// and health handles.
pub(crate) fn spawn(config: Arc<Config>) -> (mpsc::Sender<Request>, watch::Receiver<Health>) {
    // The bounded channel doubles as the send buffer for requests parked
    // while the connection is down; a full channel is backpressure.
    let (submit_tx, submit_rx) = mpsc::channel(config.max_in_flight);
    let (health_tx, health_rx) = watch::channel(Health {
        state: ConnectionState::Disconnected,
        last_error: None,
    });

    let supervisor = Supervisor {
        config,
        submit_rx,
        health_tx,
        pending: VecDeque::new(),
        replay: VecDeque::new(),
        draining: false,
    };
    tokio::spawn(supervisor.run());

    (submit_tx, health_rx)
}

/// Waits until the connection is `Ready`, or returns its terminal error.
pub(crate) async fn await_ready(health: &mut watch::Receiver<Health>) -> Result<(), ClientError> {
    loop {
        {
            let current = health.borrow_and_update();
            match current.state {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Closed => {
                    return Err(current
                        .last_error
                        .clone()
                        .unwrap_or(ClientError::ConnectionClosed))
                }
                _ => {}
            }
        }
        if health.changed().await.is_err() {
            return Err(ClientError::ConnectionClosed);
        }
    }
}

enum ServeExit {
    /// All clients dropped and in-flight replies completed.
    Shutdown,
    ConnectionLost(ClientError),
}

struct Supervisor {
    config: Arc<Config>,
    submit_rx: mpsc::Receiver<Request>,
    health_tx: watch::Sender<Health>,
    /// Requests written to the socket whose reply is outstanding, in write
    /// order. The head is completed by the next decoded frame.
    pending: VecDeque<Request>,
    /// Idempotent survivors of a dropped connection, sent ahead of new
    /// submissions once the next connection is ready.
    replay: VecDeque<Request>,
    draining: bool,
}

impl Supervisor {
    #[instrument(name = "connection", skip(self), fields(host = %self.config.host, port = self.config.port))]
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            let stream = match connect_socket(&self.config).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("connect failed: {err}");
                    if self.backoff_or_close(&mut attempt, err).await {
                        continue;
                    }
                    return;
                }
            };

            self.set_state(ConnectionState::Authenticating);
            let (read_half, mut write_half) = stream.into_split();
            let mut framed = FramedRead::new(read_half, RespCodec);
            match handshake(&self.config, &mut framed, &mut write_half).await {
                Ok(()) => {}
                Err(err @ ClientError::AuthFailed { .. }) => {
                    // The server will keep rejecting these credentials;
                    // retrying cannot help.
                    error!("handshake rejected: {err}");
                    self.close_with(err);
                    return;
                }
                Err(err) => {
                    warn!("handshake failed: {err}");
                    if self.backoff_or_close(&mut attempt, err).await {
                        continue;
                    }
                    return;
                }
            }

            attempt = 0;
            self.set_state(ConnectionState::Ready);
            info!("connection ready");

            match self.serve(framed, write_half).await {
                ServeExit::Shutdown => {
                    debug!("connection drained");
                    self.set_state(ConnectionState::Closed);
                    return;
                }
                ServeExit::ConnectionLost(err) => {
                    warn!("connection lost: {err}");
                    self.partition_pending();
                    if self.draining {
                        self.close_with(err);
                        return;
                    }
                    if !self.backoff_or_close(&mut attempt, err).await {
                        return;
                    }
                }
            }
        }
    }

    /// Runs one connection until shutdown or loss. Owns the reader and
    /// writer tasks for the socket's two halves.
    async fn serve(
        &mut self,
        framed: FramedRead<OwnedReadHalf, RespCodec>,
        write_half: OwnedWriteHalf,
    ) -> ServeExit {
        let (frame_tx, mut frame_rx) = mpsc::channel(READ_QUEUE_DEPTH);
        let reader = tokio::spawn(run_reader(framed, frame_tx));

        let (write_tx, write_rx) = mpsc::channel(self.config.max_in_flight + WRITE_QUEUE_HEADROOM);
        let writer = tokio::spawn(run_writer(
            write_rx,
            write_half,
            self.config.max_write_batch_size,
        ));

        let exit = self.serve_loop(&mut frame_rx, &write_tx).await;

        reader.abort();
        writer.abort();
        exit
    }

    async fn serve_loop(
        &mut self,
        frame_rx: &mut mpsc::Receiver<Result<Frame, ClientError>>,
        write_tx: &mpsc::Sender<Bytes>,
    ) -> ServeExit {
        // Survivors of the previous connection go out ahead of anything
        // newly submitted, preserving their original order.
        while let Some(request) = self.replay.pop_front() {
            debug!(command = request.command, "replaying request");
            if write_tx.send(request.frame.clone()).await.is_err() {
                self.pending.push_back(request);
                return ServeExit::ConnectionLost(ClientError::Io("writer task stopped".to_string()));
            }
            self.pending.push_back(request);
        }

        loop {
            let can_accept = !self.draining && self.pending.len() < self.config.max_in_flight;

            tokio::select! {
                incoming = frame_rx.recv() => match incoming {
                    Some(Ok(frame)) => {
                        let Some(request) = self.pending.pop_front() else {
                            return ServeExit::ConnectionLost(ClientError::Protocol(format!(
                                "reply {frame} without a pending request"
                            )));
                        };
                        request.complete(reply_result(frame));
                        if self.draining && self.pending.is_empty() {
                            return ServeExit::Shutdown;
                        }
                    }
                    Some(Err(err)) => return ServeExit::ConnectionLost(err),
                    None => return ServeExit::ConnectionLost(ClientError::Io(
                        "reader task stopped".to_string(),
                    )),
                },
                submission = self.submit_rx.recv(), if can_accept => match submission {
                    Some(request) => {
                        if write_tx.send(request.frame.clone()).await.is_err() {
                            // The socket error surfaces through the reader;
                            // the request is accounted for like any other
                            // in-flight one.
                            self.pending.push_back(request);
                            return ServeExit::ConnectionLost(ClientError::Io(
                                "writer task stopped".to_string(),
                            ));
                        }
                        self.pending.push_back(request);
                    }
                    None => {
                        // All client handles dropped: stop accepting, let
                        // in-flight replies complete.
                        self.draining = true;
                        self.set_state(ConnectionState::Draining);
                        if self.pending.is_empty() {
                            return ServeExit::Shutdown;
                        }
                    }
                },
            }
        }
    }

    /// Walks the pending queue head-to-tail after a drop: idempotent
    /// requests move to the replay queue, the rest cannot be retried safely
    /// because the server may have executed them.
    fn partition_pending(&mut self) {
        let reconnect = !self.draining && self.config.reconnect.is_some();
        while let Some(request) = self.pending.pop_front() {
            if reconnect && request.idempotent {
                self.replay.push_back(request);
            } else {
                request.complete(Err(ClientError::ConnectionClosed));
            }
        }
    }

    /// Records the error and sleeps out the backoff. Returns `false` when
    /// reconnecting is disabled or the attempt budget is spent, in which
    /// case the connection has been closed.
    async fn backoff_or_close(&mut self, attempt: &mut u32, err: ClientError) -> bool {
        let Some(policy) = self.config.reconnect.clone() else {
            self.close_with(err);
            return false;
        };

        self.health_tx.send_modify(|health| {
            health.state = ConnectionState::Disconnected;
            health.last_error = Some(err.clone());
        });

        *attempt += 1;
        if *attempt >= policy.max_attempts {
            error!("giving up after {attempt} connection attempts");
            self.close_with(err);
            return false;
        }

        let delay = policy.delay(*attempt);
        debug!("reconnecting in {delay:?} (attempt {attempt})");
        tokio::time::sleep(delay).await;
        true
    }

    /// Terminal: fails everything still queued, parked, or in flight, and
    /// publishes the closing error. Requests see `ConnectionClosed` unless
    /// the handshake itself was rejected.
    fn close_with(&mut self, err: ClientError) {
        let request_err = match &err {
            ClientError::AuthFailed { .. } => err.clone(),
            _ => ClientError::ConnectionClosed,
        };
        while let Some(request) = self.replay.pop_front() {
            request.complete(Err(request_err.clone()));
        }
        while let Some(request) = self.pending.pop_front() {
            request.complete(Err(request_err.clone()));
        }
        self.submit_rx.close();
        while let Ok(request) = self.submit_rx.try_recv() {
            request.complete(Err(request_err.clone()));
        }
        self.health_tx.send_modify(|health| {
            health.state = ConnectionState::Closed;
            health.last_error = Some(err);
        });
    }

    fn set_state(&self, state: ConnectionState) {
        self.health_tx.send_modify(|health| {
            health.state = state;
            // A connection that made it back to Ready is healthy again.
            if state == ConnectionState::Ready {
                health.last_error = None;
            }
        });
    }
}

/// Maps an error reply onto the request's result; everything else passes
/// through untouched.
pub(crate) fn reply_result(frame: Frame) -> Result<Frame, ClientError> {
    match frame {
        Frame::Error(text) => Err(ClientError::server(&text)),
        frame => Ok(frame),
    }
}

/// Opens the TCP connection with the configured socket options, bounded by
/// `connect_timeout`.
pub(crate) async fn connect_socket(config: &Config) -> Result<TcpStream, ClientError> {
    let mut addrs = lookup_host((config.host.as_str(), config.port)).await?;
    let addr = addrs
        .next()
        .ok_or_else(|| ClientError::Io(format!("could not resolve {}", config.host)))?;

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(bytes) = config.tcp_send_buffer {
        socket.set_send_buffer_size(bytes)?;
    }
    if let Some(bytes) = config.tcp_recv_buffer {
        socket.set_recv_buffer_size(bytes)?;
    }

    let stream = timeout(config.connect_timeout, socket.connect(addr))
        .await
        .map_err(|_| ClientError::Io(format!("connect to {addr} timed out")))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Runs the configured handshake steps in order: `AUTH`, `CLIENT SETNAME`,
/// `SELECT`. Any error reply is fatal to the attempt.
pub(crate) async fn handshake(
    config: &Config,
    framed: &mut FramedRead<OwnedReadHalf, RespCodec>,
    socket: &mut OwnedWriteHalf,
) -> Result<(), ClientError> {
    let mut steps: Vec<Bytes> = Vec::new();
    if let Some(auth) = &config.auth {
        let mut args = vec![Bytes::from_static(b"AUTH")];
        if let Some(username) = &auth.username {
            args.push(Bytes::from(username.clone()));
        }
        args.push(Bytes::from(auth.password.clone()));
        steps.push(frame::encode_command(&args));
    }
    if let Some(name) = &config.client_name {
        steps.push(frame::encode_command(&[
            Bytes::from_static(b"CLIENT"),
            Bytes::from_static(b"SETNAME"),
            Bytes::from(name.clone()),
        ]));
    }
    if let Some(database) = config.database {
        steps.push(frame::encode_command(&[
            Bytes::from_static(b"SELECT"),
            Bytes::from(database.to_string()),
        ]));
    }

    for step in steps {
        socket.write_all(&step).await?;
        match framed.next().await {
            Some(Ok(Frame::Error(text))) => return Err(ClientError::auth_failed(&text)),
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err),
            None => {
                return Err(ClientError::Io(
                    "connection closed during handshake".to_string(),
                ))
            }
        }
    }

    Ok(())
}

/// Reader task: drains the socket through the codec and forwards every
/// decoded frame (or the first error) to the supervisor.
pub(crate) async fn run_reader(
    mut framed: FramedRead<OwnedReadHalf, RespCodec>,
    frames: mpsc::Sender<Result<Frame, ClientError>>,
) {
    loop {
        match framed.next().await {
            Some(Ok(frame)) => {
                if frames.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
            Some(Err(err)) => {
                let _ = frames.send(Err(err)).await;
                return;
            }
            None => {
                let _ = frames
                    .send(Err(ClientError::Io(
                        "connection reset by server".to_string(),
                    )))
                    .await;
                return;
            }
        }
    }
}

/// Writer task: coalesces queued frames up to the batch budget and flushes
/// when the budget is reached or the queue runs dry. Pipelining under load,
/// one write per frame under light load, no timer.
pub(crate) async fn run_writer(
    mut outgoing: mpsc::Receiver<Bytes>,
    mut socket: OwnedWriteHalf,
    max_batch: usize,
) {
    let mut buffer = BytesMut::with_capacity(max_batch);
    while let Some(head) = outgoing.recv().await {
        buffer.extend_from_slice(&head);
        while buffer.len() < max_batch {
            match outgoing.try_recv() {
                Ok(frame) => buffer.extend_from_slice(&frame),
                Err(_) => break,
            }
        }
        if socket.write_all(&buffer).await.is_err() {
            // The reader observes the same socket failure and reports it.
            return;
        }
        buffer.clear();
    }
}
