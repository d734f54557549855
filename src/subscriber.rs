use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::RespCodec;
use crate::config::Config;
use crate::connection::{
    self, connect_socket, handshake, reply_result, run_reader, run_writer, ConnectionState,
    Health, READ_QUEUE_DEPTH, WRITE_QUEUE_HEADROOM,
};
use crate::error::ClientError;
use crate::frame::{self, Frame};
use crate::request::Request;

/// Commands a subscriber connection may send besides the handshake.
const ALLOWED: &[&str] = &[
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "PSUBSCRIBE",
    "PUNSUBSCRIBE",
    "PING",
    "QUIT",
];

/// Callbacks for server pushes on a subscriber connection.
///
/// Invoked from the connection's supervisor task, one at a time, in the
/// order frames arrive from the server.
pub trait SubscriptionHandler: Send + 'static {
    fn on_message(&mut self, channel: &str, payload: &Bytes);
    fn on_pmessage(&mut self, pattern: &str, channel: &str, payload: &Bytes);
    fn on_subscribe(&mut self, _channel: &str, _count: i64) {}
    fn on_unsubscribe(&mut self, _channel: &str, _count: i64) {}
    fn on_psubscribe(&mut self, _pattern: &str, _count: i64) {}
    fn on_punsubscribe(&mut self, _pattern: &str, _count: i64) {}
    /// Connection-scoped errors: drops, protocol failures, handshake
    /// rejections. Request-scoped errors surface on the request itself.
    fn on_error(&mut self, _error: &ClientError) {}
}

/// Channels and patterns the server has confirmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    pub channels: BTreeSet<String>,
    pub patterns: BTreeSet<String>,
}

/// Handle to a subscription-mode connection.
///
/// The connection multiplexes replies to the commands below with an
/// unsolicited push stream delivered to the [`SubscriptionHandler`]. After a
/// drop, the confirmed subscription set is restored with one aggregate
/// `SUBSCRIBE`/`PSUBSCRIBE` before any parked command goes out.
#[derive(Clone)]
pub struct Subscriber {
    config: Arc<Config>,
    submit_tx: mpsc::Sender<SubRequest>,
    health: watch::Receiver<Health>,
    subscriptions: Arc<Mutex<SubscriptionSet>>,
}

impl Subscriber {
    pub async fn connect(
        config: Config,
        handler: impl SubscriptionHandler,
    ) -> Result<Subscriber, ClientError> {
        let config = Arc::new(config);
        let subscriptions = Arc::new(Mutex::new(SubscriptionSet::default()));

        let (submit_tx, submit_rx) = mpsc::channel(config.max_in_flight);
        let (health_tx, mut health) = watch::channel(Health {
            state: ConnectionState::Disconnected,
            last_error: None,
        });

        let supervisor = SubSupervisor {
            config: config.clone(),
            submit_rx,
            health_tx,
            handler: Box::new(handler),
            subscriptions: subscriptions.clone(),
            pending: VecDeque::new(),
            replay: VecDeque::new(),
            draining: false,
        };
        tokio::spawn(supervisor.run());

        connection::await_ready(&mut health).await?;

        Ok(Subscriber {
            config,
            submit_tx,
            health,
            subscriptions,
        })
    }

    /// Subscribes to one or more channels; returns once the server has
    /// confirmed every one of them.
    pub async fn subscribe<I, S>(&self, channels: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        if channels.is_empty() {
            return Err(ClientError::InvalidCommand(
                "SUBSCRIBE needs at least one channel".to_string(),
            ));
        }
        let count = channels.len();
        let frame = subscribe_frame("SUBSCRIBE", &channels);
        self.submit("SUBSCRIBE", frame, Acks::Confirmations(count))
            .await?;
        Ok(())
    }

    /// Unsubscribes from the given channels, or from all of them when the
    /// list is empty.
    pub async fn unsubscribe<I, S>(&self, channels: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        let count = if channels.is_empty() {
            // A bare UNSUBSCRIBE is acknowledged once per confirmed channel,
            // or once with a null channel when there are none.
            self.subscriptions().channels.len().max(1)
        } else {
            channels.len()
        };
        let frame = subscribe_frame("UNSUBSCRIBE", &channels);
        self.submit("UNSUBSCRIBE", frame, Acks::Confirmations(count))
            .await?;
        Ok(())
    }

    pub async fn psubscribe<I, S>(&self, patterns: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        if patterns.is_empty() {
            return Err(ClientError::InvalidCommand(
                "PSUBSCRIBE needs at least one pattern".to_string(),
            ));
        }
        let count = patterns.len();
        let frame = subscribe_frame("PSUBSCRIBE", &patterns);
        self.submit("PSUBSCRIBE", frame, Acks::Confirmations(count))
            .await?;
        Ok(())
    }

    pub async fn punsubscribe<I, S>(&self, patterns: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let count = if patterns.is_empty() {
            self.subscriptions().patterns.len().max(1)
        } else {
            patterns.len()
        };
        let frame = subscribe_frame("PUNSUBSCRIBE", &patterns);
        self.submit("PUNSUBSCRIBE", frame, Acks::Confirmations(count))
            .await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<String, ClientError> {
        let frame = frame::encode_command(&[Bytes::from_static(b"PING")]);
        match self.submit("PING", frame, Acks::Reply).await? {
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|_| ClientError::UnexpectedResponse("PING reply is not UTF-8".to_string())),
            frame => Err(ClientError::unexpected("PING", &frame)),
        }
    }

    /// Sends `QUIT` and waits for the connection to close.
    pub async fn quit(self) -> Result<(), ClientError> {
        let frame = frame::encode_command(&[Bytes::from_static(b"QUIT")]);
        self.submit("QUIT", frame, Acks::Reply).await?;
        let mut health = self.health.clone();
        drop(self);
        loop {
            if health.borrow_and_update().state == ConnectionState::Closed {
                return Ok(());
            }
            if health.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Submits a raw command, restricted to the subscription-mode
    /// allow-list; anything else fails with `InvalidCommand`.
    pub async fn raw(&self, args: Vec<Bytes>) -> Result<Frame, ClientError> {
        let Some(first) = args.first() else {
            return Err(ClientError::InvalidCommand("empty command".to_string()));
        };
        let name = String::from_utf8_lossy(first).to_ascii_uppercase();
        let Some(&name) = ALLOWED.iter().find(|&&allowed| allowed == name) else {
            return Err(ClientError::InvalidCommand(name));
        };

        let acks = match name {
            "SUBSCRIBE" | "PSUBSCRIBE" => {
                if args.len() < 2 {
                    return Err(ClientError::InvalidCommand(format!(
                        "{name} needs at least one argument"
                    )));
                }
                Acks::Confirmations(args.len() - 1)
            }
            "UNSUBSCRIBE" => Acks::Confirmations(if args.len() > 1 {
                args.len() - 1
            } else {
                self.subscriptions().channels.len().max(1)
            }),
            "PUNSUBSCRIBE" => Acks::Confirmations(if args.len() > 1 {
                args.len() - 1
            } else {
                self.subscriptions().patterns.len().max(1)
            }),
            _ => Acks::Reply,
        };

        self.submit(name, frame::encode_command(&args), acks).await
    }

    /// Snapshot of the confirmed subscription set.
    pub fn subscriptions(&self) -> SubscriptionSet {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Current connection health: state plus the last connection-scoped
    /// error, if any.
    pub fn health(&self) -> Health {
        self.health.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.health.borrow().state
    }

    async fn submit(
        &self,
        command: &'static str,
        frame: Bytes,
        acks: Acks,
    ) -> Result<Frame, ClientError> {
        // Subscription commands and PING are safe to replay after a drop.
        let idempotent = command != "QUIT";
        let (request, completion) = Request::new(command, idempotent, frame);

        self.submit_tx
            .try_send(SubRequest { request, acks })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => ClientError::BackpressureExceeded,
                mpsc::error::TrySendError::Closed(_) => self.terminal_error(),
            })?;

        let reply = match self.config.receive_timeout {
            Some(deadline) => match timeout(deadline, completion).await {
                Ok(completed) => completed,
                Err(_) => return Err(ClientError::Timeout),
            },
            None => completion.await,
        };

        match reply {
            Ok(result) => result,
            Err(_) => Err(self.terminal_error()),
        }
    }

    fn terminal_error(&self) -> ClientError {
        match self.health.borrow().last_error.clone() {
            Some(err @ ClientError::AuthFailed { .. }) => err,
            _ => ClientError::ConnectionClosed,
        }
    }
}

fn subscribe_frame(name: &'static str, subjects: &[String]) -> Bytes {
    let mut args = vec![Bytes::from_static(name.as_bytes())];
    args.extend(subjects.iter().map(|s| Bytes::from(s.clone())));
    frame::encode_command(&args)
}

struct SubRequest {
    request: Request,
    acks: Acks,
}

enum Acks {
    /// One ordinary reply (`PING`, `QUIT`).
    Reply,
    /// One confirmation push per named channel or pattern.
    Confirmations(usize),
}

/// What an incoming frame means on a subscriber connection in `Ready`.
enum Push {
    Message {
        channel: String,
        payload: Bytes,
    },
    PMessage {
        pattern: String,
        channel: String,
        payload: Bytes,
    },
    Confirm {
        kind: ConfirmKind,
        /// Null when a bare `UNSUBSCRIBE` found nothing to remove.
        subject: Option<String>,
        count: i64,
    },
}

#[derive(Clone, Copy)]
enum ConfirmKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
}

enum ServeExit {
    Shutdown,
    ConnectionLost(ClientError),
}

struct SubSupervisor {
    config: Arc<Config>,
    submit_rx: mpsc::Receiver<SubRequest>,
    health_tx: watch::Sender<Health>,
    handler: Box<dyn SubscriptionHandler>,
    subscriptions: Arc<Mutex<SubscriptionSet>>,
    pending: VecDeque<SubRequest>,
    replay: VecDeque<SubRequest>,
    draining: bool,
}

impl SubSupervisor {
    #[instrument(name = "subscriber", skip(self), fields(host = %self.config.host, port = self.config.port))]
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
                    error!("handshake rejected: {err}");
                    self.handler.on_error(&err);
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
            info!("subscriber ready");

            match self.serve(framed, write_half).await {
                ServeExit::Shutdown => {
                    debug!("subscriber closed");
                    self.set_state(ConnectionState::Closed);
                    return;
                }
                ServeExit::ConnectionLost(err) => {
                    warn!("subscriber connection lost: {err}");
                    self.handler.on_error(&err);
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

    async fn serve(
        &mut self,
        framed: FramedRead<tokio::net::tcp::OwnedReadHalf, RespCodec>,
        write_half: tokio::net::tcp::OwnedWriteHalf,
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
        // Restore the confirmed set first: one aggregate SUBSCRIBE and one
        // PSUBSCRIBE go out before any replayed or newly admitted command.
        let snapshot = self.subscriptions.lock().unwrap().clone();
        for (name, subjects) in [
            ("SUBSCRIBE", &snapshot.channels),
            ("PSUBSCRIBE", &snapshot.patterns),
        ] {
            if subjects.is_empty() {
                continue;
            }
            let subjects: Vec<String> = subjects.iter().cloned().collect();
            info!(command = name, count = subjects.len(), "restoring subscriptions");
            let request = Request::internal(name, subscribe_frame(name, &subjects));
            let entry = SubRequest {
                request,
                acks: Acks::Confirmations(subjects.len()),
            };
            if write_tx.send(entry.request.frame.clone()).await.is_err() {
                self.pending.push_back(entry);
                return ServeExit::ConnectionLost(ClientError::Io("writer task stopped".to_string()));
            }
            self.pending.push_back(entry);
        }

        while let Some(entry) = self.replay.pop_front() {
            debug!(command = entry.request.command, "replaying request");
            if write_tx.send(entry.request.frame.clone()).await.is_err() {
                self.pending.push_back(entry);
                return ServeExit::ConnectionLost(ClientError::Io("writer task stopped".to_string()));
            }
            self.pending.push_back(entry);
        }

        loop {
            let can_accept = !self.draining && self.pending.len() < self.config.max_in_flight;

            tokio::select! {
                incoming = frame_rx.recv() => match incoming {
                    Some(Ok(frame)) => match self.handle_frame(frame) {
                        Ok(FrameOutcome::Continue) => {
                            if self.draining && self.pending.is_empty() {
                                return ServeExit::Shutdown;
                            }
                        }
                        Ok(FrameOutcome::Quit) => return ServeExit::Shutdown,
                        Err(err) => return ServeExit::ConnectionLost(err),
                    },
                    Some(Err(err)) => return ServeExit::ConnectionLost(err),
                    None => return ServeExit::ConnectionLost(ClientError::Io(
                        "reader task stopped".to_string(),
                    )),
                },
                submission = self.submit_rx.recv(), if can_accept => match submission {
                    Some(entry) => {
                        if write_tx.send(entry.request.frame.clone()).await.is_err() {
                            self.pending.push_back(entry);
                            return ServeExit::ConnectionLost(ClientError::Io(
                                "writer task stopped".to_string(),
                            ));
                        }
                        self.pending.push_back(entry);
                    }
                    None => {
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

    fn handle_frame(&mut self, frame: Frame) -> Result<FrameOutcome, ClientError> {
        match classify_push(&frame)? {
            Some(push) => {
                self.handle_push(push, frame);
                Ok(FrameOutcome::Continue)
            }
            None => {
                let Some(entry) = self.pending.pop_front() else {
                    return Err(ClientError::Protocol(format!(
                        "reply {frame} without a pending request"
                    )));
                };
                let quitting = entry.request.command == "QUIT" && !matches!(frame, Frame::Error(_));
                entry.request.complete(reply_result(frame));
                if quitting {
                    Ok(FrameOutcome::Quit)
                } else {
                    Ok(FrameOutcome::Continue)
                }
            }
        }
    }

    fn handle_push(&mut self, push: Push, frame: Frame) {
        match push {
            Push::Message { channel, payload } => self.handler.on_message(&channel, &payload),
            Push::PMessage {
                pattern,
                channel,
                payload,
            } => self.handler.on_pmessage(&pattern, &channel, &payload),
            Push::Confirm {
                kind,
                subject,
                count,
            } => {
                {
                    let mut subscriptions = self.subscriptions.lock().unwrap();
                    if let Some(subject) = &subject {
                        match kind {
                            ConfirmKind::Subscribe => {
                                subscriptions.channels.insert(subject.clone());
                            }
                            ConfirmKind::Unsubscribe => {
                                subscriptions.channels.remove(subject);
                            }
                            ConfirmKind::PSubscribe => {
                                subscriptions.patterns.insert(subject.clone());
                            }
                            ConfirmKind::PUnsubscribe => {
                                subscriptions.patterns.remove(subject);
                            }
                        }
                    }
                }

                let subject = subject.as_deref().unwrap_or("");
                match kind {
                    ConfirmKind::Subscribe => self.handler.on_subscribe(subject, count),
                    ConfirmKind::Unsubscribe => self.handler.on_unsubscribe(subject, count),
                    ConfirmKind::PSubscribe => self.handler.on_psubscribe(subject, count),
                    ConfirmKind::PUnsubscribe => self.handler.on_punsubscribe(subject, count),
                }

                // A confirmation is also the reply to the head request when
                // one is waiting on it.
                if let Some(head) = self.pending.front_mut() {
                    if let Acks::Confirmations(remaining) = &mut head.acks {
                        *remaining = remaining.saturating_sub(1);
                        if *remaining == 0 {
                            let entry = self.pending.pop_front().expect("head exists");
                            entry.request.complete(Ok(frame));
                        }
                    }
                }
            }
        }
    }

    fn partition_pending(&mut self) {
        let reconnect = !self.draining && self.config.reconnect.is_some();
        while let Some(entry) = self.pending.pop_front() {
            if reconnect && entry.request.idempotent {
                self.replay.push_back(entry);
            } else {
                entry.request.complete(Err(ClientError::ConnectionClosed));
            }
        }
    }

    async fn backoff_or_close(&mut self, attempt: &mut u32, err: ClientError) -> bool {
        let Some(policy) = self.config.reconnect.clone() else {
            self.handler.on_error(&err);
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
            self.handler.on_error(&err);
            self.close_with(err);
            return false;
        }

        let delay = policy.delay(*attempt);
        debug!("reconnecting in {delay:?} (attempt {attempt})");
        tokio::time::sleep(delay).await;
        true
    }

    fn close_with(&mut self, err: ClientError) {
        let request_err = match &err {
            ClientError::AuthFailed { .. } => err.clone(),
            _ => ClientError::ConnectionClosed,
        };
        while let Some(entry) = self.replay.pop_front() {
            entry.request.complete(Err(request_err.clone()));
        }
        while let Some(entry) = self.pending.pop_front() {
            entry.request.complete(Err(request_err.clone()));
        }
        self.submit_rx.close();
        while let Ok(entry) = self.submit_rx.try_recv() {
            entry.request.complete(Err(request_err.clone()));
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

enum FrameOutcome {
    Continue,
    Quit,
}

/// Classifies an incoming frame. Push frames are arrays whose first element
/// names one of the six pub/sub kinds; everything else flows to the pending
/// queue. A recognizably push-shaped frame with a malformed body is a
/// protocol error.
fn classify_push(frame: &Frame) -> Result<Option<Push>, ClientError> {
    let Frame::Array(items) = frame else {
        return Ok(None);
    };
    let Some(Frame::Bulk(kind)) = items.first() else {
        return Ok(None);
    };

    let kind = String::from_utf8_lossy(kind).to_ascii_lowercase();
    match kind.as_str() {
        "message" => match &items[1..] {
            [Frame::Bulk(channel), Frame::Bulk(payload)] => Ok(Some(Push::Message {
                channel: utf8_subject(channel)?,
                payload: payload.clone(),
            })),
            _ => Err(malformed_push("message")),
        },
        "pmessage" => match &items[1..] {
            [Frame::Bulk(pattern), Frame::Bulk(channel), Frame::Bulk(payload)] => {
                Ok(Some(Push::PMessage {
                    pattern: utf8_subject(pattern)?,
                    channel: utf8_subject(channel)?,
                    payload: payload.clone(),
                }))
            }
            _ => Err(malformed_push("pmessage")),
        },
        "subscribe" | "unsubscribe" | "psubscribe" | "punsubscribe" => {
            let confirm_kind = match kind.as_str() {
                "subscribe" => ConfirmKind::Subscribe,
                "unsubscribe" => ConfirmKind::Unsubscribe,
                "psubscribe" => ConfirmKind::PSubscribe,
                _ => ConfirmKind::PUnsubscribe,
            };
            match &items[1..] {
                [Frame::Bulk(subject), Frame::Integer(count)] => Ok(Some(Push::Confirm {
                    kind: confirm_kind,
                    subject: Some(utf8_subject(subject)?),
                    count: *count,
                })),
                [Frame::Null, Frame::Integer(count)] => Ok(Some(Push::Confirm {
                    kind: confirm_kind,
                    subject: None,
                    count: *count,
                })),
                _ => Err(malformed_push(&kind)),
            }
        }
        _ => Ok(None),
    }
}

fn utf8_subject(bytes: &Bytes) -> Result<String, ClientError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ClientError::Protocol("push subject is not UTF-8".to_string()))
}

fn malformed_push(kind: &str) -> ClientError {
    ClientError::Protocol(format!("malformed {kind} push frame"))
}
