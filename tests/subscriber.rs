use std::io::Cursor;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use rudis::frame::Frame;
use rudis::{Backoff, ClientError, Config, ConnectionState, Subscriber, SubscriptionHandler};

/// Server side of one accepted connection, speaking RESP at the frame level.
struct ServerConn {
    stream: TcpStream,
    buffer: BytesMut,
}

impl ServerConn {
    async fn read_command(&mut self) -> Frame {
        loop {
            let mut cursor = Cursor::new(&self.buffer[..]);
            match Frame::parse(&mut cursor) {
                Ok(frame) => {
                    let consumed = cursor.position() as usize;
                    let _ = self.buffer.split_to(consumed);
                    return frame;
                }
                Err(rudis::frame::Error::Incomplete) => {
                    let read = self
                        .stream
                        .read_buf(&mut self.buffer)
                        .await
                        .expect("mock server read");
                    assert!(read > 0, "client closed while a command was expected");
                }
                Err(err) => panic!("mock server received malformed bytes: {err}"),
            }
        }
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("mock server write");
    }

    /// `subscribe`-family confirmation push.
    async fn confirm(&mut self, kind: &str, subject: &str, count: i64) {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::copy_from_slice(kind.as_bytes())),
            Frame::Bulk(Bytes::copy_from_slice(subject.as_bytes())),
            Frame::Integer(count),
        ]);
        self.send(&frame.serialize()).await;
    }

    async fn publish(&mut self, channel: &str, payload: &str) {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"message")),
            Frame::Bulk(Bytes::copy_from_slice(channel.as_bytes())),
            Frame::Bulk(Bytes::copy_from_slice(payload.as_bytes())),
        ]);
        self.send(&frame.serialize()).await;
    }
}

struct MockServer {
    listener: TcpListener,
}

impl MockServer {
    async fn bind() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        MockServer { listener }
    }

    fn config(&self) -> Config {
        let addr = self.listener.local_addr().unwrap();
        Config::new("127.0.0.1", addr.port())
    }

    async fn accept(&self) -> ServerConn {
        let (stream, _) = self.listener.accept().await.unwrap();
        ServerConn {
            stream,
            buffer: BytesMut::with_capacity(4096),
        }
    }
}

fn command(parts: &[&[u8]]) -> Frame {
    Frame::Array(
        parts
            .iter()
            .map(|part| Frame::Bulk(Bytes::copy_from_slice(part)))
            .collect(),
    )
}

#[derive(Debug, PartialEq)]
enum Event {
    Message(String, Bytes),
    PMessage(String, String, Bytes),
    Subscribed(String, i64),
    Unsubscribed(String, i64),
    PSubscribed(String, i64),
    Error,
}

struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

impl Recorder {
    fn new() -> (Recorder, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Recorder { events: tx }, rx)
    }
}

impl SubscriptionHandler for Recorder {
    fn on_message(&mut self, channel: &str, payload: &Bytes) {
        let _ = self
            .events
            .send(Event::Message(channel.to_string(), payload.clone()));
    }

    fn on_pmessage(&mut self, pattern: &str, channel: &str, payload: &Bytes) {
        let _ = self.events.send(Event::PMessage(
            pattern.to_string(),
            channel.to_string(),
            payload.clone(),
        ));
    }

    fn on_subscribe(&mut self, channel: &str, count: i64) {
        let _ = self.events.send(Event::Subscribed(channel.to_string(), count));
    }

    fn on_unsubscribe(&mut self, channel: &str, count: i64) {
        let _ = self
            .events
            .send(Event::Unsubscribed(channel.to_string(), count));
    }

    fn on_psubscribe(&mut self, pattern: &str, count: i64) {
        let _ = self
            .events
            .send(Event::PSubscribed(pattern.to_string(), count));
    }

    fn on_error(&mut self, _error: &ClientError) {
        let _ = self.events.send(Event::Error);
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("timed out waiting for a push event")
        .expect("handler dropped")
}

fn fast_backoff() -> Backoff {
    Backoff {
        base: Duration::from_millis(10),
        cap: Duration::from_millis(50),
        jitter: Duration::ZERO,
        max_attempts: 5,
    }
}

#[tokio::test]
async fn subscribe_confirms_then_delivers_messages() {
    let server = MockServer::bind().await;
    let config = server.config();
    let (recorder, mut events) = Recorder::new();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"SUBSCRIBE", b"a", b"b"]));
        conn.confirm("subscribe", "a", 1).await;
        conn.confirm("subscribe", "b", 2).await;
        conn.publish("a", "hi").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let subscriber = Subscriber::connect(config, recorder).await.unwrap();
    subscriber.subscribe(["a", "b"]).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Event::Subscribed("a".to_string(), 1)
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Subscribed("b".to_string(), 2)
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Message("a".to_string(), Bytes::from("hi"))
    );

    let subscriptions = subscriber.subscriptions();
    assert!(subscriptions.channels.contains("a"));
    assert!(subscriptions.channels.contains("b"));

    server_task.abort();
}

#[tokio::test]
async fn unsubscribe_shrinks_the_confirmed_set() {
    let server = MockServer::bind().await;
    let config = server.config();
    let (recorder, mut events) = Recorder::new();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"SUBSCRIBE", b"a", b"b"]));
        conn.confirm("subscribe", "a", 1).await;
        conn.confirm("subscribe", "b", 2).await;
        assert_eq!(conn.read_command().await, command(&[b"UNSUBSCRIBE", b"a"]));
        conn.confirm("unsubscribe", "a", 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let subscriber = Subscriber::connect(config, recorder).await.unwrap();
    subscriber.subscribe(["a", "b"]).await.unwrap();
    subscriber.unsubscribe(["a"]).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Event::Subscribed("a".to_string(), 1)
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Subscribed("b".to_string(), 2)
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Unsubscribed("a".to_string(), 1)
    );

    let subscriptions = subscriber.subscriptions();
    assert!(!subscriptions.channels.contains("a"));
    assert!(subscriptions.channels.contains("b"));

    server_task.abort();
}

#[tokio::test]
async fn patterns_are_tracked_separately() {
    let server = MockServer::bind().await;
    let config = server.config();
    let (recorder, mut events) = Recorder::new();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"PSUBSCRIBE", b"news.*"]));
        conn.confirm("psubscribe", "news.*", 1).await;
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"pmessage")),
            Frame::Bulk(Bytes::from_static(b"news.*")),
            Frame::Bulk(Bytes::from_static(b"news.tech")),
            Frame::Bulk(Bytes::from_static(b"launch")),
        ]);
        conn.send(&frame.serialize()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let subscriber = Subscriber::connect(config, recorder).await.unwrap();
    subscriber.psubscribe(["news.*"]).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Event::PSubscribed("news.*".to_string(), 1)
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::PMessage(
            "news.*".to_string(),
            "news.tech".to_string(),
            Bytes::from("launch")
        )
    );

    let subscriptions = subscriber.subscriptions();
    assert!(subscriptions.patterns.contains("news.*"));
    assert!(subscriptions.channels.is_empty());

    server_task.abort();
}

#[tokio::test]
async fn non_pubsub_commands_are_rejected() {
    let server = MockServer::bind().await;
    let config = server.config();
    let (recorder, _events) = Recorder::new();

    let server_task = tokio::spawn(async move {
        let _conn = server.accept().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let subscriber = Subscriber::connect(config, recorder).await.unwrap();

    let err = subscriber
        .raw(vec![Bytes::from("GET"), Bytes::from("k")])
        .await
        .unwrap_err();

    assert_eq!(err, ClientError::InvalidCommand("GET".to_string()));
    server_task.abort();
}

#[tokio::test]
async fn ping_interleaves_with_pushes() {
    let server = MockServer::bind().await;
    let config = server.config();
    let (recorder, mut events) = Recorder::new();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"SUBSCRIBE", b"a"]));
        conn.confirm("subscribe", "a", 1).await;
        assert_eq!(conn.read_command().await, command(&[b"PING"]));
        // A push slipping in ahead of the reply must not steal it.
        conn.publish("a", "first").await;
        conn.send(b"+PONG\r\n").await;
        conn.publish("a", "second").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let subscriber = Subscriber::connect(config, recorder).await.unwrap();
    subscriber.subscribe(["a"]).await.unwrap();

    assert_eq!(subscriber.ping().await.unwrap(), "PONG");

    assert_eq!(
        next_event(&mut events).await,
        Event::Subscribed("a".to_string(), 1)
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Message("a".to_string(), Bytes::from("first"))
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Message("a".to_string(), Bytes::from("second"))
    );

    server_task.abort();
}

#[tokio::test]
async fn reconnect_restores_confirmed_subscriptions() {
    let server = MockServer::bind().await;
    let mut config = server.config();
    config.reconnect = Some(fast_backoff());
    let (recorder, mut events) = Recorder::new();

    let server_task = tokio::spawn(async move {
        // First connection: confirm the subscription, then drop.
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"SUBSCRIBE", b"a"]));
        conn.confirm("subscribe", "a", 1).await;
        drop(conn);

        // Second connection: the client restores the set on its own before
        // anything else.
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"SUBSCRIBE", b"a"]));
        conn.confirm("subscribe", "a", 1).await;
        conn.publish("a", "back").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let subscriber = Subscriber::connect(config, recorder).await.unwrap();
    subscriber.subscribe(["a"]).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Event::Subscribed("a".to_string(), 1)
    );
    // The drop surfaces on the error callback, then the restore re-confirms.
    assert_eq!(next_event(&mut events).await, Event::Error);
    assert_eq!(
        next_event(&mut events).await,
        Event::Subscribed("a".to_string(), 1)
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Message("a".to_string(), Bytes::from("back"))
    );

    assert!(subscriber.subscriptions().channels.contains("a"));

    // The drop surfaced while disconnected but clears once recovered.
    let health = subscriber.health();
    assert_eq!(health.state, ConnectionState::Ready);
    assert_eq!(health.last_error, None);
    server_task.abort();
}

#[tokio::test]
async fn quit_closes_the_connection() {
    let server = MockServer::bind().await;
    let mut config = server.config();
    // Even with reconnect enabled, QUIT must not trigger it.
    config.reconnect = Some(fast_backoff());
    let (recorder, _events) = Recorder::new();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"QUIT"]));
        conn.send(b"+OK\r\n").await;
    });

    let subscriber = Subscriber::connect(config, recorder).await.unwrap();
    subscriber.quit().await.unwrap();

    server_task.await.unwrap();
}
