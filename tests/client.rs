use std::io::Cursor;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use rudis::frame::Frame;
use rudis::{Auth, Backoff, Client, ClientError, Config, ConnectionState};

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

fn fast_backoff() -> Backoff {
    Backoff {
        base: Duration::from_millis(10),
        cap: Duration::from_millis(50),
        jitter: Duration::ZERO,
        max_attempts: 5,
    }
}

#[tokio::test]
async fn ping_round_trip() {
    let server = MockServer::bind().await;
    let config = server.config();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"PING"]));
        conn.send(b"+PONG\r\n").await;
    });

    let client = Client::connect(config).await.unwrap();
    let pong = client.ping().await.unwrap();

    assert_eq!(pong, "PONG");
    server_task.await.unwrap();
}

#[tokio::test]
async fn pipelined_set_and_get() {
    let server = MockServer::bind().await;
    let config = server.config();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"SET", b"k", b"v"]));
        assert_eq!(conn.read_command().await, command(&[b"GET", b"k"]));
        conn.send(b"+OK\r\n$1\r\nv\r\n").await;
    });

    let client = Client::connect(config).await.unwrap();

    // Both futures are submitted before either reply arrives.
    let (set, get) = tokio::join!(client.set("k", Bytes::from("v")), client.get("k"));

    assert!(set.unwrap());
    assert_eq!(get.unwrap(), Some(Bytes::from("v")));
    server_task.await.unwrap();
}

#[tokio::test]
async fn get_missing_key_is_none() {
    let server = MockServer::bind().await;
    let config = server.config();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"GET", b"missing"]));
        conn.send(b"$-1\r\n").await;
    });

    let client = Client::connect(config).await.unwrap();

    assert_eq!(client.get("missing").await.unwrap(), None);
    server_task.await.unwrap();
}

#[tokio::test]
async fn server_error_completes_one_request_and_connection_survives() {
    let server = MockServer::bind().await;
    let config = server.config();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"GET", b"k"]));
        conn.send(b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n")
            .await;
        assert_eq!(conn.read_command().await, command(&[b"PING"]));
        conn.send(b"+PONG\r\n").await;
    });

    let client = Client::connect(config).await.unwrap();

    let err = client.get("k").await.unwrap_err();
    assert!(matches!(err, ClientError::Server { ref kind, .. } if kind == "WRONGTYPE"));

    // The error was request-scoped; the connection keeps serving.
    assert_eq!(client.ping().await.unwrap(), "PONG");
    server_task.await.unwrap();
}

#[tokio::test]
async fn handshake_runs_auth_setname_select_in_order() {
    let server = MockServer::bind().await;
    let mut config = server.config();
    config.auth = Some(Auth {
        username: None,
        password: "sesame".to_string(),
    });
    config.client_name = Some("myapp".to_string());
    config.database = Some(2);

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"AUTH", b"sesame"]));
        conn.send(b"+OK\r\n").await;
        assert_eq!(
            conn.read_command().await,
            command(&[b"CLIENT", b"SETNAME", b"myapp"])
        );
        conn.send(b"+OK\r\n").await;
        assert_eq!(conn.read_command().await, command(&[b"SELECT", b"2"]));
        conn.send(b"+OK\r\n").await;
        assert_eq!(conn.read_command().await, command(&[b"PING"]));
        conn.send(b"+PONG\r\n").await;
    });

    let client = Client::connect(config).await.unwrap();

    assert_eq!(client.ping().await.unwrap(), "PONG");
    server_task.await.unwrap();
}

#[tokio::test]
async fn rejected_auth_surfaces_as_auth_failed() {
    let server = MockServer::bind().await;
    let mut config = server.config();
    config.auth = Some(Auth {
        username: None,
        password: "wrong".to_string(),
    });

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"AUTH", b"wrong"]));
        conn.send(b"-WRONGPASS invalid username-password pair\r\n")
            .await;
    });

    let err = Client::connect(config).await.unwrap_err();

    assert!(matches!(err, ClientError::AuthFailed { ref kind, .. } if kind == "WRONGPASS"));
    server_task.await.unwrap();
}

#[tokio::test]
async fn auth_failure_is_terminal_even_with_reconnect() {
    let server = MockServer::bind().await;
    let mut config = server.config();
    config.auth = Some(Auth {
        username: None,
        password: "wrong".to_string(),
    });
    config.reconnect = Some(fast_backoff());

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        let _ = conn.read_command().await;
        conn.send(b"-WRONGPASS invalid username-password pair\r\n")
            .await;
    });

    let err = Client::connect(config).await.unwrap_err();

    assert!(matches!(err, ClientError::AuthFailed { .. }));
    server_task.await.unwrap();
}

#[tokio::test]
async fn replies_complete_in_submission_order() {
    let server = MockServer::bind().await;
    let config = server.config();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"GET", b"one"]));
        assert_eq!(conn.read_command().await, command(&[b"GET", b"two"]));
        assert_eq!(conn.read_command().await, command(&[b"GET", b"three"]));
        conn.send(b"$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n").await;
    });

    let client = Client::connect(config).await.unwrap();

    let (one, two, three) = tokio::join!(
        client.get("one"),
        client.get("two"),
        client.get("three")
    );

    assert_eq!(one.unwrap(), Some(Bytes::from("a")));
    assert_eq!(two.unwrap(), Some(Bytes::from("b")));
    assert_eq!(three.unwrap(), Some(Bytes::from("c")));
    server_task.await.unwrap();
}

#[tokio::test]
async fn receive_timeout_fails_locally_and_late_reply_is_consumed() {
    let server = MockServer::bind().await;
    let mut config = server.config();
    config.receive_timeout = Some(Duration::from_millis(100));

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"GET", b"slow"]));
        // Reply only after the client's deadline has passed.
        sleep(Duration::from_millis(250)).await;
        conn.send(b"$4\r\nlate\r\n").await;
        assert_eq!(conn.read_command().await, command(&[b"GET", b"fast"]));
        conn.send(b"$1\r\nb\r\n").await;
    });

    let client = Client::connect(config).await.unwrap();

    let err = client.get("slow").await.unwrap_err();
    assert_eq!(err, ClientError::Timeout);

    // The late reply matched the timed-out request, not this one.
    assert_eq!(client.get("fast").await.unwrap(), Some(Bytes::from("b")));
    server_task.await.unwrap();
}

#[tokio::test]
async fn submissions_beyond_the_window_fail_fast() {
    let server = MockServer::bind().await;
    let mut config = server.config();
    config.max_in_flight = 1;

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        // Read but never reply, keeping the window occupied.
        let _ = conn.read_command().await;
        sleep(Duration::from_millis(500)).await;
    });

    let client = Client::connect(config).await.unwrap();

    // First request occupies the in-flight window, the second parks in the
    // send buffer, the third has nowhere to go.
    let first = tokio::spawn({
        let client = client.clone();
        async move { client.get("one").await }
    });
    sleep(Duration::from_millis(50)).await;
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.get("two").await }
    });
    sleep(Duration::from_millis(50)).await;

    let err = client.get("three").await.unwrap_err();
    assert_eq!(err, ClientError::BackpressureExceeded);

    first.abort();
    second.abort();
    server_task.abort();
}

#[tokio::test]
async fn drop_replays_idempotent_and_fails_writes() {
    let server = MockServer::bind().await;
    let mut config = server.config();
    config.reconnect = Some(fast_backoff());

    let server_task = tokio::spawn(async move {
        // First connection: take both commands, then drop without replying.
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"SET", b"k", b"1"]));
        assert_eq!(conn.read_command().await, command(&[b"GET", b"k"]));
        drop(conn);

        // Second connection: only the idempotent GET is replayed.
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"GET", b"k"]));
        conn.send(b"$1\r\nv\r\n").await;
    });

    let client = Client::connect(config).await.unwrap();

    let (set, get) = tokio::join!(client.set("k", Bytes::from("1")), client.get("k"));

    // The SET may or may not have executed on the server; it cannot be
    // replayed safely.
    assert_eq!(set.unwrap_err(), ClientError::ConnectionClosed);
    assert_eq!(get.unwrap(), Some(Bytes::from("v")));
    server_task.await.unwrap();
}

#[tokio::test]
async fn health_clears_after_recovering_from_a_drop() {
    let server = MockServer::bind().await;
    let mut config = server.config();
    config.reconnect = Some(fast_backoff());

    let server_task = tokio::spawn(async move {
        // First connection: drop straight away to leave an error behind.
        let conn = server.accept().await;
        drop(conn);

        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"PING"]));
        conn.send(b"+PONG\r\n").await;
        sleep(Duration::from_millis(200)).await;
    });

    let client = Client::connect(config).await.unwrap();
    assert_eq!(client.ping().await.unwrap(), "PONG");

    // The transient drop must not linger in the health signal once the
    // connection is back.
    let health = client.health();
    assert_eq!(health.state, ConnectionState::Ready);
    assert_eq!(health.last_error, None);
    server_task.abort();
}

#[tokio::test]
async fn close_waits_for_in_flight_replies() {
    let server = MockServer::bind().await;
    let config = server.config();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        assert_eq!(conn.read_command().await, command(&[b"PING"]));
        sleep(Duration::from_millis(100)).await;
        conn.send(b"+PONG\r\n").await;
    });

    let client = Client::connect(config).await.unwrap();

    let in_flight = tokio::spawn({
        let client = client.clone();
        async move { client.ping().await }
    });
    sleep(Duration::from_millis(20)).await;

    client.close().await;

    assert_eq!(in_flight.await.unwrap().unwrap(), "PONG");
    server_task.await.unwrap();
}
