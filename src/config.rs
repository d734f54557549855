use std::time::Duration;

use rand::Rng;

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_WRITE_BATCH_SIZE: usize = 8 * 1024;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 512;

/// Credentials applied with `AUTH` during the connection handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Auth {
    /// `None` authenticates against the default user.
    pub username: Option<String>,
    pub password: String,
}

/// Reconnect policy: exponential backoff with a cap and random jitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
    /// Consecutive failed attempts before pending requests are failed and the
    /// connection transitions to closed.
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(10),
            jitter: Duration::from_millis(50),
            max_attempts: 10,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let scaled = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.cap);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return scaled;
        }
        scaled + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Client construction options.
///
/// Only what is listed here is configurable; there is no file or environment
/// loading layer.
#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Applied during the handshake when present.
    pub auth: Option<Auth>,
    /// Sent as `CLIENT SETNAME` during the handshake.
    pub client_name: Option<String>,
    /// Sent as `SELECT` during the handshake.
    pub database: Option<u32>,
    /// Bound on each individual connect attempt.
    pub connect_timeout: Duration,
    /// Per-request deadline; `None` disables local timeouts.
    pub receive_timeout: Option<Duration>,
    /// Byte budget per writer flush.
    pub max_write_batch_size: usize,
    /// High-water mark on requests in flight; above it submissions fail fast
    /// with `BackpressureExceeded`.
    pub max_in_flight: usize,
    pub tcp_send_buffer: Option<u32>,
    pub tcp_recv_buffer: Option<u32>,
    /// `Some` enables auto-reconnect with pending-request replay.
    pub reconnect: Option<Backoff>,
}

impl Config {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            auth: None,
            client_name: None,
            database: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            receive_timeout: None,
            max_write_batch_size: DEFAULT_MAX_WRITE_BATCH_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            tcp_send_buffer: None,
            tcp_recv_buffer: None,
            reconnect: None,
        }
    }
}
