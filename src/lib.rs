pub mod client;
pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod request;
pub mod subscriber;

pub use client::Client;
pub use config::{Auth, Backoff, Config};
pub use connection::{ConnectionState, Health};
pub use error::ClientError;
pub use frame::Frame;
pub use subscriber::{Subscriber, SubscriptionHandler, SubscriptionSet};

pub type Result<T> = std::result::Result<T, ClientError>;
