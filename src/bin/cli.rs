use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::debug;

use rudis::{Auth, Client, ClientError, Config, Subscriber, SubscriptionHandler};

const PORT: u16 = 6379;

#[derive(Parser, Debug)]
struct Args {
    /// The server host to connect to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// The server port to connect to
    #[arg(short, long, default_value_t = PORT)]
    port: u16,
    /// Password for the AUTH handshake
    #[arg(long)]
    password: Option<String>,
    /// Logical database to SELECT after connecting
    #[arg(long)]
    database: Option<u32>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Check the connection
    Ping,
    /// Fetch the value of a key
    Get { key: String },
    /// Store a value under a key
    Set { key: String, value: String },
    /// Delete one or more keys
    Del { keys: Vec<String> },
    /// Listen for messages on the given channels until interrupted
    Subscribe { channels: Vec<String> },
}

struct PrintMessages;

impl SubscriptionHandler for PrintMessages {
    fn on_message(&mut self, channel: &str, payload: &Bytes) {
        println!("[{channel}] {}", String::from_utf8_lossy(payload));
    }

    fn on_pmessage(&mut self, pattern: &str, channel: &str, payload: &Bytes) {
        println!("[{pattern}:{channel}] {}", String::from_utf8_lossy(payload));
    }

    fn on_subscribe(&mut self, channel: &str, count: i64) {
        println!("subscribed to {channel} ({count} total)");
    }

    fn on_error(&mut self, error: &ClientError) {
        eprintln!("connection error: {error}");
    }
}

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    let _ = tracing_subscriber::fmt()
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let args = Args::parse();

    let mut config = Config::new(args.host, args.port);
    config.auth = args.password.map(|password| Auth {
        username: None,
        password,
    });
    config.database = args.database;

    match args.command {
        Cmd::Ping => {
            let client = Client::connect(config).await?;
            println!("{}", client.ping().await?);
        }
        Cmd::Get { key } => {
            let client = Client::connect(config).await?;
            match client.get(key).await? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(nil)"),
            }
        }
        Cmd::Set { key, value } => {
            let client = Client::connect(config).await?;
            client.set(key, Bytes::from(value)).await?;
            println!("OK");
        }
        Cmd::Del { keys } => {
            let client = Client::connect(config).await?;
            println!("{}", client.del(keys).await?);
        }
        Cmd::Subscribe { channels } => {
            let subscriber = Subscriber::connect(config, PrintMessages).await?;
            subscriber.subscribe(channels).await?;
            tokio::signal::ctrl_c().await?;
            subscriber.quit().await?;
        }
    }

    Ok(())
}
