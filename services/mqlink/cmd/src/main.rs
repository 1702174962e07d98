//! mqlink command line client.
//!
//! Publishes a single message or subscribes and prints what arrives, using
//! the mqlink session engine for connection management.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Args as ClapArgs, Parser, Subcommand};
use mqlink_session::{Client, ClientError, ConnectionState, Message, MessageHandler, Token};
use mqlink_wire::QoS;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::CliConfig;
use logging::MqlinkLogFormatter;

/// Publish/subscribe command line client
#[derive(Parser, Debug)]
#[command(name = "mqlink", version, about = "MQTT 3.1.1 command line client")]
struct Args {
    /// Broker address, e.g. tcp://127.0.0.1:1883
    #[arg(long, global = true)]
    broker: Option<String>,

    /// Client identifier
    #[arg(long, global = true)]
    client_id: Option<String>,

    /// User name
    #[arg(long, global = true)]
    username: Option<String>,

    /// Password
    #[arg(long, global = true, requires = "username")]
    password: Option<String>,

    /// Keep alive interval, e.g. 30s
    #[arg(long, global = true)]
    keep_alive: Option<humantime::Duration>,

    /// Time to wait for each acknowledgement, e.g. 10s
    #[arg(long, global = true, default_value = "10s")]
    timeout: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, global = true, default_value = "mqlink.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish one message
    Pub(PubArgs),
    /// Subscribe and print incoming messages
    Sub(SubArgs),
}

#[derive(ClapArgs, Debug)]
struct PubArgs {
    /// Topic to publish to
    #[arg(long)]
    topic: String,

    /// Quality of service (0, 1 or 2)
    #[arg(long, default_value_t = 0)]
    qos: u8,

    /// Ask the broker to retain the message
    #[arg(long)]
    retain: bool,

    /// Message payload
    #[arg(long)]
    message: String,
}

#[derive(ClapArgs, Debug)]
struct SubArgs {
    /// Topic filter (repeatable)
    #[arg(long, required = true)]
    topic: Vec<String>,

    /// Requested quality of service (0, 1 or 2)
    #[arg(long, default_value_t = 0)]
    qos: u8,

    /// Print messages as JSON lines
    #[arg(long)]
    json: bool,

    /// Exit after this many messages
    #[arg(long)]
    count: Option<usize>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("mqlink={}", args.log_level).parse()?)
        .add_directive(format!("mqlink_session={}", args.log_level).parse()?)
        .add_directive(format!("mqlink_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(MqlinkLogFormatter::new("mqlink"))
        .init();

    debug!("Starting mqlink v{}", env!("CARGO_PKG_VERSION"));

    let mut config = CliConfig::load_from_file(&args.config)?;
    apply_cli_overrides(&mut config, &args);
    let timeout: Duration = args.timeout.into();

    component_debug!(
        "config",
        "Using broker {} (client id {:?})",
        config.broker,
        config.client_id
    );

    let result = match args.command {
        Command::Pub(pub_args) => publish(&config, pub_args, timeout).await,
        Command::Sub(sub_args) => subscribe(&config, sub_args, timeout).await,
    };
    if let Err(err) = &result {
        component_error!("session", "{:#}", err);
    }
    result
}

fn apply_cli_overrides(config: &mut CliConfig, args: &Args) {
    if let Some(broker) = &args.broker {
        config.broker = broker.clone();
    }
    if let Some(client_id) = &args.client_id {
        config.client_id = client_id.clone();
    }
    if let Some(username) = &args.username {
        config.username = Some(username.clone());
        config.password = args.password.clone();
    }
    if let Some(keep_alive) = args.keep_alive {
        config.keep_alive = keep_alive.into();
    }
}

/// Wait for `token` and turn its failure into an error
async fn settle(token: &Token, timeout: Duration) -> Result<()> {
    if !token.wait_timeout(timeout).await {
        bail!("{} timed out after {:?}", token.kind(), timeout);
    }
    match token.error() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

async fn connect(config: &CliConfig, client: &Client, timeout: Duration) -> Result<()> {
    let token = client.connect();
    settle(&token, timeout)
        .await
        .with_context(|| format!("could not connect to {}", config.broker))?;
    component_info!("session", "Connected to {}", config.broker);
    Ok(())
}

async fn publish(config: &CliConfig, args: PubArgs, timeout: Duration) -> Result<()> {
    let client = Client::new(config.client_options());
    connect(config, &client, timeout).await?;

    let token = client
        .publish(&args.topic, args.qos, args.retain, Bytes::from(args.message))
        .await;
    let published = settle(&token, timeout).await;
    if published.is_ok() {
        component_info!("pub", "Published to {} (qos {})", args.topic, args.qos);
    }

    client.disconnect(Duration::from_millis(250)).await;
    published
}

async fn subscribe(config: &CliConfig, args: SubArgs, timeout: Duration) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let handler: MessageHandler = Arc::new(move |message: Message| {
        let _ = tx.send(message);
    });

    let options = config
        .client_options()
        .with_on_connection_lost(Arc::new(|err: &ClientError| {
            component_warn!("session", "Connection lost: {}", err);
        }))
        .with_on_reconnecting(Arc::new(|attempt: u32| {
            component_info!("session", "Reconnecting (attempt {})", attempt);
        }));
    let client = Client::new(options);
    connect(config, &client, timeout).await?;

    let filters: Vec<(String, u8)> = args
        .topic
        .iter()
        .map(|topic| (topic.clone(), args.qos))
        .collect();
    let token = client.subscribe_multiple(filters, Some(handler)).await;
    settle(&token, timeout).await?;
    component_info!("sub", "Subscribed to {}", args.topic.join(", "));

    let mut received = 0usize;
    let mut status = client.watch_status();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                break;
            }

            Some(message) = rx.recv() => {
                component_debug!(
                    "sub",
                    "Message on {} ({} bytes)",
                    message.topic,
                    message.payload.len()
                );
                println!("{}", format_message(&message, args.json)?);
                received += 1;
                if args.count.is_some_and(|count| received >= count) {
                    break;
                }
            }

            changed = status.changed() => {
                if changed.is_err() || *status.borrow() == ConnectionState::Disconnected {
                    bail!("connection to {} closed", config.broker);
                }
            }
        }
    }

    client.disconnect(Duration::from_millis(250)).await;
    Ok(())
}

/// One `--json` output line
#[derive(Serialize)]
struct JsonMessage<'a> {
    topic: &'a str,
    qos: QoS,
    retain: bool,
    payload: &'a str,
}

fn format_message(message: &Message, json: bool) -> Result<String> {
    let payload = String::from_utf8_lossy(&message.payload);
    if json {
        let line = JsonMessage {
            topic: &message.topic,
            qos: message.qos,
            retain: message.retain,
            payload: &payload,
        };
        Ok(serde_json::to_string(&line)?)
    } else if message.qos == QoS::AtMostOnce {
        Ok(format!("{} {}", message.topic, payload))
    } else {
        Ok(format!("{} [qos {}] {}", message.topic, message.qos, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sub_args() {
        let args = Args::try_parse_from([
            "mqlink", "sub", "--topic", "a/#", "--topic", "b/+", "--qos", "1", "--count", "3",
            "--json",
        ])
        .unwrap();
        match args.command {
            Command::Sub(sub) => {
                assert_eq!(sub.topic, vec!["a/#", "b/+"]);
                assert_eq!(sub.qos, 1);
                assert_eq!(sub.count, Some(3));
                assert!(sub.json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::try_parse_from([
            "mqlink",
            "--broker",
            "tcp://other:1883",
            "--keep-alive",
            "5s",
            "pub",
            "--topic",
            "t",
            "--message",
            "hi",
        ])
        .unwrap();

        let mut config = CliConfig::default();
        apply_cli_overrides(&mut config, &args);
        assert_eq!(config.broker, "tcp://other:1883");
        assert_eq!(config.keep_alive, Duration::from_secs(5));
        assert_eq!(config.client_id, "");
    }

    fn message(qos: QoS) -> Message {
        Message {
            topic: "sensors/7".to_string(),
            qos,
            retain: true,
            dup: false,
            packet_id: None,
            payload: Bytes::from_static(b"21.5"),
        }
    }

    #[test]
    fn test_format_message() {
        assert_eq!(
            format_message(&message(QoS::AtLeastOnce), true).unwrap(),
            r#"{"topic":"sensors/7","qos":1,"retain":true,"payload":"21.5"}"#
        );
        assert_eq!(
            format_message(&message(QoS::AtMostOnce), false).unwrap(),
            "sensors/7 21.5"
        );
        assert_eq!(
            format_message(&message(QoS::ExactlyOnce), false).unwrap(),
            "sensors/7 [qos 2] 21.5"
        );
    }

    #[test]
    fn test_sub_requires_topic() {
        assert!(Args::try_parse_from(["mqlink", "sub"]).is_err());
    }
}
