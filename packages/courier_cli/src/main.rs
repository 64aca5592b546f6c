use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use courier::config::{AuthFileConfig, TransportFileConfig};
use courier::{
    Category, EnqueueOptions, Envelope, Event, Handler, Priority, Transport, TransportConfig,
    WsConnector,
};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Reliable message transport over WebSocket")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file, layered under COURIER_* environment variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and send each stdin line as a chat message
    Connect(ConnectArgs),
    /// Print the resolved configuration as JSON
    Config,
}

#[derive(Parser)]
struct ConnectArgs {
    /// Server URL (overrides `url` from the config)
    #[arg(long)]
    url: Option<String>,

    /// Auth token; requires --user-id
    #[arg(long, requires = "user_id")]
    token: Option<String>,

    #[arg(long, requires = "token")]
    user_id: Option<String>,

    /// Conversation that chat lines are sent to
    #[arg(long, default_value = "default")]
    conversation: String,

    /// high, normal or low
    #[arg(long, default_value = "normal")]
    priority: Priority,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "courier=debug,info"
    } else {
        "courier=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let file = TransportFileConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&file)?);
            Ok(())
        }
        Commands::Connect(args) => connect_command(file, args).await,
    }
}

async fn connect_command(mut file: TransportFileConfig, args: ConnectArgs) -> Result<()> {
    if let Some(url) = args.url {
        file.url = url;
    }
    if let (Some(token), Some(user_id)) = (args.token, args.user_id) {
        let timeout_ms = file.auth.as_ref().and_then(|a| a.timeout_ms);
        file.auth = Some(AuthFileConfig {
            token,
            user_id,
            timeout_ms,
        });
    }
    let config = TransportConfig::from_file(&file).context("invalid configuration")?;
    info!(url = %config.url, "starting transport");

    let transport =
        Transport::spawn(config, WsConnector::new()).context("failed to start transport")?;
    let printer = Handler::new(print_event);
    for category in [Category::Message, Category::Error, Category::System] {
        transport.on(category, printer.clone());
    }
    transport.connect()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sequence: u64 = 0;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                match line {
                    "" => continue,
                    "/quit" => break,
                    "/stats" => {
                        let stats = transport.queue_stats().await?;
                        println!("{}", serde_json::to_string(&stats)?);
                        continue;
                    }
                    _ => {}
                }

                let envelope = if line.starts_with('{') {
                    match Envelope::decode(line) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(error = %e, "not a valid envelope");
                            continue;
                        }
                    }
                } else {
                    sequence += 1;
                    Envelope::chat(format!("cli-{sequence}"), args.conversation.as_str(), line)
                };

                let options = EnqueueOptions::new()
                    .priority(args.priority)
                    .on_delivery(|result| match result {
                        Ok(delivered) => debug!(id = %delivered.id, "delivered"),
                        Err(e) => warn!(error = %e, "delivery failed"),
                    });
                let id = transport.send_with(envelope, options)?;
                debug!(%id, "queued");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    transport.shutdown().await?;
    println!("{}", serde_json::to_string(&transport.metrics())?);
    Ok(())
}

fn print_event(event: &Event) {
    let line = serde_json::json!({
        "category": event.category.as_str(),
        "envelope": event.envelope,
    });
    println!("{line}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_args_parse() {
        let cli = Cli::try_parse_from([
            "courier",
            "connect",
            "--url",
            "ws://localhost:9000/ws",
            "--priority",
            "high",
        ])
        .unwrap();
        let Commands::Connect(args) = cli.command else {
            panic!("expected connect");
        };
        assert_eq!(args.url.as_deref(), Some("ws://localhost:9000/ws"));
        assert_eq!(args.priority, Priority::High);
        assert_eq!(args.conversation, "default");
    }

    #[test]
    fn token_requires_user_id() {
        assert!(Cli::try_parse_from(["courier", "connect", "--token", "t"]).is_err());
    }

    #[test]
    fn ack_flag_is_not_accepted() {
        assert!(Cli::try_parse_from(["courier", "connect", "--ack"]).is_err());
    }
}
