use std::net::Ipv4Addr;

use chim_core::{ChatMessage, DEFAULT_GROUP, DEFAULT_PORT, MULTICAST_TTL, default_identity};
use chim_net::{GroupMessenger, MessengerConfig};
use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chim-term", about = "Terminal participant for the Chim LAN group chat")]
struct TermArgs {
    /// Name shown to other participants; defaults to this machine's LAN address.
    #[arg(long)]
    identity: Option<String>,
    #[arg(long, default_value_t = DEFAULT_GROUP)]
    group: Ipv4Addr,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    #[arg(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    interface: Ipv4Addr,
    #[arg(long, default_value_t = MULTICAST_TTL)]
    ttl: u32,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = TermArgs::parse();
    let identity = args.identity.unwrap_or_else(default_identity);
    let config = MessengerConfig::new(identity)
        .with_group(args.group, args.port)
        .with_interface(args.interface)
        .with_ttl(args.ttl);

    let mut messenger = match GroupMessenger::join(config) {
        Ok(messenger) => messenger,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };

    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel::<ChatMessage>();
    if let Err(err) = messenger.spawn_listener(move |message| {
        let _ = incoming_tx.send(message);
    }) {
        error!("{err}");
        std::process::exit(1);
    }

    println!(
        "joined {} as {} (Ctrl-C or EOF to leave)",
        messenger.group_addr(),
        messenger.identity()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    if let Err(err) = messenger.send(text) {
                        warn!("{err}");
                        println!("! send failed: {err}");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("stdin read failed: {err}");
                    break;
                }
            },
            Some(message) = incoming_rx.recv() => {
                println!(
                    "[{}] {}: {}",
                    chrono::Local::now().format("%H:%M"),
                    message.sender,
                    message.text
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("leaving chat");
    messenger.close();
}
