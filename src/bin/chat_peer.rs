use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use peer_link::{
    ChatMessage, Communicator, FeatureSet, Identity, Role, SessionConfig, SessionEvent,
    StatusKind, TrustStore,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(about = "Chat with one peer on the local network", author, version)]
struct Cli {
    /// Name shown next to your messages
    #[arg(long = "name", default_value = "me")]
    name: String,

    /// Local UDP port for discovery
    #[arg(long = "udp-port", default_value_t = 8000)]
    udp_port: u16,

    /// UDP port the discovery request is sent to
    #[arg(long = "rendezvous-port", default_value_t = 8000)]
    rendezvous_port: u16,

    /// TCP port for the chat connection
    #[arg(long = "tcp-port", default_value_t = 9000)]
    tcp_port: u16,

    /// Destination of the discovery request
    #[arg(long = "discovery-addr", default_value = "255.255.255.255")]
    discovery_addr: IpAddr,

    /// Do not request encryption
    #[arg(long = "no-encryption", default_value_t = false)]
    no_encryption: bool,

    /// Do not request certificate authentication
    #[arg(long = "no-certificate", default_value_t = false)]
    no_certificate: bool,

    /// Do not request checksums
    #[arg(long = "no-checksum", default_value_t = false)]
    no_checksum: bool,

    /// PEM certificate (a self-signed one is generated when omitted)
    #[arg(long = "cert", value_name = "FILE", requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key matching --cert
    #[arg(long = "key", value_name = "FILE", requires = "cert")]
    key: Option<PathBuf>,

    /// Passphrase of an encrypted PKCS#8 key
    #[arg(long = "passphrase", env = "PEER_LINK_KEY_PASSPHRASE")]
    passphrase: Option<String>,

    /// PEM file with trusted root certificates
    #[arg(long = "trust", value_name = "FILE")]
    trust: Option<PathBuf>,

    /// Refuse peers with self-signed certificates
    #[arg(long = "reject-self-signed", default_value_t = false)]
    reject_self_signed: bool,

    /// Reconnect attempts after the peer goes away (0 quits instead)
    #[arg(long = "reconnect-attempts", default_value_t = 3)]
    reconnect_attempts: u32,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Chat peer failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let features = FeatureSet::new(!cli.no_encryption, !cli.no_certificate, !cli.no_checksum);
    let config = SessionConfig::new(cli.udp_port, cli.rendezvous_port, cli.tcp_port)
        .with_features(features)
        .with_discovery_addr(cli.discovery_addr)
        .with_reject_self_signed(cli.reject_self_signed);

    let identity = match (&cli.cert, &cli.key) {
        (Some(cert), Some(key)) => Some(Identity::load_pem(cert, key, cli.passphrase.as_deref())?),
        _ if features.certificate => Some(Identity::generate_self_signed(&cli.name)?),
        _ => None,
    };
    let trust = match &cli.trust {
        Some(path) => TrustStore::load_pem(path)?,
        None => TrustStore::default(),
    };

    let (mut peer, mut events) = Communicator::new(config, identity, trust);
    peer.init().await?;
    let remote_name = match peer.role() {
        Role::Server => Role::Client.to_string(),
        Role::Client => Role::Server.to_string(),
        _ => "peer".to_string(),
    };
    if let Some(endpoints) = peer.endpoints() {
        println!("Connected {} <-> {}", endpoints[0], endpoints[1]);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match peer.send_message(&line).await {
                    Ok(()) => println!("{}", ChatMessage::new(&cli.name, line)),
                    Err(e) => eprintln!("Message not sent: {e}"),
                }
            }
            event = events.recv() => match event {
                Some(SessionEvent::MessageReceived(text)) => {
                    println!("{}", ChatMessage::new(&remote_name, text));
                }
                Some(SessionEvent::Status(status)) if status.kind != StatusKind::Progress => {
                    eprintln!("{status}");
                }
                Some(SessionEvent::Status(_)) => {}
                Some(SessionEvent::ConnectionLost) => {
                    if cli.reconnect_attempts == 0 || !peer.reconnect(cli.reconnect_attempts).await {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    peer.disconnect().await;
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with_writer(std::io::stderr)
            .try_init();
    });
}
