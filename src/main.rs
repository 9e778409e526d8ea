use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use duet::{
    CallStatus, Config, HttpSignaling, MediaStream, RelayServer, Session, SessionEvent, SessionField,
    SessionOptions, SignalStore, TrackKind, WebRtcConfig, WebRtcHostFactory,
};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "duet")]
#[command(about = "Two-party rooms over a long-poll signaling relay", long_about = None)]
struct Cli {
    /// Relay storage directory (overrides the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        #[arg(long)]
        addr: Option<String>,
    },
    /// Join a room and chat with whoever else joins it
    Join {
        /// Display identity, random if omitted
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        room: String,
        /// Relay URL (overrides the config file)
        #[arg(long)]
        relay: Option<String>,
        /// Send a silent microphone track
        #[arg(long)]
        audio: bool,
    },
    /// Delete expired signals now
    Sweep,
    /// Show pending signal statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("duet=info".parse().context("Invalid log directive")?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Relay { addr } => {
            let addr = addr.unwrap_or_else(|| config.server.bind_address.clone());
            let store = Arc::new(open_store(&config, cli.data_dir)?);

            println!("Starting duet relay on {}", addr);
            println!("Signal TTL: {}s", store.ttl().as_secs());
            println!("Long-poll window: {}s", config.server.poll_timeout_secs);

            RelayServer::new(store, addr)
                .with_poll_timeout(config.server.poll_timeout())
                .run()
                .await?;
        }
        Commands::Join {
            name,
            room,
            relay,
            audio,
        } => {
            let name = name.unwrap_or_else(|| format!("guest-{:04}", rand::thread_rng().gen_range(0..10_000)));
            let relay = relay.unwrap_or_else(|| config.client.relay_url.clone());
            join(&config, &name, &room, &relay, audio).await?;
        }
        Commands::Sweep => {
            let store = open_store(&config, cli.data_dir)?;
            let removed = store.sweep()?;
            println!("Removed {} expired signals", removed);
        }
        Commands::Stats => {
            let store = open_store(&config, cli.data_dir)?;
            let stats = store.stats()?;
            println!("Pending signals: {}", stats.pending);
            match stats.oldest_created_at {
                Some(created_at) => {
                    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
                    println!("Oldest: {}s ago", now.saturating_sub(created_at));
                }
                None => println!("Oldest: -"),
            }
            println!("TTL: {}s", store.ttl().as_secs());
        }
    }

    Ok(())
}

fn open_store(config: &Config, data_dir: Option<PathBuf>) -> Result<SignalStore> {
    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(&config.storage.data_dir));
    SignalStore::open_with(&data_dir, config.store_options())
        .with_context(|| format!("Failed to open relay store at {}", data_dir.display()))
}

async fn join(config: &Config, name: &str, room: &str, relay: &str, audio: bool) -> Result<()> {
    let signaling = HttpSignaling::new(relay, config.server.poll_timeout());
    let hosts = WebRtcHostFactory::new(WebRtcConfig {
        stun_servers: config.client.stun_servers.clone(),
        silence: audio,
        ..Default::default()
    });

    let session = Session::join(name, room, &signaling, &hosts, SessionOptions::from(&config.client)).await?;
    println!("Joined {} as {} via {}", room, name, relay);
    println!("Type a line to chat, /quit to leave");

    let _subscriptions = [
        session.subscribe(SessionField::CallStatus, |event| {
            if let SessionEvent::CallStatus(status) = event {
                println!("* call {}", status);
            }
        }),
        session.subscribe(SessionField::RemoteIdentity, |event| {
            if let SessionEvent::RemoteIdentity(name) = event {
                println!("* talking to {}", name);
            }
        }),
        session.subscribe(SessionField::RemoteTracks, |event| {
            if let SessionEvent::RemoteTracks(tracks) = event {
                println!("* receiving {} track(s)", tracks.len());
            }
        }),
        session.subscribe(SessionField::Chat, |event| {
            if let SessionEvent::Chat { from, text } = event {
                println!("<{}> {}", from, text);
            }
        }),
        session.subscribe(SessionField::Error, |event| {
            if let SessionEvent::Error(message) = event {
                eprintln!("! {}", message);
            }
        }),
    ];

    if audio {
        session.add_track(MediaStream::new(format!("{}-stream", name)).with_track(TrackKind::Audio, "mic"));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/quit" => break,
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if session.snapshot().status != CallStatus::Connected {
                        eprintln!("! not connected yet");
                        continue;
                    }
                    session.send_chat(line);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.leave().await;
    println!("Left {}", room);
    Ok(())
}
