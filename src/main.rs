use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use playbridge::client::{PlayerClient, PlayerMonitor, PlayerSnapshot, RpcClient};
use playbridge::config::Settings;
use playbridge::protocol::{Method, PlayQueueIndexMsg, VolumeMsg};
use playbridge::relay::{FramedRelay, Relay};
use playbridge::server::{Dispatcher, UnknownMethodPolicy};
use playbridge::service::{SimulatedPlayer, register_player_service};
use playbridge::transport::{
    Framing, Reconnect, StdioStream, TcpDialer, UnixAcceptor, UnixDialer,
};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

/// Connection attempts for one-shot commands when the config sets no limit
const ONE_SHOT_ATTEMPTS: u32 = 3;

#[derive(Parser, Debug)]
#[command(name = "playbridge")]
#[command(about = "Relay and RPC bridge for remote playback control")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/playbridge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Relay bytes between stdio and a socket peer
    Relay {
        /// Unix socket to listen on
        #[arg(long)]
        socket_path: Option<String>,

        /// Connect to this TCP address instead of listening
        #[arg(long, conflicts_with = "socket_path")]
        tcp: Option<String>,
    },

    /// Relay whole length-prefixed frames between stdio and a socket peer
    FrameRelay {
        /// Unix socket to listen on
        #[arg(long)]
        socket_path: Option<String>,
    },

    /// Serve the playback service backed by a simulated player
    Serve {
        /// Unix socket to listen on
        #[arg(long)]
        socket_path: Option<String>,

        /// Speak framed envelopes over stdin/stdout instead of a socket
        #[arg(long, conflicts_with = "socket_path")]
        stdio: bool,

        /// Reply with an error to calls for unknown methods
        #[arg(long)]
        reject_unknown: bool,
    },

    /// Issue one call and print the response
    Call {
        #[arg(value_enum)]
        method: CallMethod,

        /// Volume for set-volume
        #[arg(long)]
        volume: Option<u32>,

        /// Queue index for play-queue-index
        #[arg(long)]
        index: Option<u32>,

        /// Service socket path
        #[arg(long)]
        socket_path: Option<String>,
    },

    /// Subscribe to a stream and print each item
    Watch {
        #[arg(value_enum)]
        stream: WatchStream,

        /// Stop after this many items
        #[arg(long)]
        count: Option<usize>,

        /// Service socket path
        #[arg(long)]
        socket_path: Option<String>,
    },

    /// Follow player state, volume and track until interrupted
    Monitor {
        /// Service socket path
        #[arg(long)]
        socket_path: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum CallMethod {
    Play,
    Pause,
    Next,
    Previous,
    PlayQueueIndex,
    SetVolume,
    GetVolume,
    NowPlaying,
    PlayerState,
    QueueState,
}

impl CallMethod {
    fn method(self) -> Method {
        match self {
            CallMethod::Play => Method::DoPlay,
            CallMethod::Pause => Method::DoPause,
            CallMethod::Next => Method::DoNext,
            CallMethod::Previous => Method::DoPrevious,
            CallMethod::PlayQueueIndex => Method::DoPlayQueueIndex,
            CallMethod::SetVolume => Method::SetVolume,
            CallMethod::GetVolume => Method::GetVolume,
            CallMethod::NowPlaying => Method::GetNowPlaying,
            CallMethod::PlayerState => Method::GetPlayerState,
            CallMethod::QueueState => Method::GetQueueState,
        }
    }

    fn message(self, volume: Option<u32>, index: Option<u32>) -> Result<Value> {
        Ok(match self {
            CallMethod::SetVolume => {
                let volume = volume.context("set-volume needs --volume")?;
                serde_json::to_value(VolumeMsg { volume })?
            }
            CallMethod::PlayQueueIndex => {
                let index = index.context("play-queue-index needs --index")?;
                serde_json::to_value(PlayQueueIndexMsg { index })?
            }
            _ => json!({}),
        })
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum WatchStream {
    PlayerState,
    Volume,
    NowPlaying,
    QueueState,
}

impl WatchStream {
    fn method(self) -> Method {
        match self {
            WatchStream::PlayerState => Method::PlayerState,
            WatchStream::Volume => Method::Volume,
            WatchStream::NowPlaying => Method::NowPlaying,
            WatchStream::QueueState => Method::QueueState,
        }
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load_from(path),
        None => Ok(Settings::load()),
    }
}

fn with_socket_path(mut settings: Settings, socket_path: Option<String>) -> Settings {
    if let Some(path) = socket_path {
        settings.socket_path = path;
    }
    settings
}

/// Retry policy for commands that should fail fast when nothing is listening
fn one_shot_retry(settings: &Settings) -> Reconnect {
    let mut settings = settings.clone();
    settings.max_connect_attempts = settings.max_connect_attempts.or(Some(ONE_SHOT_ATTEMPTS));
    settings.reconnect()
}

/// Start a client connected to the service socket
fn connect_client(settings: &Settings) -> (PlayerClient, JoinHandle<Result<()>>) {
    let (rpc, connection) = RpcClient::new(settings.service_prefix.clone());
    let connector = Framing::new(UnixDialer::new(settings.socket_path()), settings.frame_codec());
    let retry = one_shot_retry(settings);

    let driver = tokio::spawn(async move {
        connection
            .run(connector, retry)
            .await
            .map_err(anyhow::Error::from)
    });
    (PlayerClient::new(rpc), driver)
}

async fn finish(player: &PlayerClient, driver: JoinHandle<Result<()>>) -> Result<()> {
    player.rpc().shutdown();
    driver.await.context("Client connection task failed")?
}

async fn run_relay(settings: Settings, tcp: Option<String>) -> Result<()> {
    let retry = settings.reconnect();
    let exit = match tcp.or(settings.tcp_address.clone()) {
        Some(addr) => {
            log::info!("Relaying stdio to tcp://{}", addr);
            Relay::new(TcpDialer::new(addr), tokio::io::stdin(), tokio::io::stdout())
                .with_reconnect(retry)
                .run()
                .await?
        }
        None => {
            let path = settings.socket_path();
            log::info!("Relaying stdio to peers on {}", path.display());
            let acceptor = UnixAcceptor::bind(&path)?;
            Relay::new(acceptor, tokio::io::stdin(), tokio::io::stdout())
                .with_reconnect(retry)
                .run()
                .await?
        }
    };
    log::info!("Relay finished after {} sessions", exit.sessions);
    Ok(())
}

async fn run_frame_relay(settings: Settings) -> Result<()> {
    let path = settings.socket_path();
    let codec = settings.frame_codec();
    log::info!("Relaying frames between stdio and peers on {}", path.display());

    let connector = Framing::new(UnixAcceptor::bind(&path)?, codec);
    let exit = FramedRelay::new(connector, tokio::io::stdin(), tokio::io::stdout(), codec)
        .with_reconnect(settings.reconnect())
        .run()
        .await?;
    log::info!("Frame relay finished after {} sessions", exit.sessions);
    Ok(())
}

async fn run_serve(settings: Settings, stdio: bool) -> Result<()> {
    let mut dispatcher =
        Dispatcher::new(settings.service_prefix.clone()).with_unknown_methods(settings.unknown_methods);
    register_player_service(&mut dispatcher, Arc::new(SimulatedPlayer::demo()));
    log::info!("Serving methods: {}", dispatcher.methods().join(", "));

    if stdio {
        let transport = Framed::new(StdioStream::stdio(), settings.frame_codec());
        let summary = dispatcher.serve_session(transport).await;
        log::info!(
            "Stdio session ended: {} calls, {} subscriptions, {} dropped",
            summary.calls,
            summary.subscriptions,
            summary.dropped
        );
        return Ok(());
    }

    let path = settings.socket_path();
    let connector = Framing::new(UnixAcceptor::bind(&path)?, settings.frame_codec());
    log::info!("Listening on {}", path.display());

    tokio::select! {
        result = dispatcher.serve(connector, settings.reconnect()) => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted, shutting down"),
    }
    Ok(())
}

async fn run_call(settings: Settings, method: CallMethod, message: Value) -> Result<()> {
    let (player, mut driver) = connect_client(&settings);

    let reply = tokio::select! {
        reply = player.call_raw(method.method(), &message) => reply?,
        result = &mut driver => {
            result??;
            bail!("Connection closed before a reply arrived");
        }
    };

    println!("{}", serde_json::to_string_pretty(&reply)?);
    finish(&player, driver).await
}

async fn run_watch(settings: Settings, stream: WatchStream, count: Option<usize>) -> Result<()> {
    let (player, mut driver) = connect_client(&settings);
    let mut items = player.watch_raw(stream.method(), &json!({}));
    let mut seen = 0;

    while count.is_none_or(|count| seen < count) {
        tokio::select! {
            item = items.next() => match item {
                Some(item) => {
                    println!("{}", serde_json::to_string(&item?)?);
                    seen += 1;
                }
                None => break,
            },
            result = &mut driver => {
                result??;
                bail!("Connection closed");
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(items);
    finish(&player, driver).await
}

fn describe(snapshot: &PlayerSnapshot) -> String {
    let state = snapshot.state.map(|s| s.as_str()).unwrap_or("?");
    let volume = snapshot
        .volume
        .map(|v| format!("{}%", v))
        .unwrap_or_else(|| "?".to_string());
    let track = snapshot
        .now_playing
        .as_ref()
        .filter(|n| !n.title.is_empty())
        .map(|n| format!("{} - {}", n.title, n.author))
        .unwrap_or_default();
    format!("[{}] vol {} {}", state, volume, track)
}

async fn run_monitor(settings: Settings) -> Result<()> {
    let (rpc, connection) = RpcClient::new(settings.service_prefix.clone());
    let connector = Framing::new(UnixDialer::new(settings.socket_path()), settings.frame_codec());
    let retry = settings.reconnect();
    let mut driver = tokio::spawn(async move { connection.run(connector, retry).await });

    let player = PlayerClient::new(rpc);
    let monitor = PlayerMonitor::start(&player);
    let mut changes = monitor.changes();
    let mut last = None;

    loop {
        tokio::select! {
            Some(snapshot) = changes.next() => {
                let line = describe(&snapshot);
                if last.as_ref() != Some(&line) {
                    println!("{}", line);
                    last = Some(line);
                }
            }
            result = &mut driver => {
                result??;
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    player.rpc().shutdown();
    driver.await??;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_ref())?;

    match cli.command {
        Commands::Relay { socket_path, tcp } => {
            run_relay(with_socket_path(settings, socket_path), tcp).await
        }
        Commands::FrameRelay { socket_path } => {
            run_frame_relay(with_socket_path(settings, socket_path)).await
        }
        Commands::Serve {
            socket_path,
            stdio,
            reject_unknown,
        } => {
            let mut settings = with_socket_path(settings, socket_path);
            if reject_unknown {
                settings.unknown_methods = UnknownMethodPolicy::Reject;
            }
            run_serve(settings, stdio).await
        }
        Commands::Call {
            method,
            volume,
            index,
            socket_path,
        } => {
            let message = method.message(volume, index)?;
            run_call(with_socket_path(settings, socket_path), method, message).await
        }
        Commands::Watch {
            stream,
            count,
            socket_path,
        } => run_watch(with_socket_path(settings, socket_path), stream, count).await,
        Commands::Monitor { socket_path } => {
            run_monitor(with_socket_path(settings, socket_path)).await
        }
    }
}
