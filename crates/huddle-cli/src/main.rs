use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::Notify;

use huddle_core::sim::{MemoryDevices, SimulatedTransport};
use huddle_core::{
    ConfigStore, ControllerConfig, DeviceKind, DeviceManager, DevicePlatform, HuddleEvent,
    HuddleEventListener, SessionConfig, SessionController, Transport,
};

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Parser, Debug)]
#[command(name = "huddle", version, about = "Join a conferencing session from the terminal")]
struct Cli {
    /// Directory holding huddle.json (defaults to the platform config dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List media devices
    Devices {
        /// Only list one kind: audio-input, audio-output or video-input
        #[arg(long)]
        kind: Option<DeviceKind>,
        /// Use the in-memory device table
        #[arg(long)]
        simulate: bool,
    },
    /// Join a meeting and stay until Ctrl-C
    Join(JoinArgs),
    /// Print the effective controller configuration
    Config,
}

#[derive(Args, Debug)]
struct JoinArgs {
    /// Meeting to join
    meeting: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    mic: Option<String>,
    #[arg(long)]
    speaker: Option<String>,
    #[arg(long)]
    camera: Option<String>,
    /// Publish video
    #[arg(long)]
    video: bool,
    /// Run against the simulated transport and devices
    #[arg(long)]
    simulate: bool,
    /// Server URL for the LiveKit transport
    #[arg(long, env = "HUDDLE_URL")]
    url: Option<String>,
    /// Access token for the LiveKit transport
    #[arg(long, env = "HUDDLE_TOKEN")]
    token: Option<String>,
}

impl JoinArgs {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            meeting: self.meeting.clone(),
            display_name: self.name.clone(),
            audio_input_id: self.mic.clone(),
            audio_output_id: self.speaker.clone(),
            video_input_id: self.camera.clone(),
            video_enabled: self.video,
        }
    }
}

/// Logs every event and wakes the main task once the session is over.
struct LogListener {
    done: Arc<Notify>,
}

impl HuddleEventListener for LogListener {
    fn on_event(&self, event: HuddleEvent) {
        match &event {
            HuddleEvent::StateChanged(state) => tracing::info!("state: {state:?}"),
            HuddleEvent::SessionStarted {
                session_id,
                local_attendee_id,
            } => tracing::info!("joined {session_id} as {local_attendee_id}"),
            HuddleEvent::SessionFailed(err) => {
                tracing::error!("session failed: {err} ({:?})", err.recommended_action);
                self.done.notify_one();
            }
            HuddleEvent::SessionReconnecting { attempt } => tracing::warn!("reconnecting, attempt {attempt}"),
            HuddleEvent::SessionReconnected => tracing::info!("reconnected"),
            HuddleEvent::SessionEnded(session) => {
                tracing::info!("session {} ended", session.id);
                self.done.notify_one();
            }
            HuddleEvent::RosterChanged(attendees) => {
                let names: Vec<&str> = attendees.iter().map(|a| a.display_name.as_str()).collect();
                tracing::info!("roster: {}", names.join(", "));
            }
            HuddleEvent::VideoTileBound { attendee_id, tile_id } => {
                tracing::info!("{tile_id} bound to {attendee_id}")
            }
            HuddleEvent::VideoTileReleased { attendee_id, tile_id } => {
                tracing::info!("{tile_id} released from {attendee_id}")
            }
            HuddleEvent::DeviceSetChanged { kind, devices } => {
                tracing::info!("{kind} devices changed: {} available", devices.len())
            }
            HuddleEvent::DeviceUnavailable(err) => tracing::warn!("device unavailable: {err}"),
        }
    }
}

fn config_store(data_dir: Option<PathBuf>) -> ConfigStore {
    let dir = data_dir
        .or_else(|| dirs::config_dir().map(|d| d.join("huddle")))
        .unwrap_or_else(|| PathBuf::from("."));
    ConfigStore::new(dir)
}

fn list_devices<P: DevicePlatform>(platform: P, kind: Option<DeviceKind>) -> CliResult {
    let manager = DeviceManager::new(platform);
    let kinds: Vec<DeviceKind> = match kind {
        Some(kind) => vec![kind],
        None => DeviceKind::ALL.to_vec(),
    };
    for kind in kinds {
        println!("{kind}:");
        for device in manager.list_devices(kind)? {
            println!("  {}  {}", device.id, device.label);
        }
    }
    Ok(())
}

fn devices(kind: Option<DeviceKind>, simulate: bool) -> CliResult {
    #[cfg(feature = "cpal")]
    {
        if !simulate {
            return list_devices(huddle_core::cpal_devices::CpalDevices::new(), kind);
        }
    }
    #[cfg(not(feature = "cpal"))]
    {
        if !simulate {
            tracing::info!("built without a device backend, listing simulated devices");
        }
    }
    list_devices(MemoryDevices::with_defaults(), kind)
}

async fn run_session<T: Transport, P: DevicePlatform>(
    transport: T,
    platform: P,
    config: ControllerConfig,
    session: SessionConfig,
) -> CliResult {
    let controller = SessionController::new(transport, platform, config)?;
    let done = Arc::new(Notify::new());
    controller.add_listener(Arc::new(LogListener { done: done.clone() }));

    controller.join(session).await?;
    for attendee in controller.roster_snapshot().await {
        println!("{}{}", attendee.display_name, if attendee.is_local { " (you)" } else { "" });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, leaving");
            controller.leave().await?;
        }
        _ = done.notified() => {}
    }
    Ok(())
}

async fn with_platform<T: Transport>(transport: T, args: &JoinArgs, config: ControllerConfig) -> CliResult {
    #[cfg(feature = "cpal")]
    {
        if !args.simulate {
            let platform = huddle_core::cpal_devices::CpalDevices::new();
            return run_session(transport, platform, config, args.session_config()).await;
        }
    }
    run_session(transport, MemoryDevices::with_defaults(), config, args.session_config()).await
}

async fn join(args: JoinArgs, config: ControllerConfig) -> CliResult {
    #[cfg(feature = "livekit")]
    {
        if !args.simulate {
            let (Some(url), Some(token)) = (args.url.clone(), args.token.clone()) else {
                return Err("--url and --token are required without --simulate".into());
            };
            let transport = huddle_core::livekit_transport::LiveKitTransport::new(url, token);
            return with_platform(transport, &args, config).await;
        }
    }
    #[cfg(not(feature = "livekit"))]
    {
        if !args.simulate || args.url.is_some() || args.token.is_some() {
            tracing::info!("built without a transport backend, joining the simulated transport");
        }
    }
    with_platform(SimulatedTransport::new(), &args, config).await
}

#[tokio::main]
async fn main() -> CliResult {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("huddle_core=info,huddle_cli=info")),
        )
        .init();

    let cli = Cli::parse();
    let store = config_store(cli.data_dir);

    match cli.command {
        Command::Devices { kind, simulate } => devices(kind, simulate),
        Command::Join(args) => join(args, store.get()).await,
        Command::Config => {
            println!("# {}", store.path().display());
            println!("{}", serde_json::to_string_pretty(&store.get())?);
            Ok(())
        }
    }
}
