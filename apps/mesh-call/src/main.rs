use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use peer_mesh::relay::WebSocketRelay;
use peer_mesh::telemetry::{self, LogConfig, LogLevel};
use peer_mesh::webrtc::{OPUS_FRAME, OPUS_SILENCE, OpusTrackSource, WebRtcConnector, write_opus_frame};
use peer_mesh::{MeshConfig, MeshNotification, MeshSession, MeshStatus};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mesh-call", about = "Join a full-mesh audio room")]
struct Cli {
    /// Relay base url (http(s):// or ws(s)://)
    #[arg(long, env = "MESH_RELAY_URL", default_value = "http://127.0.0.1:8080")]
    relay_url: String,

    #[arg(long, short = 'r')]
    room: String,

    /// Participant id; a random one is generated when omitted
    #[arg(long)]
    peer_id: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[arg(long, help = "Join muted")]
    muted: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let config = MeshConfig::from_env();
    let peer_id = cli
        .peer_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let (relay, relay_rx) =
        WebSocketRelay::connect(&cli.relay_url, &cli.room, &peer_id, config.heartbeat_interval)
            .await
            .with_context(|| format!("connecting to relay {}", cli.relay_url))?;
    let connector = Arc::new(WebRtcConnector::new(&config).context("building webrtc api")?);
    let source = Arc::new(OpusTrackSource::new(peer_id.clone()));

    let mut session = MeshSession::new(
        peer_id.clone(),
        config.retry,
        source.clone(),
        connector,
        relay,
        relay_rx,
    );
    let mut notifications = session.notifications();
    let (handle, task) = session.spawn();

    info!(peer_id = %peer_id, room = %cli.room, "joining room");
    handle.join().await.context("joining mesh")?;
    if cli.muted {
        handle.toggle_mute().await?;
    }

    let feeder_source = source.clone();
    let feeder = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(OPUS_FRAME);
        loop {
            ticker.tick().await;
            let Some(media) = feeder_source.current() else {
                continue;
            };
            if let Err(err) =
                write_opus_frame(&media, Bytes::from_static(&OPUS_SILENCE), OPUS_FRAME).await
            {
                warn!(error = %err, "failed to write audio frame");
            }
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; leaving room");
                break;
            }
            notification = notifications.recv() => match notification {
                Some(notification) => report(&notification),
                None => break,
            },
        }
    }

    feeder.abort();
    handle.leave().await?;
    let snapshot_status = handle.status();
    drop(handle);
    task.await.context("session task")?;
    info!(status = ?snapshot_status, "left room");
    Ok(())
}

fn report(notification: &MeshNotification) {
    match notification {
        MeshNotification::StatusChanged(MeshStatus::Failed) => {
            warn!("could not reach any participant");
        }
        MeshNotification::StatusChanged(status) => info!(status = ?status, "mesh status"),
        MeshNotification::PeerConnecting(peer_id) => info!(peer_id = %peer_id, "connecting"),
        MeshNotification::PeerConnected(peer_id) => info!(peer_id = %peer_id, "connected"),
        MeshNotification::PeerRetrying {
            peer_id,
            attempt,
            delay,
        } => info!(peer_id = %peer_id, attempt, delay_ms = delay.as_millis() as u64, "retrying"),
        MeshNotification::PeerAbandoned { .. } => {
            if let Some(err) = notification.as_error() {
                warn!(error = %err, "peer abandoned");
            }
        }
        MeshNotification::RemoteMedia(media) => {
            info!(peer_id = %media.peer_id, track = %media.track_id, "receiving audio")
        }
        MeshNotification::PeerLeft(peer_id) => info!(peer_id = %peer_id, "left"),
    }
}
