use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rtc_relay::config::{default_ice_servers, RelayConfig, SignalingConfig};
use rtc_relay::peer::{ServerConfig, WebRtcEngineFactory};
use rtc_relay::recording::{FfmpegRecorderFactory, RecorderOptions};
use rtc_relay::{logger, Supervisor};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Answer offers delivered by the rendezvous server
    Relay,
    /// Answer a single offer pasted on stdin
    Manual,
}

/// Answers PeerJS WebRTC sessions and pushes the received media to RTMP.
#[derive(Parser, Clone, Debug)]
#[command(version)]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::Relay)]
    mode: Mode,

    /// Our address on the rendezvous server (random when omitted)
    #[arg(long)]
    peer_id: Option<String>,

    /// Destination registered at startup, e.g. rtmp://localhost/live/stream
    #[arg(long)]
    rtmp_url: Option<String>,

    /// Manual mode: read the offer from this file instead of stdin
    #[arg(long)]
    offer_file: Option<PathBuf>,

    #[arg(long, default_value = "0.peerjs.com")]
    host: String,

    #[arg(long, default_value_t = 443)]
    port: u16,

    #[arg(long, default_value = "/")]
    path: String,

    /// Use ws:// instead of wss://
    #[arg(long)]
    insecure: bool,

    /// ICE server, `stun:host:port` or `turn:user:pass@host:port` (repeatable)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// Video bitrate in kbit/s
    #[arg(long, default_value_t = 2500)]
    video_bitrate: u32,

    /// Audio bitrate in kbit/s
    #[arg(long, default_value_t = 128)]
    audio_bitrate: u32,

    /// Start recording as soon as the first track arrives
    #[arg(long)]
    autostart: bool,

    /// Manual mode: seconds before giving up on an idle session
    #[arg(long, default_value_t = 3600)]
    idle_timeout: u64,

    #[arg(long, default_value_t = 3)]
    reconnect_attempts: u32,

    /// Seconds between reconnect attempts
    #[arg(long, default_value_t = 2)]
    reconnect_delay: u64,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn config(&self) -> RelayConfig {
        let ice_servers = if self.ice_servers.is_empty() {
            default_ice_servers()
        } else {
            self.ice_servers.iter().map(|s| ServerConfig::parse(s)).collect()
        };

        RelayConfig {
            signaling: SignalingConfig {
                host: self.host.clone(),
                port: self.port,
                path: self.path.clone(),
                secure: !self.insecure,
                peer_id: self.peer_id.clone(),
                ..Default::default()
            },
            ice_servers,
            recorder: RecorderOptions {
                video_bitrate_kbps: self.video_bitrate,
                audio_bitrate_kbps: self.audio_bitrate,
                ffmpeg_path: self.ffmpeg.clone(),
                ..Default::default()
            },
            default_destination: self.rtmp_url.clone(),
            auto_start: self.autostart,
            idle_timeout: Duration::from_secs(self.idle_timeout),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: Duration::from_secs(self.reconnect_delay),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logger::init(cli.verbose);

    let config = cli.config();
    log::info!("mode: {:?}", cli.mode);

    let engines = Arc::new(WebRtcEngineFactory::new(config.ice_servers.clone()));
    let mut supervisor = Supervisor::new(config, engines, Arc::new(FfmpegRecorderFactory));

    let result = match cli.mode {
        Mode::Relay => supervisor.run_relay().await.context("relay stopped"),
        Mode::Manual => supervisor
            .run_manual(cli.offer_file.clone())
            .await
            .context("manual session stopped"),
    };
    if let Err(e) = &result {
        log::error!("{e:#}");
    }
    result
}
