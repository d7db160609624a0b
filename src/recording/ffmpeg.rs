//! Recorder backed by an `ffmpeg` child process.
//!
//! Each track's RTP packets are forwarded over loopback UDP to ffmpeg, which
//! learns the streams from a generated SDP file and pushes the muxed result
//! to the destination. Adding a track to a running recorder restarts ffmpeg
//! with the new stream set.

use async_trait::async_trait;
use std::io::Write;
use std::net::UdpSocket as StdUdpSocket;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UdpSocket;
use tokio::process::{Child, Command};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::error::RecorderError;
use crate::peer::types::{MediaTrack, TrackKind};
use crate::recording::recorder::{Recorder, RecorderFactory, RecorderOptions};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const PORT_ATTEMPTS: usize = 32;

pub struct FfmpegRecorderFactory;

impl RecorderFactory for FfmpegRecorderFactory {
    fn create(
        &self,
        target: &str,
        format: &str,
        options: &RecorderOptions,
    ) -> Result<Box<dyn Recorder>, RecorderError> {
        Ok(Box::new(FfmpegRecorder::new(target, format, options.clone())))
    }
}

/// A track bound to the loopback port ffmpeg reads it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPort {
    pub kind: TrackKind,
    pub port: u16,
    pub payload_type: u8,
    pub rtpmap: String,
    pub fmtp: Option<String>,
}

impl StreamPort {
    fn new(track: &MediaTrack, port: u16) -> Self {
        let codec = track.codec();
        let mut rtpmap = format!("{}/{}", codec.encoding_name(), codec.clock_rate);
        if codec.channels > 1 {
            rtpmap.push_str(&format!("/{}", codec.channels));
        }
        Self {
            kind: track.kind(),
            port,
            payload_type: codec.payload_type,
            rtpmap,
            fmtp: Some(codec.fmtp.clone()).filter(|f| !f.is_empty()),
        }
    }
}

/// Session description ffmpeg uses to receive the forwarded streams.
pub fn render_sdp(streams: &[StreamPort]) -> String {
    let mut sdp = String::from(
        "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=rtc-relay\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\n",
    );
    for stream in streams {
        sdp.push_str(&format!(
            "m={} {} RTP/AVP {}\r\na=rtpmap:{} {}\r\n",
            stream.kind, stream.port, stream.payload_type, stream.payload_type, stream.rtpmap
        ));
        if let Some(fmtp) = &stream.fmtp {
            sdp.push_str(&format!("a=fmtp:{} {fmtp}\r\n", stream.payload_type));
        }
    }
    sdp
}

struct Running {
    child: Child,
    forwarders: Vec<JoinHandle<()>>,
    // removed from disk on drop
    _sdp: NamedTempFile,
}

pub struct FfmpegRecorder {
    target: String,
    format: String,
    options: RecorderOptions,
    tracks: Vec<MediaTrack>,
    running: Option<Running>,
}

impl FfmpegRecorder {
    pub fn new(target: &str, format: &str, options: RecorderOptions) -> Self {
        Self {
            target: target.to_string(),
            format: format.to_string(),
            options,
            tracks: Vec::new(),
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn args(&self, sdp_path: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-protocol_whitelist".into(),
            "file,udp,rtp".into(),
            "-i".into(),
            sdp_path.to_string_lossy().into_owned(),
        ];

        if self.tracks.iter().any(|t| t.kind() == TrackKind::Video) {
            args.extend([
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "veryfast".into(),
                "-tune".into(),
                "zerolatency".into(),
                "-b:v".into(),
                format!("{}k", self.options.video_bitrate_kbps),
            ]);
        }
        if self.tracks.iter().any(|t| t.kind() == TrackKind::Audio) {
            args.extend([
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                format!("{}k", self.options.audio_bitrate_kbps),
                "-ar".into(),
                "44100".into(),
            ]);
        }

        args.extend(["-f".into(), self.format.clone(), self.target.clone()]);
        args
    }

    async fn launch(&self) -> Result<Running, RecorderError> {
        if self.tracks.is_empty() {
            return Err(RecorderError::NoTracks);
        }

        let mut streams = Vec::with_capacity(self.tracks.len());
        for track in &self.tracks {
            streams.push(StreamPort::new(track, reserve_rtp_port()?));
        }

        let mut sdp = tempfile::Builder::new()
            .prefix("rtc-relay-")
            .suffix(".sdp")
            .tempfile()?;
        sdp.write_all(render_sdp(&streams).as_bytes())?;
        sdp.flush()?;

        let args = self.args(sdp.path());
        log::debug!("{} {}", self.options.ffmpeg_path.display(), args.join(" "));

        let mut child = Command::new(&self.options.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RecorderError::Spawn)?;

        if let Some(stderr) = child.stderr.take() {
            let target = self.target.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("ffmpeg[{target}]: {line}");
                }
            });
        }

        let mut forwarders = Vec::with_capacity(streams.len());
        for (track, stream) in self.tracks.iter().zip(&streams) {
            forwarders.push(spawn_forwarder(track, stream.port).await?);
        }

        let mut running = Running {
            child,
            forwarders,
            _sdp: sdp,
        };

        sleep(self.options.startup_grace).await;
        if let Some(status) = running.child.try_wait()? {
            abort_forwarders(&mut running);
            return Err(RecorderError::Exited(status.to_string()));
        }
        Ok(running)
    }
}

#[async_trait]
impl Recorder for FfmpegRecorder {
    fn target(&self) -> &str {
        &self.target
    }

    async fn add_track(&mut self, track: &MediaTrack) -> Result<(), RecorderError> {
        if self.tracks.iter().any(|t| t.id() == track.id()) {
            return Ok(());
        }
        self.tracks.push(track.clone());

        if self.running.is_some() {
            log::info!(
                "restarting encoder for {} to pick up {} track {}",
                self.target,
                track.kind(),
                track.id()
            );
            self.stop().await?;
            self.start().await?;
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<(), RecorderError> {
        if self.running.is_some() {
            return Ok(());
        }
        let running = self.launch().await?;
        log::info!(
            "encoder pushing {} track(s) to {}",
            self.tracks.len(),
            self.target
        );
        self.running = Some(running);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), RecorderError> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        abort_forwarders(&mut running);

        // ask ffmpeg to finish the stream cleanly
        if let Some(mut stdin) = running.child.stdin.take() {
            let _ = stdin.write_all(b"q\n").await;
        }
        match timeout(STOP_TIMEOUT, running.child.wait()).await {
            Ok(Ok(status)) => log::info!("encoder for {} exited ({status})", self.target),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                log::warn!("encoder for {} did not exit, killing it", self.target);
                running.child.kill().await?;
            }
        }
        Ok(())
    }
}

fn abort_forwarders(running: &mut Running) {
    for task in running.forwarders.drain(..) {
        task.abort();
    }
}

/// An even loopback port with its RTCP neighbour free.
fn reserve_rtp_port() -> Result<u16, RecorderError> {
    for _ in 0..PORT_ATTEMPTS {
        let socket = StdUdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();
        if port % 2 != 0 || port == u16::MAX {
            continue;
        }
        if StdUdpSocket::bind(("127.0.0.1", port + 1)).is_ok() {
            return Ok(port);
        }
    }
    Err(RecorderError::Other("no free loopback port pair".into()))
}

async fn spawn_forwarder(track: &MediaTrack, port: u16) -> Result<JoinHandle<()>, RecorderError> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(("127.0.0.1", port)).await?;
    let mut packets = track.subscribe();
    let track_id = track.id().to_string();

    Ok(tokio::spawn(async move {
        loop {
            match packets.recv().await {
                Ok(packet) => {
                    if let Err(e) = socket.send(&packet).await {
                        log::trace!("forward to port {port} failed: {e}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("track {track_id}: encoder lagging, skipped {skipped} packets");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::TrackCodec;

    fn video() -> MediaTrack {
        MediaTrack::new(
            "v0",
            TrackKind::Video,
            TrackCodec {
                mime_type: "video/VP8".into(),
                clock_rate: 90000,
                channels: 0,
                payload_type: 96,
                fmtp: String::new(),
            },
        )
    }

    fn audio() -> MediaTrack {
        MediaTrack::new(
            "a0",
            TrackKind::Audio,
            TrackCodec {
                mime_type: "audio/opus".into(),
                clock_rate: 48000,
                channels: 2,
                payload_type: 111,
                fmtp: "minptime=10;useinbandfec=1".into(),
            },
        )
    }

    #[test]
    fn sdp_describes_each_forwarded_stream() {
        let streams = vec![
            StreamPort::new(&video(), 40000),
            StreamPort::new(&audio(), 40002),
        ];
        let sdp = render_sdp(&streams);

        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("c=IN IP4 127.0.0.1\r\n"));
        assert!(sdp.contains("m=video 40000 RTP/AVP 96\r\na=rtpmap:96 VP8/90000\r\n"));
        assert!(sdp.contains("m=audio 40002 RTP/AVP 111\r\na=rtpmap:111 opus/48000/2\r\n"));
        assert!(sdp.contains("a=fmtp:111 minptime=10;useinbandfec=1\r\n"));
        assert!(!sdp.contains("a=fmtp:96"));
    }

    #[tokio::test]
    async fn args_follow_options_and_track_kinds() {
        let options = RecorderOptions {
            video_bitrate_kbps: 1800,
            ..Default::default()
        };
        let mut recorder = FfmpegRecorder::new("rtmp://localhost/live/a", "flv", options);
        recorder.add_track(&video()).await.unwrap();

        let args = recorder.args(Path::new("/tmp/in.sdp"));
        let joined = args.join(" ");
        assert!(joined.contains("-protocol_whitelist file,udp,rtp -i /tmp/in.sdp"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-b:v 1800k"));
        assert!(!joined.contains("-c:a"));
        assert!(joined.ends_with("-f flv rtmp://localhost/live/a"));

        recorder.add_track(&audio()).await.unwrap();
        recorder.add_track(&audio()).await.unwrap();
        assert_eq!(recorder.tracks.len(), 2);
        assert!(recorder.args(Path::new("x.sdp")).join(" ").contains("-c:a aac -b:a 128k"));
    }

    #[tokio::test]
    async fn start_without_tracks_fails() {
        let mut recorder =
            FfmpegRecorder::new("rtmp://localhost/live/a", "flv", RecorderOptions::default());
        assert!(matches!(recorder.start().await, Err(RecorderError::NoTracks)));
        assert!(!recorder.is_running());
        recorder.stop().await.unwrap();
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let options = RecorderOptions {
            ffmpeg_path: "/nonexistent/bin/ffmpeg".into(),
            ..Default::default()
        };
        let mut recorder = FfmpegRecorder::new("rtmp://localhost/live/a", "flv", options);
        recorder.add_track(&video()).await.unwrap();
        assert!(matches!(recorder.start().await, Err(RecorderError::Spawn(_))));
        assert!(!recorder.is_running());
    }

    #[test]
    fn reserved_ports_are_even() {
        let port = reserve_rtp_port().unwrap();
        assert_eq!(port % 2, 0);
    }
}
