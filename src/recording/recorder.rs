//! Recorder seam: the worker that muxes tracks into one destination stream.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::RecorderError;
use crate::peer::types::MediaTrack;

/// Quality and launch settings shared by every recorder.
#[derive(Debug, Clone)]
pub struct RecorderOptions {
    /// Container handed to the recorder (`flv` for RTMP)
    pub format: String,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    /// Destination URL schemes a recorder may be started for
    pub allowed_schemes: Vec<String>,
    pub ffmpeg_path: PathBuf,
    /// How long a freshly launched encoder must stay alive to count as started
    pub startup_grace: Duration,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            format: "flv".into(),
            video_bitrate_kbps: 2500,
            audio_bitrate_kbps: 128,
            allowed_schemes: vec!["rtmp".into(), "rtmps".into()],
            ffmpeg_path: PathBuf::from("ffmpeg"),
            startup_grace: Duration::from_millis(500),
        }
    }
}

impl RecorderOptions {
    pub fn scheme_allowed(&self, target: &str) -> bool {
        match url::Url::parse(target) {
            Ok(url) => self
                .allowed_schemes
                .iter()
                .any(|scheme| scheme.eq_ignore_ascii_case(url.scheme())),
            Err(_) => false,
        }
    }

    pub fn expected_schemes(&self) -> String {
        self.allowed_schemes.join(", ")
    }
}

#[async_trait]
pub trait Recorder: Send + Sync {
    fn target(&self) -> &str;

    /// Adds a track. A running recorder picks it up without renegotiation.
    async fn add_track(&mut self, track: &MediaTrack) -> Result<(), RecorderError>;

    async fn start(&mut self) -> Result<(), RecorderError>;

    /// Stops the worker. Stopping a recorder that is not running is a no-op.
    async fn stop(&mut self) -> Result<(), RecorderError>;
}

pub trait RecorderFactory: Send + Sync {
    fn create(
        &self,
        target: &str,
        format: &str,
        options: &RecorderOptions,
    ) -> Result<Box<dyn Recorder>, RecorderError>;
}
