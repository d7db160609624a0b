//! Recording fan-out: one upstream track set, many RTMP destinations.

mod ffmpeg;
mod orchestrator;
mod recorder;

pub use ffmpeg::{render_sdp, FfmpegRecorder, FfmpegRecorderFactory, StreamPort};
pub use orchestrator::{
    DestinationChange, DestinationState, RecordingOrchestrator, RecordingStatus, StartReport,
};
pub use recorder::{Recorder, RecorderFactory, RecorderOptions};
