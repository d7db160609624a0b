//! Destination set and per-destination recorder lifecycle.
//!
//! Every destination moves `Absent -> Starting -> Active` and
//! `Active -> Stopping -> Absent`. Concurrent start/stop attempts each own
//! their recorder; results are written back into the map only after all of
//! them have finished.

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{CommandError, DestinationError, RecorderError};
use crate::peer::types::MediaTrack;
use crate::recording::recorder::{Recorder, RecorderFactory, RecorderOptions};
use crate::utils::normalize_destination;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DestinationState {
    Absent,
    Starting,
    Active,
    Stopping,
}

struct Destination {
    state: DestinationState,
    recorder: Option<Box<dyn Recorder>>,
}

impl Destination {
    fn new() -> Self {
        Self {
            state: DestinationState::Absent,
            recorder: None,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RecordingStatus {
    pub recording: bool,
    pub urls: Vec<String>,
    pub tracks: usize,
    pub active_recorders: usize,
}

/// Outcome of `start_recording`; failures are per destination and never raised.
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<String>,
    pub failed: Vec<DestinationError>,
}

/// Outcome of adding or removing one destination.
#[derive(Debug)]
pub struct DestinationChange {
    pub url: String,
    /// False when the call was a no-op.
    pub changed: bool,
    pub failure: Option<DestinationError>,
}

pub struct RecordingOrchestrator {
    factory: Arc<dyn RecorderFactory>,
    options: RecorderOptions,
    destinations: BTreeMap<String, Destination>,
    recording: bool,
}

impl RecordingOrchestrator {
    pub fn new(factory: Arc<dyn RecorderFactory>, options: RecorderOptions) -> Self {
        Self {
            factory,
            options,
            destinations: BTreeMap::new(),
            recording: false,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Registered destinations, sorted.
    pub fn urls(&self) -> Vec<String> {
        self.destinations.keys().cloned().collect()
    }

    pub fn state_of(&self, url: &str) -> DestinationState {
        self.destinations
            .get(url)
            .map(|d| d.state)
            .unwrap_or(DestinationState::Absent)
    }

    pub fn active_recorders(&self) -> usize {
        self.destinations
            .values()
            .filter(|d| d.state == DestinationState::Active)
            .count()
    }

    pub fn status(&self, track_count: usize) -> RecordingStatus {
        RecordingStatus {
            recording: self.recording,
            urls: self.urls(),
            tracks: track_count,
            active_recorders: self.active_recorders(),
        }
    }

    /// Starts a recorder for every destination that is not already active.
    pub async fn start_recording(&mut self, tracks: &[MediaTrack]) -> StartReport {
        if self.destinations.is_empty() {
            log::info!("no destinations configured, nothing to record");
            return StartReport::default();
        }

        let pending: Vec<String> = self
            .destinations
            .iter_mut()
            .filter(|(_, d)| d.state != DestinationState::Active)
            .map(|(url, d)| {
                d.state = DestinationState::Starting;
                url.clone()
            })
            .collect();

        log::info!(
            "starting {} recorder(s) with {} track(s)",
            pending.len(),
            tracks.len()
        );
        let results = self.launch_all(pending, tracks).await;

        let mut report = StartReport::default();
        for (url, result) in results {
            match result {
                Ok(recorder) => {
                    self.settle_started(&url, recorder).await;
                    report.started.push(url);
                }
                Err(e) => {
                    log::warn!("failed to start recording: {e}");
                    self.settle_failed(&url);
                    report.failed.push(e);
                }
            }
        }

        self.recording = true;
        report
    }

    /// Stops every active recorder; returns the destinations whose stop failed.
    pub async fn stop_recording(&mut self) -> Vec<DestinationError> {
        if !self.recording {
            log::debug!("not recording, nothing to stop");
            return Vec::new();
        }

        let active: Vec<(String, Box<dyn Recorder>)> = self
            .destinations
            .iter_mut()
            .filter_map(|(url, d)| {
                let recorder = d.recorder.take()?;
                d.state = DestinationState::Stopping;
                Some((url.clone(), recorder))
            })
            .collect();

        let results = join_all(active.into_iter().map(|(url, mut recorder)| async move {
            let result = recorder.stop().await;
            (url, result)
        }))
        .await;

        let mut failed = Vec::new();
        for (url, result) in results {
            if let Some(d) = self.destinations.get_mut(&url) {
                d.state = DestinationState::Absent;
            }
            if let Err(source) = result {
                log::warn!("failed to stop recorder for {url}: {source}");
                failed.push(DestinationError::Recorder { url, source });
            }
        }

        self.recording = false;
        log::info!("recording stopped");
        failed
    }

    pub async fn add_destination(
        &mut self,
        address: &str,
        tracks: &[MediaTrack],
    ) -> Result<DestinationChange, CommandError> {
        let url = normalize_destination(address).ok_or(CommandError::UrlRequired)?;
        if self.destinations.contains_key(&url) {
            return Ok(DestinationChange {
                url,
                changed: false,
                failure: None,
            });
        }

        self.destinations.insert(url.clone(), Destination::new());
        log::info!("added destination {url}");

        let mut failure = None;
        if self.recording && !tracks.is_empty() {
            if let Some(d) = self.destinations.get_mut(&url) {
                d.state = DestinationState::Starting;
            }
            let mut results = self.launch_all(vec![url.clone()], tracks).await;
            if let Some((_, result)) = results.pop() {
                match result {
                    Ok(recorder) => self.settle_started(&url, recorder).await,
                    Err(e) => {
                        log::warn!("failed to start recording: {e}");
                        self.settle_failed(&url);
                        failure = Some(e);
                    }
                }
            }
        }

        Ok(DestinationChange {
            url,
            changed: true,
            failure,
        })
    }

    pub async fn remove_destination(
        &mut self,
        address: &str,
    ) -> Result<DestinationChange, CommandError> {
        let url = normalize_destination(address).ok_or(CommandError::UrlRequired)?;
        let Some(mut destination) = self.destinations.remove(&url) else {
            return Ok(DestinationChange {
                url,
                changed: false,
                failure: None,
            });
        };

        if let Some(mut recorder) = destination.recorder.take() {
            destination.state = DestinationState::Stopping;
            if let Err(e) = recorder.stop().await {
                log::warn!("failed to stop recorder for {url}: {e}");
            }
        }
        log::info!("removed destination {url}");

        Ok(DestinationChange {
            url,
            changed: true,
            failure: None,
        })
    }

    /// Hands a newly arrived track to every live recorder.
    ///
    /// While recording, destinations without a recorder (for example after a
    /// `start` that had no media yet) are launched with the full `tracks` set.
    pub async fn attach_track(
        &mut self,
        track: &MediaTrack,
        tracks: &[MediaTrack],
    ) -> Vec<DestinationError> {
        let idle: Vec<String> = if self.recording {
            self.destinations
                .iter_mut()
                .filter(|(_, d)| d.state == DestinationState::Absent && d.recorder.is_none())
                .map(|(url, d)| {
                    d.state = DestinationState::Starting;
                    url.clone()
                })
                .collect()
        } else {
            Vec::new()
        };

        let results = join_all(
            self.destinations
                .iter_mut()
                .filter_map(|(url, d)| d.recorder.as_mut().map(|r| (url, r)))
                .map(|(url, recorder)| async move {
                    let result = recorder.add_track(track).await;
                    (url.clone(), result)
                }),
        )
        .await;

        let mut failed = Vec::new();
        for (url, result) in results {
            if let Err(source) = result {
                log::warn!("recorder for {url} could not take track {}: {source}", track.id());
                if let Some(d) = self.destinations.get_mut(&url) {
                    if let Some(mut recorder) = d.recorder.take() {
                        let _ = recorder.stop().await;
                    }
                    d.state = DestinationState::Absent;
                }
                failed.push(DestinationError::Recorder { url, source });
            }
        }

        if !idle.is_empty() {
            log::info!("track {} arrived, starting {} idle recorder(s)", track.id(), idle.len());
            for (url, result) in self.launch_all(idle, tracks).await {
                match result {
                    Ok(recorder) => self.settle_started(&url, recorder).await,
                    Err(e) => {
                        log::warn!("failed to start recording: {e}");
                        self.settle_failed(&url);
                        failed.push(e);
                    }
                }
            }
        }
        failed
    }

    async fn launch_all(
        &self,
        urls: Vec<String>,
        tracks: &[MediaTrack],
    ) -> Vec<(String, Result<Box<dyn Recorder>, DestinationError>)> {
        let factory = self.factory.as_ref();
        let options = &self.options;
        join_all(urls.into_iter().map(|url| async move {
            let result = launch_recorder(factory, &url, tracks, options).await;
            (url, result)
        }))
        .await
    }

    async fn settle_started(&mut self, url: &str, mut recorder: Box<dyn Recorder>) {
        match self.destinations.get_mut(url) {
            Some(d) => {
                log::info!("recording to {}", recorder.target());
                d.state = DestinationState::Active;
                d.recorder = Some(recorder);
            }
            None => {
                let _ = recorder.stop().await;
            }
        }
    }

    fn settle_failed(&mut self, url: &str) {
        if let Some(d) = self.destinations.get_mut(url) {
            d.state = DestinationState::Absent;
            d.recorder = None;
        }
    }
}

/// Builds, feeds and starts one recorder. A half-built recorder is stopped before returning an error.
async fn launch_recorder(
    factory: &dyn RecorderFactory,
    url: &str,
    tracks: &[MediaTrack],
    options: &RecorderOptions,
) -> Result<Box<dyn Recorder>, DestinationError> {
    if !options.scheme_allowed(url) {
        return Err(DestinationError::UnsupportedScheme {
            url: url.to_string(),
            expected: options.expected_schemes(),
        });
    }
    if tracks.is_empty() {
        return Err(DestinationError::NoMedia {
            url: url.to_string(),
        });
    }

    let wrap = |source: RecorderError| DestinationError::Recorder {
        url: url.to_string(),
        source,
    };

    let mut recorder = factory
        .create(url, &options.format, options)
        .map_err(wrap)?;

    for track in tracks {
        if let Err(e) = recorder.add_track(track).await {
            let _ = recorder.stop().await;
            return Err(wrap(e));
        }
    }
    if let Err(e) = recorder.start().await {
        let _ = recorder.stop().await;
        return Err(wrap(e));
    }
    Ok(recorder)
}
