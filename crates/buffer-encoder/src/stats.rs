use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::device::OutputFormat;

/// One ordinary output unit as seen by the collector. Times are microseconds
/// since [`Statistics::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub pts_us: i64,
    pub size: usize,
    pub keyframe: bool,
    pub submitted_at_us: Option<u64>,
    pub completed_at_us: u64,
}

impl FrameRecord {
    /// Time from submission of the source frame to arrival of its output unit.
    pub fn latency(&self) -> Option<Duration> {
        let submitted = self.submitted_at_us?;
        Some(Duration::from_micros(
            self.completed_at_us.saturating_sub(submitted),
        ))
    }
}

/// Append-only per-frame timing for one session.
#[derive(Debug, Default)]
pub struct Statistics {
    id: String,
    codec: Option<String>,
    input_format: Option<String>,
    output_format: Option<OutputFormat>,
    started: Option<Instant>,
    stopped: Option<Instant>,
    submitted: HashMap<i64, Instant>,
    records: Vec<FrameRecord>,
}

impl Statistics {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_codec(&mut self, codec: impl Into<String>) {
        self.codec = Some(codec.into());
    }

    pub fn codec(&self) -> Option<&str> {
        self.codec.as_deref()
    }

    pub fn set_input_format(&mut self, format: impl Into<String>) {
        self.input_format = Some(format.into());
    }

    pub fn input_format(&self) -> Option<&str> {
        self.input_format.as_deref()
    }

    pub fn set_output_format(&mut self, format: OutputFormat) {
        self.output_format = Some(format);
    }

    pub fn output_format(&self) -> Option<&OutputFormat> {
        self.output_format.as_ref()
    }

    /// Records the baseline wall-clock time. Calling it again is ignored.
    pub fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        if self.started.is_some() && self.stopped.is_none() {
            self.stopped = Some(Instant::now());
        }
        self.submitted.clear();
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some() && self.stopped.is_none()
    }

    pub fn encoding_duration(&self) -> Option<Duration> {
        let start = self.started?;
        Some(self.stopped.unwrap_or_else(Instant::now).duration_since(start))
    }

    /// Notes when the frame with `pts_us` was handed to the device.
    pub fn start_frame(&mut self, pts_us: i64, submitted_at: Instant) {
        if self.is_running() {
            self.submitted.insert(pts_us, submitted_at);
        }
    }

    pub fn record(&mut self, pts_us: i64, size: usize, keyframe: bool) {
        let Some(start) = self.started else {
            warn!("{}: output unit at {pts_us}us before statistics start", self.id);
            return;
        };
        if self.stopped.is_some() {
            warn!("{}: output unit at {pts_us}us after statistics stop", self.id);
            return;
        }

        let now = Instant::now();
        let since_start = |t: Instant| t.saturating_duration_since(start).as_micros() as u64;

        self.records.push(FrameRecord {
            pts_us,
            size,
            keyframe,
            submitted_at_us: self.submitted.remove(&pts_us).map(since_start),
            completed_at_us: since_start(now),
        });
    }

    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    pub fn frame_count(&self) -> usize {
        self.records.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.size as u64).sum()
    }

    pub fn keyframe_count(&self) -> usize {
        self.records.iter().filter(|r| r.keyframe).count()
    }
}
