use chrono::{DateTime, Utc};
use encbench_buffer_encoder::{
    ExchangeReport, FrameRecord, OutputFormat, SessionConfig, SessionOutcome,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResults {
    pub meta: ResultsMeta,
    pub results: Vec<TestResult>,
    pub summary: ResultsSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsMeta {
    pub timestamp: DateTime<Utc>,
    pub config_name: String,
    pub config_path: Option<String>,
    pub backend: String,
    pub parallel: bool,
    pub platform: String,
    pub encbench_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: String,
    pub description: String,
    pub status: TestStatus,
    /// Empty when the test passed.
    pub failure_reason: Option<String>,
    pub codec: Option<String>,
    pub input_format: Option<String>,
    pub output_format: Option<OutputFormat>,
    pub output_path: Option<String>,
    pub exchange: ExchangeReport,
    pub frames: FrameMetrics,
    pub latency_ms: Option<LatencyMetrics>,
    pub records: Vec<FrameRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub encoded: u64,
    pub bytes: u64,
    pub keyframes: u64,
    pub duration_secs: f64,
    pub effective_fps: f64,
    pub average_bitrate_bps: f64,
    pub target_fps: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatencyMetrics {
    pub avg: f64,
    pub min: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    /// The session ran but ended with an error.
    Fail,
    /// The session could not be set up.
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub total_tests: u32,
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub duration_secs: f64,
    pub pass_rate: f64,
    pub total_frames: u64,
    pub total_bytes: u64,
}

impl TestResult {
    pub fn from_outcome(config: &SessionConfig, outcome: SessionOutcome) -> Self {
        let status = match &outcome.error {
            None => TestStatus::Pass,
            Some(e) if e.is_setup() => TestStatus::Error,
            Some(_) => TestStatus::Fail,
        };

        let stats = &outcome.statistics;
        let target_fps = config.target_frame_rate();
        let encoded = stats.frame_count() as u64;
        let bytes = stats.total_bytes();
        let duration_secs = stats
            .encoding_duration()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        let frames = FrameMetrics {
            encoded,
            bytes,
            keyframes: stats.keyframe_count() as u64,
            duration_secs,
            effective_fps: if duration_secs > 0.0 {
                encoded as f64 / duration_secs
            } else {
                0.0
            },
            average_bitrate_bps: average_bitrate(bytes, encoded, target_fps),
            target_fps,
        };

        let mut latencies: Vec<f64> = stats
            .records()
            .iter()
            .filter_map(FrameRecord::latency)
            .map(|l| l.as_secs_f64() * 1000.0)
            .collect();

        Self {
            test_id: outcome.id.clone(),
            description: config.description.clone(),
            status,
            failure_reason: outcome.error.as_ref().map(ToString::to_string),
            codec: stats.codec().map(String::from),
            input_format: stats.input_format().map(String::from),
            output_format: stats.output_format().cloned(),
            output_path: outcome
                .output_path
                .as_ref()
                .map(|p| p.display().to_string()),
            exchange: outcome.report.clone(),
            frames,
            latency_ms: LatencyMetrics::from_samples(&mut latencies),
            records: stats.records().to_vec(),
        }
    }
}

/// Bits per second of content, measured against the target frame clock
/// rather than how long encoding took.
pub fn average_bitrate(bytes: u64, frames: u64, fps: f32) -> f64 {
    if frames == 0 || fps <= 0.0 {
        return 0.0;
    }
    (bytes * 8) as f64 * f64::from(fps) / frames as f64
}

impl LatencyMetrics {
    /// Sorts `samples` in place. `None` when there are no samples.
    pub fn from_samples(samples: &mut [f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(f64::total_cmp);

        let sum: f64 = samples.iter().sum();
        Some(Self {
            avg: sum / samples.len() as f64,
            min: samples[0],
            p50: percentile(samples, 50.0),
            p95: percentile(samples, 95.0),
            p99: percentile(samples, 99.0),
            max: samples[samples.len() - 1],
        })
    }
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

impl ResultsSummary {
    pub fn from_results(results: &[TestResult], total_duration: Duration) -> Self {
        let total = results.len() as u32;
        let count = |status: TestStatus| results.iter().filter(|r| r.status == status).count() as u32;
        let passed = count(TestStatus::Pass);

        let pass_rate = if total > 0 {
            passed as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Self {
            total_tests: total,
            passed,
            failed: count(TestStatus::Fail),
            errors: count(TestStatus::Error),
            duration_secs: total_duration.as_secs_f64(),
            pass_rate,
            total_frames: results.iter().map(|r| r.frames.encoded).sum(),
            total_bytes: results.iter().map(|r| r.frames.bytes).sum(),
        }
    }
}
