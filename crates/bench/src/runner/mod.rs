mod pattern;

pub use pattern::write_pattern;

use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use encbench_buffer_encoder::{
    CancellationFlag, CodecDescriptor, EncoderBackend, ExchangeOptions, SessionConfig,
    SessionOptions, SessionOutcome, StartCoordinator, StartGate, run_session,
    synthetic::SyntheticBackend,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::{path::PathBuf, time::Instant};
use tracing::{info, warn};

use crate::config::{BackendKind, TestConfig};
use crate::results::{ResultsMeta, ResultsSummary, TestResult, TestResults};

pub struct TestRunner {
    config: TestConfig,
    config_path: Option<PathBuf>,
    cancel: CancellationFlag,
}

impl TestRunner {
    pub fn new(config: TestConfig) -> Self {
        Self {
            config,
            config_path: None,
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Cancelling stops every running session at its next iteration.
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub async fn run(&self) -> Result<TestResults> {
        match self.config.run.backend {
            BackendKind::Synthetic => self.run_with(SyntheticBackend::default()).await,
            BackendKind::Ffmpeg => self.run_ffmpeg().await,
        }
    }

    #[cfg(feature = "ffmpeg")]
    async fn run_ffmpeg(&self) -> Result<TestResults> {
        let backend =
            encbench_enc_ffmpeg::FfmpegBackend::new().context("Failed to initialize ffmpeg")?;
        self.run_with(backend).await
    }

    #[cfg(not(feature = "ffmpeg"))]
    async fn run_ffmpeg(&self) -> Result<TestResults> {
        anyhow::bail!("encbench was built without the `ffmpeg` feature")
    }

    pub async fn run_with<B>(&self, backend: B) -> Result<TestResults>
    where
        B: EncoderBackend + Clone + Send + 'static,
    {
        let start_time = Instant::now();
        let run = &self.config.run;

        println!(
            "\n{} {}",
            "Running encode tests:".bold().cyan(),
            self.config.meta.name
        );
        println!(
            "  {} tests on the {} backend{}",
            self.config.tests.len(),
            run.backend.display_name(),
            if run.parallel { ", started together" } else { "" }
        );
        println!();

        if let Some(pattern) = &self.config.pattern {
            write_pattern(pattern)?;
        }

        std::fs::create_dir_all(&run.output_dir).with_context(|| {
            format!("Failed to create output directory {}", run.output_dir.display())
        })?;

        let options = SessionOptions {
            exchange: ExchangeOptions {
                max_consecutive_rejections: run.max_consecutive_rejections,
                ..Default::default()
            },
            output_dir: run.output_dir.clone(),
            cancel: Some(self.cancel.clone()),
        };

        let outcomes = if run.parallel {
            self.run_parallel(backend, options).await?
        } else {
            self.run_sequential(backend, options).await?
        };

        let results: Vec<TestResult> = self
            .config
            .tests
            .iter()
            .zip(outcomes)
            .map(|(test, outcome)| TestResult::from_outcome(test, outcome))
            .collect();

        let summary = ResultsSummary::from_results(&results, start_time.elapsed());

        Ok(TestResults {
            meta: ResultsMeta {
                timestamp: Utc::now(),
                config_name: self.config.meta.name.clone(),
                config_path: self.config_path.as_ref().map(|p| p.display().to_string()),
                backend: run.backend.display_name().to_string(),
                parallel: run.parallel,
                platform: std::env::consts::OS.to_string(),
                encbench_version: option_env!("CARGO_PKG_VERSION").map(String::from),
            },
            results,
            summary,
        })
    }

    async fn run_sequential<B>(
        &self,
        backend: B,
        options: SessionOptions,
    ) -> Result<Vec<SessionOutcome>>
    where
        B: EncoderBackend + Clone + Send + 'static,
    {
        let progress = ProgressBar::new(self.config.tests.len() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("=>-"),
        );

        let mut outcomes = Vec::with_capacity(self.config.tests.len());

        for test in &self.config.tests {
            progress.set_message(test.id.clone());

            let outcome = spawn_session(test.clone(), backend.clone(), options.clone(), None)
                .await
                .with_context(|| format!("Session {} panicked", test.id))?;
            outcomes.push(outcome);

            progress.inc(1);
        }

        progress.finish_with_message("Complete");
        Ok(outcomes)
    }

    /// Sets every session up on its own blocking task and releases them
    /// together once all have reported ready.
    async fn run_parallel<B>(
        &self,
        backend: B,
        options: SessionOptions,
    ) -> Result<Vec<SessionOutcome>>
    where
        B: EncoderBackend + Clone + Send + 'static,
    {
        let expected = self.config.tests.len();
        let timeout = self.config.start_timeout();
        let (coordinator, gates) = StartCoordinator::new(expected, timeout);

        let handles: Vec<_> = self
            .config
            .tests
            .iter()
            .zip(gates)
            .map(|(test, gate)| {
                spawn_session(test.clone(), backend.clone(), options.clone(), Some(gate))
            })
            .collect();

        let ready = tokio::task::spawn_blocking(move || {
            let ready = coordinator.wait_ready(timeout);
            coordinator.release();
            ready
        })
        .await
        .context("Start coordinator panicked")?;

        if ready.len() < expected {
            warn!(
                "Only {} of {expected} sessions were ready within {timeout:?}",
                ready.len()
            );
        } else {
            info!("Released {expected} sessions");
        }

        let mut outcomes = Vec::with_capacity(expected);
        for (test, handle) in self.config.tests.iter().zip(handles) {
            outcomes.push(
                handle
                    .await
                    .with_context(|| format!("Session {} panicked", test.id))?,
            );
        }

        Ok(outcomes)
    }
}

fn spawn_session<B>(
    test: SessionConfig,
    backend: B,
    options: SessionOptions,
    gate: Option<StartGate>,
) -> tokio::task::JoinHandle<SessionOutcome>
where
    B: EncoderBackend + Send + 'static,
{
    tokio::task::spawn_blocking(move || run_session(&test, &backend, &options, gate))
}

/// Encoders the given backend can create.
pub fn list_codecs(kind: BackendKind) -> Result<Vec<CodecDescriptor>> {
    match kind {
        BackendKind::Synthetic => Ok(SyntheticBackend::default().list_encoders()),
        #[cfg(feature = "ffmpeg")]
        BackendKind::Ffmpeg => Ok(encbench_enc_ffmpeg::FfmpegBackend::new()
            .context("Failed to initialize ffmpeg")?
            .list_encoders()),
        #[cfg(not(feature = "ffmpeg"))]
        BackendKind::Ffmpeg => anyhow::bail!("encbench was built without the `ffmpeg` feature"),
    }
}
