use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::{
    config::{ConfigError, SessionConfig},
    device::{DeviceError, EncoderBackend, EncoderDevice, EncoderFormat},
    exchange::{BufferExchange, ExchangeOptions, ExchangeReport},
    gate::{CancellationFlag, StartGate},
    rate::FrameRateSelector,
    runtime::RuntimeSchedule,
    sink::{SinkError, TrackWriter},
    source::{FrameSource, SourceError, TerminationPolicy},
    stats::Statistics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SessionState {
    Init,
    Started,
    Running,
    Stopped,
    Released,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("Failed to create codec: {0}")]
    CreateCodec(#[source] DeviceError),
    #[error("Failed to configure codec: {0}")]
    Configure(#[source] DeviceError),
    #[error("Start encoding failed: {0}")]
    Start(#[source] DeviceError),
    #[error("Failed to create output: {0}")]
    CreateSink(#[source] SinkError),
    #[error("Device: {0}")]
    Device(#[from] DeviceError),
    #[error("Container: {0}")]
    Sink(#[from] SinkError),
    #[error("Device rejected {0} submissions in a row")]
    DeviceStalled(u32),
    #[error("Cannot {op} a session that is {state:?}")]
    Lifecycle {
        op: &'static str,
        state: SessionState,
    },
}

impl SessionError {
    /// True when the session never got as far as exchanging buffers.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Source(SourceError::Open { .. } | SourceError::Empty(_))
                | Self::CreateCodec(_)
                | Self::Configure(_)
                | Self::Start(_)
                | Self::CreateSink(_)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub exchange: ExchangeOptions,
    /// Directory container files are written to.
    pub output_dir: PathBuf,
    pub cancel: Option<CancellationFlag>,
}

/// One configured device, its source and its sink, from start to release.
pub struct EncodeSession<D: EncoderDevice> {
    id: String,
    device: D,
    writer: Option<TrackWriter>,
    exchange: BufferExchange,
    stats: Statistics,
    state: SessionState,
    output_path: Option<PathBuf>,
    gate: Option<StartGate>,
}

impl<D: EncoderDevice> EncodeSession<D> {
    /// Opens the source, creates and configures the device, opens the sink and
    /// starts the device. Any failure here is fatal to the session.
    pub fn start<B>(
        config: &SessionConfig,
        backend: &B,
        options: &SessionOptions,
    ) -> Result<Self, SessionError>
    where
        B: EncoderBackend<Device = D>,
    {
        config.validate()?;

        let input = &config.input;
        let source = FrameSource::open(
            &input.path,
            input.resolution.raw_frame_size(),
            input.framerate,
            TerminationPolicy::from_input(input),
        )?;

        let name = backend
            .resolve_codec(config.configure.codec.as_deref(), config.configure.mime.as_deref())
            .map_err(SessionError::CreateCodec)?;
        let mut device = backend
            .create_by_name(&name)
            .map_err(SessionError::CreateCodec)?;

        let format = EncoderFormat {
            codec: name.clone(),
            resolution: input.resolution,
            pixel_layout: input.pix_fmt,
            frame_rate: config.target_frame_rate(),
            bitrate: config.configure.bitrate,
            i_frame_interval: config.configure.i_frame_interval,
        };
        info!("{}: configuring {} with {format}", config.id, device.name());

        if let Err(e) = device.configure(&format) {
            device.release();
            return Err(SessionError::Configure(e));
        }

        let mut output_path = None;
        let mut writer = None;
        if config.write_file() {
            let path = output_file(&options.output_dir, &config.id, backend.container_extension());
            match backend.create_sink(&path) {
                Ok(sink) => writer = Some(TrackWriter::new(sink)),
                Err(e) => {
                    device.release();
                    return Err(SessionError::CreateSink(e));
                }
            }
            output_path = Some(path);
        }

        if let Err(e) = device.start() {
            device.release();
            return Err(SessionError::Start(e));
        }

        if let Some(writer) = writer.as_mut()
            && !device.emits_codec_config()
        {
            let early = device.output_format().map_err(SessionError::from).and_then(|format| {
                debug!("{}: adding track before output for {}", config.id, format.mime);
                writer.open_track(&format).map_err(SessionError::from)
            });
            if let Err(e) = early {
                warn!(
                    "{}: no track before output, adding it with the first unit: {e}",
                    config.id
                );
            }
        }

        let mut stats = Statistics::new(&config.id);
        stats.set_codec(&name);
        stats.set_input_format(format.to_string());

        let exchange_options = ExchangeOptions {
            realtime: input.realtime,
            ..options.exchange.clone()
        };
        let mut exchange = BufferExchange::new(
            &config.id,
            source,
            FrameRateSelector::new(config.source_frame_rate(), config.target_frame_rate()),
            RuntimeSchedule::from_config(&config.runtime),
            exchange_options,
        );
        if let Some(cancel) = &options.cancel {
            exchange = exchange.with_cancellation(cancel.clone());
        }

        Ok(Self {
            id: config.id.clone(),
            device,
            writer,
            exchange,
            stats,
            state: SessionState::Started,
            output_path,
            gate: None,
        })
    }

    /// Makes [`EncodeSession::run`] wait for a coordinated start.
    pub fn set_start_gate(&mut self, gate: StartGate) {
        self.gate = Some(gate);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Exchanges buffers until the device has drained.
    ///
    /// The readiness handshake only happens when a gate was set with
    /// [`EncodeSession::set_start_gate`]. A session on its own has nobody to
    /// wait for and starts encoding immediately.
    pub fn run(&mut self) -> Result<ExchangeReport, SessionError> {
        if self.state != SessionState::Started {
            return Err(SessionError::Lifecycle {
                op: "run",
                state: self.state,
            });
        }

        if let Some(gate) = self.gate.take() {
            gate.signal_and_wait(&self.id);
        }

        self.stats.start();
        self.state = SessionState::Running;

        let result = self
            .exchange
            .run(&mut self.device, self.writer.as_mut(), &mut self.stats);

        self.stats.stop();
        result
    }

    pub fn report(&self) -> ExchangeReport {
        self.exchange.report()
    }

    /// Stops the device and finalizes the sink. Later calls do nothing.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Stopped | SessionState::Released => {
                debug!("{}: already {:?}", self.id, self.state);
                return Ok(());
            }
            SessionState::Init | SessionState::Started | SessionState::Running => {}
        }
        self.state = SessionState::Stopped;
        self.stats.stop();

        let device = self.device.stop();
        let sink = match self.writer.as_mut() {
            Some(writer) => writer.finalize(),
            None => Ok(()),
        };

        device.map_err(SessionError::from)?;
        sink.map_err(SessionError::from)
    }

    /// Stops if needed, then hands the device back. Later calls do nothing.
    pub fn release(&mut self) {
        if self.state == SessionState::Released {
            return;
        }

        if let Err(e) = self.stop() {
            warn!("{}: stop during release: {e}", self.id);
        }
        self.device.release();
        self.state = SessionState::Released;
        debug!("{}: released", self.id);
    }

    pub fn into_outcome(mut self, error: Option<SessionError>) -> SessionOutcome {
        self.release();

        SessionOutcome {
            id: self.id.clone(),
            error,
            statistics: std::mem::take(&mut self.stats),
            report: self.exchange.report(),
            output_path: self.output_path.take(),
        }
    }
}

impl<D: EncoderDevice> Drop for EncodeSession<D> {
    fn drop(&mut self) {
        self.release();
    }
}

/// What a finished session leaves behind.
#[derive(Debug)]
pub struct SessionOutcome {
    pub id: String,
    pub error: Option<SessionError>,
    pub statistics: Statistics,
    pub report: ExchangeReport,
    pub output_path: Option<PathBuf>,
}

impl SessionOutcome {
    pub fn failed(id: impl Into<String>, error: SessionError) -> Self {
        let id = id.into();
        Self {
            statistics: Statistics::new(&id),
            id,
            error: Some(error),
            report: ExchangeReport::default(),
            output_path: None,
        }
    }

    /// Empty on success, a description of the failure otherwise.
    pub fn status(&self) -> String {
        self.error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs one session start to release and collects its outcome.
pub fn run_session<B: EncoderBackend>(
    config: &SessionConfig,
    backend: &B,
    options: &SessionOptions,
    gate: Option<StartGate>,
) -> SessionOutcome {
    let mut session = match EncodeSession::start(config, backend, options) {
        Ok(session) => session,
        Err(e) => {
            error!("{}: {e}", config.id);
            if let Some(gate) = gate {
                gate.abandon(&config.id);
            }
            return SessionOutcome::failed(&config.id, e);
        }
    };

    if let Some(gate) = gate {
        session.set_start_gate(gate);
    }

    let result = session.run();
    let teardown = session.stop();

    let error = match (result, teardown) {
        (Err(e), teardown) => {
            if let Err(t) = teardown {
                warn!("{}: teardown after failure: {t}", config.id);
            }
            Some(e)
        }
        (Ok(_), Err(e)) => Some(e),
        (Ok(report), Ok(())) => {
            info!(
                "{}: {} frames submitted, {} output units, {} loops",
                config.id, report.frames_submitted, report.payload_units, report.loops
            );
            None
        }
    };

    if let Some(e) = &error {
        error!("{}: {e}", config.id);
    }

    session.into_outcome(error)
}

fn output_file(dir: &Path, id: &str, extension: &str) -> PathBuf {
    let stem: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("{stem}.{extension}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_empty_on_success() {
        let outcome = SessionOutcome {
            id: "t".into(),
            error: None,
            statistics: Statistics::new("t"),
            report: ExchangeReport::default(),
            output_path: None,
        };
        assert_eq!(outcome.status(), "");

        let failed = SessionOutcome::failed("t", SessionError::Start(DeviceError::Start("no".into())));
        assert!(failed.status().starts_with("Start encoding failed"));
    }

    #[test]
    fn setup_errors_are_distinguished_from_run_errors() {
        assert!(SessionError::CreateCodec(DeviceError::CodecNotFound("x".into())).is_setup());
        assert!(SessionError::Config(ConfigError::InvalidFrameRate(0.0)).is_setup());
        assert!(SessionError::CreateSink(SinkError::NotStarted).is_setup());
        assert!(!SessionError::Sink(SinkError::NotStarted).is_setup());
        assert!(!SessionError::DeviceStalled(3).is_setup());
        assert!(!SessionError::Device(DeviceError::Start("gone".into())).is_setup());
    }

    #[test]
    fn output_file_sanitizes_id() {
        assert_eq!(
            output_file(Path::new("out"), "h264 720p/30", "mp4"),
            Path::new("out").join("h264_720p_30.mp4")
        );
    }
}
