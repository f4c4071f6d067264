use std::{
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, trace, warn};

use crate::{
    device::{
        BufferFlags, EncoderDevice, InputClaim, OutputClaim, OutputKind, OutputPoll, OutputUnit,
    },
    gate::CancellationFlag,
    rate::FrameRateSelector,
    runtime::RuntimeSchedule,
    session::SessionError,
    sink::TrackWriter,
    source::{FillOutcome, FrameSource},
    stats::Statistics,
};

#[derive(Debug, Clone)]
pub struct ExchangeOptions {
    /// Bounded wait for a free input slot.
    pub input_timeout: Duration,
    /// Bounded wait for an output unit while input is still being fed.
    pub output_timeout: Duration,
    /// Bounded wait for an output unit once end of stream was submitted.
    /// Nothing arriving within it ends the session.
    pub drain_timeout: Duration,
    /// Delay each submission until its presentation time has passed.
    pub realtime: bool,
    /// Give up after this many rejected submissions in a row.
    pub max_consecutive_rejections: Option<u32>,
    pub progress_interval: u64,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            input_timeout: Duration::from_millis(10),
            output_timeout: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(1),
            realtime: false,
            max_consecutive_rejections: None,
            progress_interval: 100,
        }
    }
}

/// Where the exchange is in its lifetime. Output is polled in both
/// `Feeding` and `Draining`, input only in `Feeding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ExchangeState {
    Feeding,
    Draining,
    Done,
}

impl ExchangeState {
    pub fn input_done(&self) -> bool {
        !matches!(self, Self::Feeding)
    }

    pub fn output_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExchangeReport {
    /// Frames handed to the device, the final one included.
    pub frames_submitted: u64,
    /// Source frames consumed without being submitted.
    pub frames_skipped: u64,
    /// Skipped frames that were dropped by the runtime schedule.
    pub frames_dropped: u64,
    pub source_frames: u64,
    pub loops: u32,
    pub rejections: u64,
    pub config_units: u64,
    pub payload_units: u64,
    pub eos_submitted: u32,
    pub eos_received: bool,
    pub cancelled: bool,
}

/// Drives one device through its input and output queues until the device
/// has emitted its end of stream.
pub struct BufferExchange {
    id: String,
    source: FrameSource,
    selector: FrameRateSelector,
    schedule: RuntimeSchedule,
    options: ExchangeOptions,
    cancel: Option<CancellationFlag>,
    state: ExchangeState,
    report: ExchangeReport,
    rejections_in_row: u32,
}

impl BufferExchange {
    pub fn new(
        id: impl Into<String>,
        source: FrameSource,
        selector: FrameRateSelector,
        schedule: RuntimeSchedule,
        options: ExchangeOptions,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            selector,
            schedule,
            options,
            cancel: None,
            state: ExchangeState::Feeding,
            report: ExchangeReport::default(),
            rejections_in_row: 0,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    pub fn report(&self) -> ExchangeReport {
        let mut report = self.report.clone();
        report.source_frames = self.source.cursor().frames;
        report.loops = self.source.cursor().loops;
        report
    }

    /// Runs until the exchange is done or a fatal error occurs.
    pub fn run<D: EncoderDevice + ?Sized>(
        &mut self,
        device: &mut D,
        mut writer: Option<&mut TrackWriter>,
        stats: &mut Statistics,
    ) -> Result<ExchangeReport, SessionError> {
        let clock = Instant::now();

        while !self.state.input_done() || !self.state.output_done() {
            if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                info!("{}: cancelled", self.id);
                self.report.cancelled = true;
                self.state = ExchangeState::Done;
                break;
            }

            if !self.state.input_done() {
                self.feed(device, stats, clock)?;
            }

            self.drain(device, writer.as_deref_mut(), stats)?;
        }

        self.source.close();
        Ok(self.report())
    }

    fn feed<D: EncoderDevice + ?Sized>(
        &mut self,
        device: &mut D,
        stats: &mut Statistics,
        clock: Instant,
    ) -> Result<(), SessionError> {
        let slot = match device.dequeue_input(self.options.input_timeout) {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                trace!("{}: no free input slot", self.id);
                return Ok(());
            }
            Err(e) if e.is_transient() => {
                debug!("{}: dequeue input: {e}", self.id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut claim = InputClaim::new(device, slot);

        loop {
            let ordinal = self.source.cursor().frames;
            if self.source.is_done_at(ordinal) {
                // the last forwarded frame could not carry the flag
                return self.submit_end_of_stream(claim);
            }

            let len = match self.source.fill_frame(claim.buffer()?)? {
                FillOutcome::Filled(len) => len,
                FillOutcome::Exhausted => return self.submit_end_of_stream(claim),
                FillOutcome::Unavailable => {
                    debug!("{}: source frame {ordinal} not ready", self.id);
                    return Ok(());
                }
            };

            if !self.selector.should_forward(ordinal) {
                self.source.commit();
                self.report.frames_skipped += 1;
                continue;
            }
            if self.schedule.drops(ordinal) {
                debug!("{}: dropping frame {ordinal}", self.id);
                self.source.commit();
                self.report.frames_skipped += 1;
                self.report.frames_dropped += 1;
                continue;
            }

            let pts = self.source.presentation_time_us(ordinal);
            let last = self.is_final(ordinal);

            if let Some(params) = self.schedule.parameters_at(ordinal)
                && let Err(e) = claim.device().set_parameters(&params)
            {
                warn!("{}: set parameters at frame {ordinal}: {e}", self.id);
            }

            if self.options.realtime {
                pace(clock, pts);
            }

            let flags = if last {
                BufferFlags::END_OF_STREAM
            } else {
                BufferFlags::empty()
            };
            let submitted_at = Instant::now();

            match claim.submit(len, pts, flags) {
                Ok(()) => {
                    self.source.commit();
                    self.rejections_in_row = 0;
                    self.report.frames_submitted += 1;
                    stats.start_frame(pts, submitted_at);

                    if last {
                        self.end_of_stream_submitted(ordinal);
                    } else {
                        self.log_progress();
                    }
                }
                Err(e) if e.is_transient() => {
                    self.source.unread()?;
                    self.rejected(ordinal, &e.to_string())?;
                }
                Err(e) => return Err(e.into()),
            }

            return Ok(());
        }
    }

    /// Whether reading stops before the next frame that would be submitted.
    fn is_final(&self, ordinal: u64) -> bool {
        let mut next = ordinal + 1;
        loop {
            if self.source.is_done_at(next) {
                return true;
            }
            if self.selector.should_forward(next) && !self.schedule.drops(next) {
                return false;
            }
            next += 1;
        }
    }

    fn submit_end_of_stream<D: EncoderDevice + ?Sized>(
        &mut self,
        claim: InputClaim<'_, D>,
    ) -> Result<(), SessionError> {
        let ordinal = self.source.cursor().frames;
        let pts = self.source.presentation_time_us(ordinal);

        match claim.submit(0, pts, BufferFlags::END_OF_STREAM) {
            Ok(()) => {
                self.rejections_in_row = 0;
                self.end_of_stream_submitted(ordinal);
                Ok(())
            }
            Err(e) if e.is_transient() => self.rejected(ordinal, &e.to_string()),
            Err(e) => Err(e.into()),
        }
    }

    fn end_of_stream_submitted(&mut self, ordinal: u64) {
        self.report.eos_submitted += 1;
        self.state = ExchangeState::Draining;

        let cursor = self.source.cursor();
        info!(
            "{}: end of stream at frame {ordinal} after {} submitted, loop {}, {:?}",
            self.id, self.report.frames_submitted, cursor.loops, cursor.elapsed
        );
    }

    fn rejected(&mut self, ordinal: u64, reason: &str) -> Result<(), SessionError> {
        self.report.rejections += 1;
        self.rejections_in_row += 1;
        warn!(
            "{}: device rejected frame {ordinal} ({reason}), retrying",
            self.id
        );

        match self.options.max_consecutive_rejections {
            Some(limit) if self.rejections_in_row > limit => {
                Err(SessionError::DeviceStalled(self.rejections_in_row))
            }
            _ => Ok(()),
        }
    }

    fn log_progress(&self) {
        let interval = self.options.progress_interval;
        if interval == 0 || self.report.frames_submitted % interval != 0 {
            return;
        }

        let cursor = self.source.cursor();
        info!(
            "{}: {} frames submitted, {} source frames, loop {}, {:.2}s",
            self.id,
            self.report.frames_submitted,
            cursor.frames,
            cursor.loops,
            cursor.elapsed.as_secs_f64()
        );
    }

    fn drain<D: EncoderDevice + ?Sized>(
        &mut self,
        device: &mut D,
        writer: Option<&mut TrackWriter>,
        stats: &mut Statistics,
    ) -> Result<(), SessionError> {
        let timeout = match self.state {
            ExchangeState::Draining => self.options.drain_timeout,
            _ => self.options.output_timeout,
        };

        let poll = match device.dequeue_output(timeout) {
            Ok(poll) => poll,
            Err(e) if e.is_transient() => {
                debug!("{}: dequeue output: {e}", self.id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match poll {
            OutputPoll::TryAgainLater => {
                if self.state == ExchangeState::Draining {
                    debug!("{}: device has no pending output", self.id);
                    self.state = ExchangeState::Done;
                }
            }
            OutputPoll::FormatChanged => {
                let format = device.output_format()?;
                info!("{}: output format {format}", self.id);
                // parameter sets arrive with the config unit, which opens the track
                if let Some(writer) = writer
                    && !device.emits_codec_config()
                {
                    writer.open_track(&format)?;
                }
                stats.set_output_format(format);
            }
            OutputPoll::Unit(unit) => {
                let claim = OutputClaim::new(device, unit);
                self.handle_unit(&claim, unit, writer, stats)?;

                if let Err(e) = claim.release() {
                    if !e.is_transient() {
                        return Err(e.into());
                    }
                    warn!("{}: release output {}: {e}", self.id, unit.index);
                }
            }
        }

        Ok(())
    }

    fn handle_unit<D: EncoderDevice + ?Sized>(
        &mut self,
        claim: &OutputClaim<'_, D>,
        unit: OutputUnit,
        writer: Option<&mut TrackWriter>,
        stats: &mut Statistics,
    ) -> Result<(), SessionError> {
        match unit.kind() {
            OutputKind::CodecConfig => {
                self.report.config_units += 1;

                let mut format = claim.device().output_format()?;
                if format.codec_config.is_empty() {
                    format.codec_config = claim.payload()?.to_vec();
                }
                debug!(
                    "{}: codec config of {} bytes for {format}",
                    self.id, unit.size
                );

                if let Some(writer) = writer {
                    writer.open_track(&format)?;
                }
                stats.set_output_format(format);
            }
            OutputKind::EndOfStream => {
                if !self.state.input_done() {
                    warn!("{}: device ended the stream before input did", self.id);
                }
                debug!("{}: end of stream from device", self.id);
                self.report.eos_received = true;
                self.state = ExchangeState::Done;
            }
            OutputKind::Payload => {
                self.report.payload_units += 1;
                stats.record(unit.presentation_time_us, unit.size, unit.is_key_frame());

                if let Some(writer) = writer {
                    if writer.track().is_none() {
                        warn!(
                            "{}: payload before any format, adding track from current format",
                            self.id
                        );
                        writer.open_track(&claim.device().output_format()?)?;
                    }
                    writer.write(claim.payload()?, unit.presentation_time_us, unit.flags)?;
                }
            }
        }

        Ok(())
    }
}

fn pace(clock: Instant, presentation_time_us: i64) {
    let due = clock + Duration::from_micros(presentation_time_us.max(0) as u64);
    let wait = due.saturating_duration_since(Instant::now());
    if !wait.is_zero() {
        thread::sleep(wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_polled_until_done() {
        assert!(!ExchangeState::Feeding.input_done());
        assert!(!ExchangeState::Feeding.output_done());
        assert!(ExchangeState::Draining.input_done());
        assert!(!ExchangeState::Draining.output_done());
        assert!(ExchangeState::Done.input_done());
        assert!(ExchangeState::Done.output_done());
    }
}
