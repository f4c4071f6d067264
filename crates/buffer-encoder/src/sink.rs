use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{debug, trace};

use crate::device::{BufferFlags, OutputFormat};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Sink already finalized")]
    AlreadyFinalized,
    #[error("Sink not started")]
    NotStarted,
    #[error("Sink already started")]
    AlreadyStarted,
    #[error("Unknown track {0:?}")]
    UnknownTrack(TrackHandle),
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    #[error("Muxer: {0}")]
    Muxer(String),
}

impl SinkError {
    /// Errors a second teardown path can run into after the first one
    /// already closed the sink.
    pub fn is_benign_teardown(&self) -> bool {
        matches!(self, Self::AlreadyFinalized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackHandle(pub usize);

/// Receives the negotiated output format once, then every compressed unit.
pub trait ContainerSink {
    fn initialize(&mut self, format: &OutputFormat) -> Result<TrackHandle, SinkError>;

    fn start(&mut self) -> Result<(), SinkError>;

    fn write_unit(
        &mut self,
        track: TrackHandle,
        payload: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), SinkError>;

    fn finalize(&mut self) -> Result<(), SinkError>;
}

impl<S: ContainerSink + ?Sized> ContainerSink for Box<S> {
    fn initialize(&mut self, format: &OutputFormat) -> Result<TrackHandle, SinkError> {
        (**self).initialize(format)
    }

    fn start(&mut self) -> Result<(), SinkError> {
        (**self).start()
    }

    fn write_unit(
        &mut self,
        track: TrackHandle,
        payload: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), SinkError> {
        (**self).write_unit(track, payload, presentation_time_us, flags)
    }

    fn finalize(&mut self) -> Result<(), SinkError> {
        (**self).finalize()
    }
}

/// Lets the creator of a sink inspect it after a session has written into it.
impl<S: ContainerSink> ContainerSink for Arc<Mutex<S>> {
    fn initialize(&mut self, format: &OutputFormat) -> Result<TrackHandle, SinkError> {
        lock(self)?.initialize(format)
    }

    fn start(&mut self) -> Result<(), SinkError> {
        lock(self)?.start()
    }

    fn write_unit(
        &mut self,
        track: TrackHandle,
        payload: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), SinkError> {
        lock(self)?.write_unit(track, payload, presentation_time_us, flags)
    }

    fn finalize(&mut self) -> Result<(), SinkError> {
        lock(self)?.finalize()
    }
}

fn lock<S>(sink: &Mutex<S>) -> Result<MutexGuard<'_, S>, SinkError> {
    sink.lock()
        .map_err(|_| SinkError::Muxer("sink lock poisoned".into()))
}

/// A sink plus the single video track a session writes into it.
pub struct TrackWriter {
    sink: Box<dyn ContainerSink + Send>,
    track: Option<TrackHandle>,
    finalized: bool,
}

impl TrackWriter {
    pub fn new(sink: Box<dyn ContainerSink + Send>) -> Self {
        Self {
            sink,
            track: None,
            finalized: false,
        }
    }

    pub fn track(&self) -> Option<TrackHandle> {
        self.track
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Adds the track and starts the sink on first call, later calls return
    /// the existing track.
    pub fn open_track(&mut self, format: &OutputFormat) -> Result<TrackHandle, SinkError> {
        if let Some(track) = self.track {
            debug!("Track already initialized, ignoring format {format}");
            return Ok(track);
        }

        let track = self.sink.initialize(format)?;
        self.sink.start()?;
        debug!("Initialized track {track:?} with {format}");
        self.track = Some(track);
        Ok(track)
    }

    pub fn write(
        &mut self,
        payload: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), SinkError> {
        let track = self.track.ok_or(SinkError::NotStarted)?;
        self.sink
            .write_unit(track, payload, presentation_time_us, flags)
    }

    /// Finalizes the sink. Finding it already finalized is not an error.
    pub fn finalize(&mut self) -> Result<(), SinkError> {
        if self.finalized {
            debug!("Sink already finalized");
            return Ok(());
        }
        self.finalized = true;

        match self.sink.finalize() {
            Err(e) if e.is_benign_teardown() => {
                debug!("Ignoring sink teardown error: {e}");
                Ok(())
            }
            result => result,
        }
    }
}

/// Writes the bare elementary stream: codec config first, then every payload
/// in arrival order.
pub struct RawStreamSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    config: Vec<u8>,
    track: Option<TrackHandle>,
    started: bool,
    bytes_written: u64,
}

impl RawStreamSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = File::create(&path)?;
        debug!("Writing elementary stream to {}", path.display());

        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            config: Vec::new(),
            track: None,
            started: false,
            bytes_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, SinkError> {
        self.writer.as_mut().ok_or(SinkError::AlreadyFinalized)
    }
}

impl ContainerSink for RawStreamSink {
    fn initialize(&mut self, format: &OutputFormat) -> Result<TrackHandle, SinkError> {
        if self.writer.is_none() {
            return Err(SinkError::AlreadyFinalized);
        }
        if self.started {
            return Err(SinkError::AlreadyStarted);
        }

        self.config = format.codec_config.clone();
        let track = *self.track.get_or_insert(TrackHandle(0));
        Ok(track)
    }

    fn start(&mut self) -> Result<(), SinkError> {
        if self.started {
            return Err(SinkError::AlreadyStarted);
        }

        let config = std::mem::take(&mut self.config);
        self.writer()?.write_all(&config)?;
        self.bytes_written += config.len() as u64;
        self.started = true;
        Ok(())
    }

    fn write_unit(
        &mut self,
        track: TrackHandle,
        payload: &[u8],
        presentation_time_us: i64,
        _flags: BufferFlags,
    ) -> Result<(), SinkError> {
        if self.track != Some(track) {
            return Err(SinkError::UnknownTrack(track));
        }
        if !self.started {
            return Err(SinkError::NotStarted);
        }

        self.writer()?.write_all(payload)?;
        self.bytes_written += payload.len() as u64;
        trace!("Wrote {} bytes at {presentation_time_us}us", payload.len());
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), SinkError> {
        let mut writer = self.writer.take().ok_or(SinkError::AlreadyFinalized)?;
        writer.flush()?;
        debug!(
            "Finished {} ({} bytes)",
            self.path.display(),
            self.bytes_written
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenUnit {
    pub track: TrackHandle,
    pub payload: Vec<u8>,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

/// Keeps everything it is given. Used where no file should be produced and
/// to inspect what a session wrote.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub format: Option<OutputFormat>,
    pub initializations: usize,
    pub started: bool,
    pub finalizations: usize,
    pub units: Vec<WrittenUnit>,
    /// Number of upcoming `initialize` calls to fail.
    pub rejected_initializations: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalizations > 0
    }
}

impl ContainerSink for MemorySink {
    fn initialize(&mut self, format: &OutputFormat) -> Result<TrackHandle, SinkError> {
        if self.is_finalized() {
            return Err(SinkError::AlreadyFinalized);
        }
        if self.started {
            return Err(SinkError::AlreadyStarted);
        }
        if self.rejected_initializations > 0 {
            self.rejected_initializations -= 1;
            return Err(SinkError::Muxer("track rejected".into()));
        }

        self.format = Some(format.clone());
        self.initializations += 1;
        Ok(TrackHandle(0))
    }

    fn start(&mut self) -> Result<(), SinkError> {
        if self.started {
            return Err(SinkError::AlreadyStarted);
        }
        if self.format.is_none() {
            return Err(SinkError::Muxer("no track added".into()));
        }
        self.started = true;
        Ok(())
    }

    fn write_unit(
        &mut self,
        track: TrackHandle,
        payload: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), SinkError> {
        if self.is_finalized() {
            return Err(SinkError::AlreadyFinalized);
        }
        if !self.started {
            return Err(SinkError::NotStarted);
        }
        if track != TrackHandle(0) {
            return Err(SinkError::UnknownTrack(track));
        }

        self.units.push(WrittenUnit {
            track,
            payload: payload.to_vec(),
            presentation_time_us,
            flags,
        });
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), SinkError> {
        if self.is_finalized() {
            return Err(SinkError::AlreadyFinalized);
        }
        self.finalizations += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format_with_config(config: &[u8]) -> OutputFormat {
        OutputFormat {
            mime: "video/avc".into(),
            width: 16,
            height: 16,
            frame_rate: 30.0,
            codec_config: config.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn raw_stream_writes_config_then_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.264");

        let mut sink = RawStreamSink::create(&path).unwrap();
        let track = sink.initialize(&format_with_config(&[0, 0, 0, 1, 0x67])).unwrap();
        sink.start().unwrap();
        sink.write_unit(track, &[1, 2, 3], 0, BufferFlags::KEY_FRAME)
            .unwrap();
        sink.write_unit(track, &[4], 33_333, BufferFlags::empty())
            .unwrap();
        sink.finalize().unwrap();

        assert_eq!(
            std::fs::read(&path).unwrap(),
            vec![0, 0, 0, 1, 0x67, 1, 2, 3, 4]
        );
        assert_eq!(sink.bytes_written(), 9);
    }

    #[test]
    fn second_finalize_is_benign() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawStreamSink::create(dir.path().join("out.264")).unwrap();
        sink.initialize(&format_with_config(&[])).unwrap();
        sink.start().unwrap();
        sink.finalize().unwrap();

        let err = sink.finalize().unwrap_err();
        assert!(err.is_benign_teardown());
    }

    #[test]
    fn track_writer_opens_track_once() {
        let mut writer = TrackWriter::new(Box::new(MemorySink::new()));
        assert!(writer.write(&[1], 0, BufferFlags::empty()).is_err());

        let first = writer.open_track(&format_with_config(&[9])).unwrap();
        let second = writer.open_track(&format_with_config(&[8])).unwrap();
        assert_eq!(first, second);
        writer.write(&[1], 0, BufferFlags::KEY_FRAME).unwrap();

        writer.finalize().unwrap();
        writer.finalize().unwrap();
        assert!(writer.is_finalized());
    }

    #[test]
    fn write_before_start_is_rejected() {
        let mut sink = MemorySink::new();
        let track = sink.initialize(&format_with_config(&[])).unwrap();
        assert!(matches!(
            sink.write_unit(track, &[1], 0, BufferFlags::empty()),
            Err(SinkError::NotStarted)
        ));

        sink.start().unwrap();
        assert!(matches!(
            sink.write_unit(TrackHandle(3), &[1], 0, BufferFlags::empty()),
            Err(SinkError::UnknownTrack(TrackHandle(3)))
        ));
    }
}
