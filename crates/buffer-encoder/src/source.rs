use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::config::InputConfig;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Could not open file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} holds no complete frame")]
    Empty(PathBuf),
    #[error("Read: {0}")]
    Read(#[from] io::Error),
    #[error("A {capacity} byte buffer cannot hold a {frame_size} byte frame")]
    BufferTooSmall { capacity: usize, frame_size: usize },
    #[error("Source is closed")]
    Closed,
}

/// When reading should stop. Without a frame or time ceiling the source is
/// played exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TerminationPolicy {
    pub playout_frames: Option<u64>,
    pub stop_time: Option<Duration>,
}

impl TerminationPolicy {
    pub fn from_input(input: &InputConfig) -> Self {
        Self {
            playout_frames: input.playout_frames.filter(|frames| *frames > 0),
            stop_time: input
                .stoptime_sec
                .filter(|secs| secs.is_finite() && *secs > 0.0)
                .map(Duration::from_secs_f64),
        }
    }

    pub fn is_done(&self, frames: u64, elapsed: Duration, after_wrap: bool) -> bool {
        if self.playout_frames.is_none() && self.stop_time.is_none() {
            return after_wrap;
        }

        self.playout_frames.is_some_and(|limit| frames >= limit)
            || self.stop_time.is_some_and(|limit| elapsed >= limit)
    }
}

/// Read position across all passes over the source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameCursor {
    /// Source frames consumed so far, dropped ones included.
    pub frames: u64,
    /// Pass over the source currently being read, starting at 1.
    pub loops: u32,
    /// Source time of the frames consumed so far.
    pub elapsed: Duration,
}

impl Default for FrameCursor {
    fn default() -> Self {
        Self {
            frames: 0,
            loops: 1,
            elapsed: Duration::ZERO,
        }
    }
}

impl FrameCursor {
    pub fn reopens(&self) -> u32 {
        self.loops - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Filled(usize),
    Exhausted,
    /// Nothing could be read right now. Retry on a later iteration.
    Unavailable,
}

enum ReadOutcome {
    Frame,
    End,
    WouldBlock,
}

/// Successive fixed-size raw pictures from a file, re-read from the start
/// whenever the termination policy asks for more than one pass.
pub struct FrameSource {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    frame_size: usize,
    frames_per_pass: u64,
    frame_duration_us: f64,
    policy: TerminationPolicy,
    cursor: FrameCursor,
    pending: bool,
}

impl FrameSource {
    pub fn open(
        path: impl AsRef<Path>,
        frame_size: usize,
        frame_rate: f32,
        policy: TerminationPolicy,
    ) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let (reader, len) = open_reader(&path)?;

        let frames_per_pass = if frame_size == 0 {
            0
        } else {
            len / frame_size as u64
        };
        if frames_per_pass == 0 {
            return Err(SourceError::Empty(path));
        }
        if len % frame_size as u64 != 0 {
            warn!(
                "{} has {} trailing bytes that do not form a frame",
                path.display(),
                len % frame_size as u64
            );
        }

        debug!(
            "Opened {} ({} frames of {} bytes)",
            path.display(),
            frames_per_pass,
            frame_size
        );

        Ok(Self {
            path,
            reader: Some(reader),
            frame_size,
            frames_per_pass,
            frame_duration_us: 1_000_000.0 / f64::from(frame_rate),
            policy,
            cursor: FrameCursor::default(),
            pending: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn frames_per_pass(&self) -> u64 {
        self.frames_per_pass
    }

    pub fn cursor(&self) -> &FrameCursor {
        &self.cursor
    }

    pub fn policy(&self) -> &TerminationPolicy {
        &self.policy
    }

    pub fn presentation_time_us(&self, ordinal: u64) -> i64 {
        (ordinal as f64 * self.frame_duration_us).round() as i64
    }

    pub fn elapsed_at(&self, ordinal: u64) -> Duration {
        Duration::from_micros(self.presentation_time_us(ordinal).max(0) as u64)
    }

    pub fn is_done(&self, frame_index: u64, elapsed: Duration, after_wrap: bool) -> bool {
        self.policy.is_done(frame_index, elapsed, after_wrap)
    }

    /// Whether reading must stop before the source frame at `ordinal`.
    pub fn is_done_at(&self, ordinal: u64) -> bool {
        let after_wrap = ordinal > 0 && ordinal % self.frames_per_pass == 0;
        self.is_done(ordinal, self.elapsed_at(ordinal), after_wrap)
    }

    /// Reads the next frame into `buffer`. Reaching the end of the file
    /// reopens it unless the termination policy says the session is done.
    ///
    /// The cursor only moves on [`FrameSource::commit`].
    pub fn fill_frame(&mut self, buffer: &mut [u8]) -> Result<FillOutcome, SourceError> {
        if buffer.len() < self.frame_size {
            return Err(SourceError::BufferTooSmall {
                capacity: buffer.len(),
                frame_size: self.frame_size,
            });
        }
        let buffer = &mut buffer[..self.frame_size];

        match self.read_frame(buffer)? {
            ReadOutcome::Frame => {
                self.pending = true;
                return Ok(FillOutcome::Filled(self.frame_size));
            }
            ReadOutcome::WouldBlock => return Ok(FillOutcome::Unavailable),
            ReadOutcome::End => {}
        }

        let frames = self.cursor.frames;
        if self.is_done(frames, self.elapsed_at(frames), true) {
            self.pending = false;
            return Ok(FillOutcome::Exhausted);
        }

        self.wrap()?;

        match self.read_frame(buffer)? {
            ReadOutcome::Frame => {
                self.pending = true;
                Ok(FillOutcome::Filled(self.frame_size))
            }
            ReadOutcome::WouldBlock => Ok(FillOutcome::Unavailable),
            ReadOutcome::End => Err(SourceError::Empty(self.path.clone())),
        }
    }

    /// Counts the last filled frame as consumed.
    pub fn commit(&mut self) {
        if !self.pending {
            return;
        }
        self.pending = false;
        self.cursor.frames += 1;
        self.cursor.elapsed = self.elapsed_at(self.cursor.frames);
    }

    /// Steps back over the last filled frame so the next fill reads it again.
    pub fn unread(&mut self) -> Result<(), SourceError> {
        if !self.pending {
            return Ok(());
        }
        let reader = self.reader.as_mut().ok_or(SourceError::Closed)?;
        reader.seek_relative(-(self.frame_size as i64))?;
        self.pending = false;
        Ok(())
    }

    pub fn close(&mut self) {
        if self.reader.take().is_some() {
            debug!("Closed {}", self.path.display());
        }
        self.pending = false;
    }

    fn wrap(&mut self) -> Result<(), SourceError> {
        self.close();
        let (reader, _) = open_reader(&self.path)?;
        self.reader = Some(reader);
        self.cursor.loops += 1;

        info!(
            "Reopened {} for pass {} after {} frames",
            self.path.display(),
            self.cursor.loops,
            self.cursor.frames
        );

        Ok(())
    }

    fn read_frame(&mut self, buffer: &mut [u8]) -> Result<ReadOutcome, SourceError> {
        let reader = self.reader.as_mut().ok_or(SourceError::Closed)?;

        let mut filled = 0;
        while filled < buffer.len() {
            match reader.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // the partial frame is read again on the next attempt
                    reader.seek_relative(-(filled as i64))?;
                    return Ok(ReadOutcome::WouldBlock);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if filled == buffer.len() {
            return Ok(ReadOutcome::Frame);
        }
        if filled != 0 {
            debug!("Ignoring partial frame of {filled} bytes at end of source");
        }
        Ok(ReadOutcome::End)
    }
}

fn open_reader(path: &Path) -> Result<(BufReader<File>, u64), SourceError> {
    let open_error = |source| SourceError::Open {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(open_error)?;
    let len = file.metadata().map_err(open_error)?.len();

    Ok((BufReader::new(file), len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn source_file(frames: u8, frame_size: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..frames {
            file.write_all(&vec![i; frame_size]).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn plays_once_without_policy() {
        let file = source_file(3, 6);
        let mut source =
            FrameSource::open(file.path(), 6, 30.0, TerminationPolicy::default()).unwrap();
        let mut buf = vec![0u8; 6];

        for expected in 0..3u8 {
            assert_eq!(source.fill_frame(&mut buf).unwrap(), FillOutcome::Filled(6));
            assert_eq!(buf[0], expected);
            source.commit();
        }

        assert_eq!(source.fill_frame(&mut buf).unwrap(), FillOutcome::Exhausted);
        assert_eq!(source.cursor().frames, 3);
        assert_eq!(source.cursor().loops, 1);
        assert!(source.is_done_at(3));
    }

    #[test]
    fn wraps_until_frame_ceiling() {
        let file = source_file(4, 6);
        let policy = TerminationPolicy {
            playout_frames: Some(10),
            stop_time: None,
        };
        let mut source = FrameSource::open(file.path(), 6, 30.0, policy).unwrap();
        let mut buf = vec![0u8; 6];

        let mut seen = Vec::new();
        while !source.is_done_at(source.cursor().frames) {
            assert_eq!(source.fill_frame(&mut buf).unwrap(), FillOutcome::Filled(6));
            seen.push(buf[0]);
            source.commit();
        }

        assert_eq!(seen, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1]);
        assert_eq!(source.cursor().frames, 10);
        assert_eq!(source.cursor().reopens(), 2);
    }

    #[test]
    fn unread_rereads_the_same_frame() {
        let file = source_file(2, 4);
        let policy = TerminationPolicy {
            playout_frames: Some(4),
            stop_time: None,
        };
        let mut source = FrameSource::open(file.path(), 4, 30.0, policy).unwrap();
        let mut buf = vec![0u8; 4];

        source.fill_frame(&mut buf).unwrap();
        source.commit();
        source.fill_frame(&mut buf).unwrap();
        source.commit();

        // first frame of the second pass, rejected once
        source.fill_frame(&mut buf).unwrap();
        assert_eq!(buf[0], 0);
        source.unread().unwrap();
        assert_eq!(source.cursor().frames, 2);

        source.fill_frame(&mut buf).unwrap();
        assert_eq!(buf[0], 0);
        source.commit();
        assert_eq!(source.cursor().frames, 3);
        assert_eq!(source.cursor().loops, 2);
    }

    #[test]
    fn time_ceiling_uses_source_clock() {
        let policy = TerminationPolicy {
            playout_frames: None,
            stop_time: Some(Duration::from_secs(1)),
        };
        assert!(!policy.is_done(29, Duration::from_micros(966_667), true));
        assert!(policy.is_done(30, Duration::from_secs(1), false));
    }

    #[test]
    fn open_missing_file_fails() {
        let err = FrameSource::open(
            "/definitely/not/here.yuv",
            6,
            30.0,
            TerminationPolicy::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, SourceError::Open { .. }));
    }

    #[test]
    fn open_short_file_fails() {
        let file = source_file(1, 3);
        let err = FrameSource::open(file.path(), 6, 30.0, TerminationPolicy::default())
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::Empty(_)));
    }
}
