use std::path::{Path, PathBuf};

use encbench_buffer_encoder::{BufferFlags, ContainerSink, OutputFormat, SinkError, TrackHandle};
use ffmpeg::{Packet, Rational, format, packet};
use tracing::{debug, info, trace};

use crate::codec::family_for_mime;

const TIME_BASE: Rational = Rational(1, 1_000_000);

/// Writes already-compressed units into an mp4 file with a single video
/// stream.
pub struct Mp4Sink {
    path: PathBuf,
    output: format::context::Output,
    stream_index: Option<usize>,
    header_written: bool,
    is_finished: bool,
    frame_count: u64,
}

// the output context is only used from the thread driving the session
unsafe impl Send for Mp4Sink {}

fn muxer_error(e: ffmpeg::Error) -> SinkError {
    SinkError::Muxer(format!("{e:?}"))
}

impl Mp4Sink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let output = format::output_as(&path, "mp4").map_err(muxer_error)?;
        debug!("Created mp4 output {}", path.display());

        Ok(Self {
            path,
            output,
            stream_index: None,
            header_written: false,
            is_finished: false,
            frame_count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl ContainerSink for Mp4Sink {
    fn initialize(&mut self, format: &OutputFormat) -> Result<TrackHandle, SinkError> {
        if self.is_finished {
            return Err(SinkError::AlreadyFinalized);
        }
        if self.header_written {
            return Err(SinkError::AlreadyStarted);
        }
        if let Some(index) = self.stream_index {
            return Ok(TrackHandle(index));
        }

        let family = family_for_mime(&format.mime)
            .ok_or_else(|| SinkError::Muxer(format!("no mp4 mapping for {}", format.mime)))?;
        let codec = ffmpeg::codec::decoder::find(family.id)
            .ok_or_else(|| SinkError::Muxer(format!("{:?} is not known to libavcodec", family.id)))?;

        let mut stream = self.output.add_stream(codec).map_err(muxer_error)?;
        let stream_index = stream.index();
        stream.set_time_base(TIME_BASE);

        let frame_rate: ffmpeg::ffi::AVRational =
            Rational::from(f64::from(format.frame_rate)).into();

        unsafe {
            let codecpar = (*stream.as_mut_ptr()).codecpar;
            (*codecpar).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*codecpar).codec_id = family.id.into();
            (*codecpar).width = format.width as i32;
            (*codecpar).height = format.height as i32;
            (*codecpar).bit_rate = format.bitrate.unwrap_or_default() as i64;

            if !format.codec_config.is_empty() {
                let size = format.codec_config.len();
                let padding = ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
                let extradata = ffmpeg::ffi::av_mallocz(size + padding) as *mut u8;
                if extradata.is_null() {
                    return Err(SinkError::Muxer("could not allocate codec config".into()));
                }
                std::ptr::copy_nonoverlapping(format.codec_config.as_ptr(), extradata, size);
                (*codecpar).extradata = extradata;
                (*codecpar).extradata_size = size as i32;
            }

            (*stream.as_mut_ptr()).avg_frame_rate = frame_rate;
            (*stream.as_mut_ptr()).r_frame_rate = frame_rate;
        }

        info!(
            "Added {} stream to {}: {}x{} @ {} fps, {} bytes of codec config",
            format.mime,
            self.path.display(),
            format.width,
            format.height,
            format.frame_rate,
            format.codec_config.len()
        );

        self.stream_index = Some(stream_index);
        Ok(TrackHandle(stream_index))
    }

    fn start(&mut self) -> Result<(), SinkError> {
        if self.header_written {
            return Err(SinkError::AlreadyStarted);
        }
        if self.stream_index.is_none() {
            return Err(SinkError::Muxer("no stream added".into()));
        }

        self.output.write_header().map_err(muxer_error)?;
        self.header_written = true;
        Ok(())
    }

    fn write_unit(
        &mut self,
        track: TrackHandle,
        payload: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), SinkError> {
        if self.is_finished {
            return Err(SinkError::AlreadyFinalized);
        }
        if !self.header_written {
            return Err(SinkError::NotStarted);
        }
        if self.stream_index != Some(track.0) {
            return Err(SinkError::UnknownTrack(track));
        }

        let stream_time_base = self
            .output
            .stream(track.0)
            .map(|s| s.time_base())
            .ok_or(SinkError::UnknownTrack(track))?;

        let mut packet = Packet::copy(payload);
        packet.set_stream(track.0);
        packet.set_pts(Some(presentation_time_us));
        packet.set_dts(Some(presentation_time_us));
        if flags.contains(BufferFlags::KEY_FRAME) {
            packet.set_flags(packet::Flags::KEY);
        }
        packet.rescale_ts(TIME_BASE, stream_time_base);
        packet
            .write_interleaved(&mut self.output)
            .map_err(muxer_error)?;

        self.frame_count += 1;
        trace!("Muxed {} bytes at {presentation_time_us}us", payload.len());
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), SinkError> {
        if self.is_finished {
            return Err(SinkError::AlreadyFinalized);
        }
        self.is_finished = true;

        if !self.header_written {
            debug!("{} never started, nothing to finish", self.path.display());
            return Ok(());
        }

        info!(
            "Finishing {}, wrote {} frames",
            self.path.display(),
            self.frame_count
        );
        self.output.write_trailer().map_err(muxer_error)
    }
}

impl Drop for Mp4Sink {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}
