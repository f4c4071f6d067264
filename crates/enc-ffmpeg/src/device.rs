use std::{collections::VecDeque, time::Duration};

use encbench_buffer_encoder::{
    BufferFlags, DeviceError, DeviceParameters, EncoderDevice, EncoderFormat, InputSlot,
    OutputFormat, OutputPoll, OutputUnit, RawPixelLayout,
};
use ffmpeg::{
    Dictionary, Packet, Rational,
    codec::{codec::Codec, context, encoder},
    error::EAGAIN,
    format::Pixel,
    frame, picture,
    threading::Config,
};
use tracing::{debug, info, warn};

use crate::codec::CodecFamily;

const TIME_BASE: Rational = Rational(1, 1_000_000);
const INPUT_SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Uninitialized,
    Configured,
    Running,
    Stopped,
    Released,
}

struct EncodedUnit {
    data: Vec<u8>,
    presentation_time_us: i64,
    key_frame: bool,
}

/// A libavcodec encoder behind the buffer-queue interface. Input slots are
/// plain byte buffers copied into an `AVFrame` on submission, and every packet
/// the encoder returns becomes one output unit.
pub struct FfmpegDevice {
    codec: Codec,
    family: &'static CodecFamily,
    state: DeviceState,
    encoder: Option<encoder::Video>,
    format: Option<EncoderFormat>,
    frame: Option<frame::Video>,
    packet: Packet,
    inputs: Vec<(bool, Vec<u8>)>,
    outputs: Vec<Option<Vec<u8>>>,
    ready: VecDeque<EncodedUnit>,
    extradata: Vec<u8>,
    bitrate: Option<u64>,
    force_key_frame: bool,
    config_sent: bool,
    eof_sent: bool,
    flushed: bool,
    eos_sent: bool,
}

// libavcodec contexts are only touched from the thread driving the session.
unsafe impl Send for FfmpegDevice {}

impl FfmpegDevice {
    pub(crate) fn new(codec: Codec, family: &'static CodecFamily) -> Self {
        Self {
            codec,
            family,
            state: DeviceState::Uninitialized,
            encoder: None,
            format: None,
            frame: None,
            packet: Packet::empty(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            ready: VecDeque::new(),
            extradata: Vec::new(),
            bitrate: None,
            force_key_frame: false,
            config_sent: false,
            eof_sent: false,
            flushed: false,
            eos_sent: false,
        }
    }

    fn require(&self, state: DeviceState, op: &str) -> Result<(), DeviceError> {
        if self.state != state {
            return Err(DeviceError::InvalidState(format!(
                "{op} while {:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn encoder(&mut self) -> Result<&mut encoder::Video, DeviceError> {
        self.encoder
            .as_mut()
            .ok_or_else(|| DeviceError::InvalidState("encoder is not open".into()))
    }

    fn receive_packets(&mut self) -> Result<(), DeviceError> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };

        loop {
            match encoder.receive_packet(&mut self.packet) {
                Ok(()) => {
                    let Some(data) = self.packet.data() else {
                        continue;
                    };
                    self.ready.push_back(EncodedUnit {
                        data: data.to_vec(),
                        presentation_time_us: self.packet.pts().unwrap_or_default(),
                        key_frame: self.packet.is_key(),
                    });
                }
                Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => break,
                Err(ffmpeg::Error::Eof) => {
                    self.flushed = true;
                    break;
                }
                Err(e) => return Err(DeviceError::Encode(e.to_string())),
            }
        }

        Ok(())
    }

    fn lend_output(&mut self, data: Vec<u8>) -> usize {
        match self.outputs.iter().position(Option::is_none) {
            Some(index) => {
                self.outputs[index] = Some(data);
                index
            }
            None => {
                self.outputs.push(Some(data));
                self.outputs.len() - 1
            }
        }
    }

    fn unit(&mut self, data: Vec<u8>, presentation_time_us: i64, flags: BufferFlags) -> OutputPoll {
        let size = data.len();
        let index = self.lend_output(data);
        OutputPoll::Unit(OutputUnit {
            index,
            offset: 0,
            size,
            presentation_time_us,
            flags,
        })
    }
}

fn pixel_for(layout: RawPixelLayout) -> Pixel {
    match layout {
        RawPixelLayout::Yuv420p => Pixel::YUV420P,
        RawPixelLayout::Nv12 => Pixel::NV12,
        RawPixelLayout::Nv21 => Pixel::NV21,
    }
}

fn encoder_options(name: &str) -> Dictionary<'static> {
    let mut options = Dictionary::new();

    match name {
        "libx264" | "libx265" => {
            options.set("preset", "ultrafast");
            options.set("tune", "zerolatency");
        }
        "libvpx" | "libvpx-vp9" => {
            options.set("deadline", "realtime");
            options.set("cpu-used", "8");
        }
        "libsvtav1" => {
            options.set("preset", "12");
        }
        "h264_nvenc" | "hevc_nvenc" | "av1_nvenc" => {
            options.set("preset", "p1");
            options.set("tune", "ll");
        }
        "h264_mf" | "hevc_mf" => {
            options.set("hw_encoding", "true");
        }
        "h264_videotoolbox" | "hevc_videotoolbox" => {
            options.set("realtime", "true");
        }
        _ => {}
    }

    options
}

/// Copies one packed raw picture into the planes of `frame`.
fn copy_planes(frame: &mut frame::Video, data: &[u8], width: usize, height: usize) {
    let chroma_height = height.div_ceil(2);
    let planes: &[(usize, usize)] = match frame.format() {
        Pixel::NV12 | Pixel::NV21 => &[(width, height), (width, chroma_height)],
        _ => &[
            (width, height),
            (width.div_ceil(2), chroma_height),
            (width.div_ceil(2), chroma_height),
        ],
    };

    let mut offset = 0;
    for (plane, &(row_len, rows)) in planes.iter().enumerate() {
        let stride = frame.stride(plane);
        let dst = frame.data_mut(plane);
        for row in 0..rows {
            let Some(src) = data.get(offset..offset + row_len) else {
                return;
            };
            dst[row * stride..row * stride + row_len].copy_from_slice(src);
            offset += row_len;
        }
    }
}

impl EncoderDevice for FfmpegDevice {
    fn name(&self) -> &str {
        self.codec.name()
    }

    fn configure(&mut self, format: &EncoderFormat) -> Result<(), DeviceError> {
        self.require(DeviceState::Uninitialized, "configure")
            .map_err(|e| DeviceError::Configure(e.to_string()))?;

        let configure_error = |e: ffmpeg::Error| DeviceError::Configure(format!("{e:?}"));
        let pixel = pixel_for(format.pixel_layout);

        let supported = self
            .codec
            .video()
            .ok()
            .and_then(|video| video.formats())
            .is_none_or(|mut formats| formats.any(|f| f == pixel));
        if !supported {
            return Err(DeviceError::Configure(format!(
                "{} does not accept {}",
                self.codec.name(),
                format.pixel_layout.as_str()
            )));
        }

        let mut encoder_ctx = context::Context::new_with_codec(self.codec);
        encoder_ctx.set_threading(Config::count(4));
        let mut video = encoder_ctx.encoder().video().map_err(configure_error)?;

        let (width, height) = (format.resolution.width, format.resolution.height);
        video.set_width(width);
        video.set_height(height);
        video.set_format(pixel);
        video.set_time_base(TIME_BASE);
        video.set_frame_rate(Some(Rational::from(f64::from(format.frame_rate))));
        video.set_max_b_frames(0);

        if let Some(bitrate) = format.bitrate {
            video.set_bit_rate(bitrate as usize);
            video.set_max_bit_rate(bitrate as usize);
        }
        if let Some(seconds) = format.i_frame_interval {
            let gop = (seconds as f32 * format.frame_rate).round().max(1.0) as u32;
            video.set_gop(gop);
        }
        if self.family.codec_config {
            video.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }

        let encoder = video
            .open_with(encoder_options(self.codec.name()))
            .map_err(configure_error)?;

        self.extradata = unsafe {
            let ctx = encoder.as_ptr();
            if (*ctx).extradata.is_null() || (*ctx).extradata_size <= 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts((*ctx).extradata, (*ctx).extradata_size as usize)
                    .to_vec()
            }
        };

        let raw = format.resolution.raw_frame_size();
        self.inputs = vec![(false, vec![0; raw]); INPUT_SLOTS];
        self.frame = Some(frame::Video::new(pixel, width, height));
        self.encoder = Some(encoder);
        self.bitrate = format.bitrate;
        self.format = Some(format.clone());
        self.state = DeviceState::Configured;

        info!(
            "Opened {} for {format}, {} bytes of codec config",
            self.codec.name(),
            self.extradata.len()
        );
        Ok(())
    }

    fn output_format(&self) -> Result<OutputFormat, DeviceError> {
        let format = self
            .format
            .as_ref()
            .ok_or_else(|| DeviceError::InvalidState("not configured".into()))?;

        Ok(OutputFormat {
            mime: self.family.mime.to_string(),
            width: format.resolution.width,
            height: format.resolution.height,
            frame_rate: format.frame_rate,
            bitrate: self.bitrate,
            codec_config: self.extradata.clone(),
        })
    }

    fn emits_codec_config(&self) -> bool {
        self.family.codec_config
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.require(DeviceState::Configured, "start")
            .map_err(|e| DeviceError::Start(e.to_string()))?;
        self.state = DeviceState::Running;
        Ok(())
    }

    fn dequeue_input(&mut self, _timeout: Duration) -> Result<Option<InputSlot>, DeviceError> {
        self.require(DeviceState::Running, "dequeue input")?;
        if self.eof_sent {
            return Ok(None);
        }

        let Some(index) = self.inputs.iter().position(|(lent, _)| !lent) else {
            return Ok(None);
        };
        self.inputs[index].0 = true;

        Ok(Some(InputSlot {
            index,
            capacity: self.inputs[index].1.len(),
        }))
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], DeviceError> {
        match self.inputs.get_mut(index) {
            Some((true, buffer)) => Ok(buffer.as_mut_slice()),
            _ => Err(DeviceError::UnknownBuffer(index)),
        }
    }

    fn queue_input(
        &mut self,
        index: usize,
        len: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), DeviceError> {
        self.require(DeviceState::Running, "queue input")?;
        if !matches!(self.inputs.get(index), Some((true, _))) {
            return Err(DeviceError::UnknownBuffer(index));
        }
        if self.eof_sent {
            return Err(DeviceError::InvalidState("input after end of stream".into()));
        }

        if len > 0 {
            let (width, height) = self
                .format
                .as_ref()
                .map(|f| (f.resolution.width as usize, f.resolution.height as usize))
                .unwrap_or_default();
            let force_key_frame = std::mem::take(&mut self.force_key_frame);

            let frame = self
                .frame
                .as_mut()
                .ok_or_else(|| DeviceError::InvalidState("no frame allocated".into()))?;
            copy_planes(frame, &self.inputs[index].1[..len], width, height);
            frame.set_pts(Some(presentation_time_us));
            frame.set_kind(if force_key_frame {
                picture::Type::I
            } else {
                picture::Type::None
            });

            let Some(encoder) = self.encoder.as_mut() else {
                return Err(DeviceError::InvalidState("encoder is not open".into()));
            };
            match encoder.send_frame(frame) {
                Ok(()) => {}
                Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => {
                    self.force_key_frame |= force_key_frame;
                    self.receive_packets()?;
                    return Err(DeviceError::Busy("encoder input is full".into()));
                }
                Err(e) => return Err(DeviceError::Encode(e.to_string())),
            }
        }

        self.inputs[index].0 = false;

        if flags.contains(BufferFlags::END_OF_STREAM) {
            debug!("{}: flushing at {presentation_time_us}us", self.codec.name());
            self.encoder()?
                .send_eof()
                .map_err(|e| DeviceError::Encode(e.to_string()))?;
            self.eof_sent = true;
        }

        self.receive_packets()
    }

    fn cancel_input(&mut self, index: usize) {
        if let Some((lent @ true, _)) = self.inputs.get_mut(index) {
            *lent = false;
        }
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<OutputPoll, DeviceError> {
        self.require(DeviceState::Running, "dequeue output")?;

        if self.ready.is_empty() && !self.flushed {
            self.receive_packets()?;
        }

        if self.family.codec_config && !self.config_sent && !self.ready.is_empty() {
            self.config_sent = true;
            if !self.extradata.is_empty() {
                let config = self.extradata.clone();
                return Ok(self.unit(config, 0, BufferFlags::CODEC_CONFIG));
            }
            warn!("{} produced no codec config", self.codec.name());
        }

        if let Some(encoded) = self.ready.pop_front() {
            let flags = if encoded.key_frame {
                BufferFlags::KEY_FRAME
            } else {
                BufferFlags::empty()
            };
            return Ok(self.unit(encoded.data, encoded.presentation_time_us, flags));
        }

        if self.flushed && !self.eos_sent {
            self.eos_sent = true;
            return Ok(self.unit(Vec::new(), 0, BufferFlags::END_OF_STREAM));
        }

        Ok(OutputPoll::TryAgainLater)
    }

    fn output_buffer(&self, index: usize) -> Result<&[u8], DeviceError> {
        match self.outputs.get(index) {
            Some(Some(data)) => Ok(data.as_slice()),
            _ => Err(DeviceError::UnknownBuffer(index)),
        }
    }

    fn release_output(&mut self, index: usize) -> Result<(), DeviceError> {
        match self.outputs.get_mut(index) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(DeviceError::UnknownBuffer(index)),
        }
    }

    fn set_parameters(&mut self, params: &DeviceParameters) -> Result<(), DeviceError> {
        self.require(DeviceState::Running, "set parameters")?;

        if params.request_sync {
            self.force_key_frame = true;
        }
        if let Some(bitrate) = params.bitrate {
            let encoder = self.encoder()?;
            unsafe {
                let ctx = encoder.as_mut_ptr();
                (*ctx).bit_rate = bitrate as i64;
                (*ctx).rc_max_rate = bitrate as i64;
            }
            self.bitrate = Some(bitrate);
            debug!("{}: bitrate now {bitrate}", self.codec.name());
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        match self.state {
            DeviceState::Running | DeviceState::Configured => {
                if !self.eof_sent
                    && let Some(encoder) = self.encoder.as_mut()
                    && let Err(e) = encoder.send_eof()
                {
                    debug!("{}: flush on stop: {e}", self.codec.name());
                }
                self.eof_sent = true;
                self.ready.clear();
                self.state = DeviceState::Stopped;
                Ok(())
            }
            DeviceState::Stopped => Ok(()),
            state => Err(DeviceError::Stop(format!("stop while {state:?}"))),
        }
    }

    fn release(&mut self) {
        if self.state == DeviceState::Released {
            return;
        }
        self.encoder = None;
        self.frame = None;
        self.inputs.clear();
        self.outputs.clear();
        self.ready.clear();
        self.state = DeviceState::Released;
        debug!("Released {}", self.codec.name());
    }
}
