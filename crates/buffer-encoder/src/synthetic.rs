//! An in-process encoder that honours the buffer-queue contract without
//! compressing anything. Output sizes and keyframes follow a simple model so
//! statistics look plausible.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::{debug, trace};

use crate::{
    device::{
        BufferFlags, CodecDescriptor, DeviceError, DeviceParameters, EncoderBackend,
        EncoderDevice, EncoderFormat, InputSlot, OutputFormat, OutputPoll, OutputUnit,
    },
    sink::{ContainerSink, MemorySink, RawStreamSink, SinkError},
};

struct SyntheticCodec {
    name: &'static str,
    mime: &'static str,
    aliases: &'static [&'static str],
    codec_config: bool,
}

const CODECS: &[SyntheticCodec] = &[
    SyntheticCodec {
        name: "synthetic.avc",
        mime: "video/avc",
        aliases: &["avc", "h264"],
        codec_config: true,
    },
    SyntheticCodec {
        name: "synthetic.hevc",
        mime: "video/hevc",
        aliases: &["hevc", "h265"],
        codec_config: true,
    },
    SyntheticCodec {
        name: "synthetic.vp8",
        mime: "video/x-vnd.on2.vp8",
        aliases: &["vp8"],
        codec_config: false,
    },
    SyntheticCodec {
        name: "synthetic.vp9",
        mime: "video/x-vnd.on2.vp9",
        aliases: &["vp9"],
        codec_config: false,
    },
    SyntheticCodec {
        name: "synthetic.av1",
        mime: "video/av01",
        aliases: &["av1"],
        codec_config: false,
    },
];

#[derive(Debug, Clone)]
pub struct SyntheticProfile {
    pub input_slots: usize,
    pub output_slots: usize,
    /// Output polls a frame spends inside the device.
    pub latency: u64,
    /// Frames between keyframes, 0 for only the first.
    pub keyframe_interval: u64,
    /// Raw size divided by this gives the size of a non-key frame.
    pub compression: usize,
    /// Announce the output format with `FormatChanged` before the first unit.
    pub format_change: bool,
    /// Emit an end of stream unit after the last frame. Without it the device
    /// just goes quiet.
    pub end_of_stream_unit: bool,
    /// Every n-th submission attempt is refused once.
    pub reject_every: Option<u64>,
    /// Refuse every submission after this many were accepted.
    pub stall_after: Option<u64>,
}

impl Default for SyntheticProfile {
    fn default() -> Self {
        Self {
            input_slots: 4,
            output_slots: 4,
            latency: 2,
            keyframe_interval: 30,
            compression: 20,
            format_change: false,
            end_of_stream_unit: true,
            reject_every: None,
            stall_after: None,
        }
    }
}

/// What a device went through, for assertions and reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub frames_queued: u64,
    pub eos_inputs: u64,
    pub rejected: u64,
    pub cancelled_inputs: u64,
    pub config_units: u64,
    pub payload_units: u64,
    pub keyframes: u64,
    pub eos_outputs: u64,
    pub sync_requests: u64,
    pub bitrate_changes: u64,
    pub stops: u64,
    pub releases: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Uninitialized,
    Configured,
    Running,
    Stopped,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Lent,
    Queued,
}

#[derive(Debug)]
struct PendingFrame {
    input_slot: usize,
    presentation_time_us: i64,
    raw_len: usize,
    seed: u8,
    key_frame: bool,
    ready_at: u64,
}

pub struct SyntheticDevice {
    name: String,
    mime: String,
    codec_config: bool,
    profile: SyntheticProfile,
    state: DeviceState,
    format: Option<EncoderFormat>,
    inputs: Vec<(Slot, Vec<u8>)>,
    outputs: Vec<(bool, Vec<u8>)>,
    pending: VecDeque<PendingFrame>,
    polls: u64,
    submissions: u64,
    accepted: u64,
    sync_requested: bool,
    bitrate: Option<u64>,
    config_sent: bool,
    format_announced: bool,
    eos_queued: bool,
    eos_sent: bool,
    counters: DeviceCounters,
}

impl SyntheticDevice {
    fn new(codec: &SyntheticCodec, profile: SyntheticProfile) -> Self {
        Self {
            name: codec.name.to_string(),
            mime: codec.mime.to_string(),
            codec_config: codec.codec_config,
            profile,
            state: DeviceState::Uninitialized,
            format: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            pending: VecDeque::new(),
            polls: 0,
            submissions: 0,
            accepted: 0,
            sync_requested: false,
            bitrate: None,
            config_sent: false,
            format_announced: false,
            eos_queued: false,
            eos_sent: false,
            counters: DeviceCounters::default(),
        }
    }

    pub fn counters(&self) -> &DeviceCounters {
        &self.counters
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

    fn parameter_sets(&self) -> Vec<u8> {
        let Some(format) = &self.format else {
            return Vec::new();
        };
        let mut config = vec![0, 0, 0, 1, 0x67];
        config.extend_from_slice(&format.resolution.width.to_be_bytes());
        config.extend_from_slice(&format.resolution.height.to_be_bytes());
        config.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xce]);
        config
    }

    fn free_output(&self) -> Option<usize> {
        self.outputs.iter().position(|(lent, _)| !lent)
    }

    fn lend_output(&mut self, index: usize, payload: Vec<u8>) -> usize {
        let size = payload.len();
        self.outputs[index] = (true, payload);
        size
    }

    fn encoded_frame(&self, frame: &PendingFrame) -> Vec<u8> {
        let compression = self.profile.compression.max(1);
        let mut size = (frame.raw_len / compression).max(8);
        if frame.key_frame {
            size = (size * 4).min(frame.raw_len.max(8));
        }

        let mut payload = Vec::with_capacity(size);
        payload.extend_from_slice(&[0, 0, 0, 1, if frame.key_frame { 0x65 } else { 0x41 }]);
        payload.extend((payload.len()..size).map(|i| frame.seed.wrapping_add(i as u8)));
        payload.truncate(size);
        payload
    }
}

impl EncoderDevice for SyntheticDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, format: &EncoderFormat) -> Result<(), DeviceError> {
        self.require(DeviceState::Uninitialized, "configure")
            .map_err(|e| DeviceError::Configure(e.to_string()))?;

        if self.profile.input_slots == 0 || self.profile.output_slots == 0 {
            return Err(DeviceError::Configure("device has no buffer slots".into()));
        }

        let raw = format.resolution.raw_frame_size();
        self.inputs = vec![(Slot::Free, vec![0; raw]); self.profile.input_slots];
        self.outputs = vec![(false, Vec::new()); self.profile.output_slots];
        self.bitrate = format.bitrate;
        self.format = Some(format.clone());
        self.state = DeviceState::Configured;
        Ok(())
    }

    fn output_format(&self) -> Result<OutputFormat, DeviceError> {
        let format = self
            .format
            .as_ref()
            .ok_or_else(|| DeviceError::InvalidState("not configured".into()))?;

        Ok(OutputFormat {
            mime: self.mime.clone(),
            width: format.resolution.width,
            height: format.resolution.height,
            frame_rate: format.frame_rate,
            bitrate: self.bitrate,
            codec_config: if self.config_sent {
                self.parameter_sets()
            } else {
                Vec::new()
            },
        })
    }

    fn emits_codec_config(&self) -> bool {
        self.codec_config
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.require(DeviceState::Configured, "start")
            .map_err(|e| DeviceError::Start(e.to_string()))?;
        self.state = DeviceState::Running;
        Ok(())
    }

    fn dequeue_input(&mut self, _timeout: Duration) -> Result<Option<InputSlot>, DeviceError> {
        self.require(DeviceState::Running, "dequeue input")?;
        if self.eos_queued {
            return Ok(None);
        }

        let Some(index) = self.inputs.iter().position(|(slot, _)| *slot == Slot::Free) else {
            return Ok(None);
        };
        self.inputs[index].0 = Slot::Lent;

        Ok(Some(InputSlot {
            index,
            capacity: self.inputs[index].1.len(),
        }))
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], DeviceError> {
        match self.inputs.get_mut(index) {
            Some((Slot::Lent, buffer)) => Ok(buffer.as_mut_slice()),
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

        let capacity = match self.inputs.get(index) {
            Some((Slot::Lent, buffer)) => buffer.len(),
            _ => return Err(DeviceError::UnknownBuffer(index)),
        };
        if len > capacity {
            return Err(DeviceError::BufferOverflow { len, capacity });
        }
        if self.eos_queued {
            return Err(DeviceError::InvalidState("input after end of stream".into()));
        }

        self.submissions += 1;
        let stalled = self
            .profile
            .stall_after
            .is_some_and(|after| self.accepted >= after);
        let refused = self
            .profile
            .reject_every
            .is_some_and(|every| every > 0 && self.submissions % every == 0);
        if stalled || refused {
            self.counters.rejected += 1;
            return Err(if stalled {
                DeviceError::Busy("synthetic stall".into())
            } else {
                DeviceError::InvalidState("synthetic rejection".into())
            });
        }
        self.accepted += 1;

        if len > 0 {
            let interval = self.profile.keyframe_interval;
            let frame_number = self.counters.frames_queued;
            let key_frame = frame_number == 0
                || self.sync_requested
                || (interval > 0 && frame_number % interval == 0);
            self.sync_requested = false;

            let seed = self.inputs[index].1.first().copied().unwrap_or_default();
            self.pending.push_back(PendingFrame {
                input_slot: index,
                presentation_time_us,
                raw_len: len,
                seed,
                key_frame,
                ready_at: self.polls + self.profile.latency,
            });
            self.inputs[index].0 = Slot::Queued;
            self.counters.frames_queued += 1;
        } else {
            self.inputs[index].0 = Slot::Free;
        }

        if flags.contains(BufferFlags::END_OF_STREAM) {
            trace!("{}: end of stream queued at {presentation_time_us}us", self.name);
            self.eos_queued = true;
            self.counters.eos_inputs += 1;
        }

        Ok(())
    }

    fn cancel_input(&mut self, index: usize) {
        if let Some((slot @ Slot::Lent, _)) = self.inputs.get_mut(index) {
            *slot = Slot::Free;
            self.counters.cancelled_inputs += 1;
        }
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<OutputPoll, DeviceError> {
        self.require(DeviceState::Running, "dequeue output")?;
        self.polls += 1;

        let ready = self
            .pending
            .front()
            .is_some_and(|frame| self.eos_queued || frame.ready_at <= self.polls);

        if ready && self.profile.format_change && !self.format_announced {
            self.format_announced = true;
            return Ok(OutputPoll::FormatChanged);
        }

        let Some(index) = self.free_output() else {
            return Ok(OutputPoll::TryAgainLater);
        };

        if ready && self.codec_config && !self.config_sent {
            self.config_sent = true;
            self.counters.config_units += 1;
            let size = self.lend_output(index, self.parameter_sets());
            return Ok(OutputPoll::Unit(OutputUnit {
                index,
                offset: 0,
                size,
                presentation_time_us: 0,
                flags: BufferFlags::CODEC_CONFIG,
            }));
        }

        if ready && let Some(frame) = self.pending.pop_front() {
            self.inputs[frame.input_slot].0 = Slot::Free;

            let payload = self.encoded_frame(&frame);
            let size = self.lend_output(index, payload);
            self.counters.payload_units += 1;

            let mut flags = BufferFlags::empty();
            if frame.key_frame {
                self.counters.keyframes += 1;
                flags |= BufferFlags::KEY_FRAME;
            }

            return Ok(OutputPoll::Unit(OutputUnit {
                index,
                offset: 0,
                size,
                presentation_time_us: frame.presentation_time_us,
                flags,
            }));
        }

        if self.eos_queued && self.pending.is_empty() && !self.eos_sent {
            self.eos_sent = true;
            if self.profile.end_of_stream_unit {
                self.counters.eos_outputs += 1;
                self.lend_output(index, Vec::new());
                return Ok(OutputPoll::Unit(OutputUnit {
                    index,
                    offset: 0,
                    size: 0,
                    presentation_time_us: 0,
                    flags: BufferFlags::END_OF_STREAM,
                }));
            }
        }

        Ok(OutputPoll::TryAgainLater)
    }

    fn output_buffer(&self, index: usize) -> Result<&[u8], DeviceError> {
        match self.outputs.get(index) {
            Some((true, buffer)) => Ok(buffer.as_slice()),
            _ => Err(DeviceError::UnknownBuffer(index)),
        }
    }

    fn release_output(&mut self, index: usize) -> Result<(), DeviceError> {
        match self.outputs.get_mut(index) {
            Some((lent @ true, buffer)) => {
                *lent = false;
                buffer.clear();
                Ok(())
            }
            _ => Err(DeviceError::UnknownBuffer(index)),
        }
    }

    fn set_parameters(&mut self, params: &DeviceParameters) -> Result<(), DeviceError> {
        self.require(DeviceState::Running, "set parameters")?;

        if params.request_sync {
            self.sync_requested = true;
            self.counters.sync_requests += 1;
        }
        if let Some(bitrate) = params.bitrate {
            debug!("{}: bitrate {bitrate}", self.name);
            self.bitrate = Some(bitrate);
            self.counters.bitrate_changes += 1;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        match self.state {
            DeviceState::Running | DeviceState::Configured => {
                self.state = DeviceState::Stopped;
                self.pending.clear();
                self.counters.stops += 1;
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
        self.state = DeviceState::Released;
        self.inputs.clear();
        self.outputs.clear();
        self.pending.clear();
        self.counters.releases += 1;
    }
}

/// Creates [`SyntheticDevice`]s for a fixed set of codec names.
#[derive(Clone, Default)]
pub struct SyntheticBackend {
    profile: SyntheticProfile,
    sink: Option<Arc<Mutex<MemorySink>>>,
}

impl SyntheticBackend {
    pub fn new(profile: SyntheticProfile) -> Self {
        Self {
            profile,
            sink: None,
        }
    }

    /// Writes every session into `sink` instead of a file.
    pub fn with_memory_sink(mut self, sink: Arc<Mutex<MemorySink>>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn profile(&self) -> &SyntheticProfile {
        &self.profile
    }
}

impl EncoderBackend for SyntheticBackend {
    type Device = SyntheticDevice;

    fn resolve_codec(
        &self,
        codec: Option<&str>,
        mime: Option<&str>,
    ) -> Result<String, DeviceError> {
        let found = match (codec.filter(|c| !c.is_empty()), mime) {
            (Some(codec), _) => {
                let codec = codec.to_ascii_lowercase();
                CODECS
                    .iter()
                    .find(|c| c.name == codec || c.aliases.contains(&codec.as_str()))
            }
            (None, Some(mime)) => CODECS.iter().find(|c| c.mime.eq_ignore_ascii_case(mime)),
            (None, None) => None,
        };

        found.map(|c| c.name.to_string()).ok_or_else(|| {
            DeviceError::CodecNotFound(codec.or(mime).unwrap_or_default().to_string())
        })
    }

    fn create_by_name(&self, name: &str) -> Result<Self::Device, DeviceError> {
        let codec = CODECS
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DeviceError::CodecNotFound(name.to_string()))?;

        Ok(SyntheticDevice::new(codec, self.profile.clone()))
    }

    fn list_encoders(&self) -> Vec<CodecDescriptor> {
        CODECS
            .iter()
            .map(|c| CodecDescriptor {
                name: c.name.to_string(),
                mime: c.mime.to_string(),
                hardware: false,
            })
            .collect()
    }

    fn create_sink(&self, path: &Path) -> Result<Box<dyn ContainerSink + Send>, SinkError> {
        match &self.sink {
            Some(sink) => Ok(Box::new(sink.clone())),
            None => Ok(Box::new(RawStreamSink::create(path)?)),
        }
    }
}
