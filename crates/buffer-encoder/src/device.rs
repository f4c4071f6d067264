use std::{fmt, path::Path, time::Duration};

use crate::{
    config::{RawPixelLayout, Resolution},
    sink::{ContainerSink, RawStreamSink, SinkError},
};

bitflags::bitflags! {
    /// Flags attached to submitted input buffers and produced output units.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct BufferFlags: u32 {
        const KEY_FRAME = 1;
        const CODEC_CONFIG = 1 << 1;
        const END_OF_STREAM = 1 << 2;
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("Codec not found: {0}")]
    CodecNotFound(String),
    #[error("Create: {0}")]
    Create(String),
    #[error("Configure: {0}")]
    Configure(String),
    #[error("Start: {0}")]
    Start(String),
    /// The device cannot take the request right now.
    #[error("Busy: {0}")]
    Busy(String),
    /// The request conflicts with the device's internal state.
    #[error("InvalidState: {0}")]
    InvalidState(String),
    #[error("Unknown buffer index {0}")]
    UnknownBuffer(usize),
    #[error("Buffer overflow: {len} bytes into a {capacity} byte slot")]
    BufferOverflow { len: usize, capacity: usize },
    #[error("Encode: {0}")]
    Encode(String),
    #[error("Stop: {0}")]
    Stop(String),
}

impl DeviceError {
    /// Whether the failing call can be retried on a later loop iteration.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::InvalidState(_))
    }
}

/// A free input slot lent to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSlot {
    pub index: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    CodecConfig,
    EndOfStream,
    Payload,
}

/// A produced output unit. The payload lives in the device's output slot
/// `index` at `offset..offset + size` until the slot is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputUnit {
    pub index: usize,
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

impl OutputUnit {
    pub fn kind(&self) -> OutputKind {
        if self.flags.contains(BufferFlags::CODEC_CONFIG) {
            OutputKind::CodecConfig
        } else if self.flags.contains(BufferFlags::END_OF_STREAM) {
            OutputKind::EndOfStream
        } else {
            OutputKind::Payload
        }
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(BufferFlags::KEY_FRAME)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPoll {
    TryAgainLater,
    FormatChanged,
    Unit(OutputUnit),
}

/// Parameters requested at configure time.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderFormat {
    pub codec: String,
    pub resolution: Resolution,
    pub pixel_layout: RawPixelLayout,
    pub frame_rate: f32,
    pub bitrate: Option<u64>,
    pub i_frame_interval: Option<u32>,
}

impl fmt::Display for EncoderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} @ {}fps",
            self.codec,
            self.resolution,
            self.pixel_layout.as_str(),
            self.frame_rate
        )?;
        if let Some(bitrate) = self.bitrate {
            write!(f, " {}kbps", bitrate / 1000)?;
        }
        Ok(())
    }
}

/// Parameters the device actually settled on.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct OutputFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
    pub bitrate: Option<u64>,
    /// Codec-specific data (parameter sets), empty until the device has produced it.
    #[serde(skip)]
    pub codec_config: Vec<u8>,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} @ {}fps",
            self.mime, self.width, self.height, self.frame_rate
        )
    }
}

/// Per-frame adjustments applied right before a frame is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceParameters {
    pub request_sync: bool,
    pub bitrate: Option<u64>,
}

impl DeviceParameters {
    pub fn is_empty(&self) -> bool {
        !self.request_sync && self.bitrate.is_none()
    }
}

/// An encoder accessed only through its input/output buffer queues.
///
/// Slot ownership moves to the caller on `dequeue_*` and back to the device
/// on `queue_input`, `cancel_input` or `release_output`. A failed
/// `queue_input` leaves the slot with the caller.
pub trait EncoderDevice {
    fn name(&self) -> &str;

    fn configure(&mut self, format: &EncoderFormat) -> Result<(), DeviceError>;

    fn output_format(&self) -> Result<OutputFormat, DeviceError>;

    /// Whether the device announces its output format with a codec-config unit.
    fn emits_codec_config(&self) -> bool {
        true
    }

    fn start(&mut self) -> Result<(), DeviceError>;

    fn dequeue_input(&mut self, timeout: Duration) -> Result<Option<InputSlot>, DeviceError>;

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], DeviceError>;

    fn queue_input(
        &mut self,
        index: usize,
        len: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), DeviceError>;

    fn cancel_input(&mut self, index: usize);

    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputPoll, DeviceError>;

    fn output_buffer(&self, index: usize) -> Result<&[u8], DeviceError>;

    fn release_output(&mut self, index: usize) -> Result<(), DeviceError>;

    fn set_parameters(&mut self, params: &DeviceParameters) -> Result<(), DeviceError>;

    fn stop(&mut self) -> Result<(), DeviceError>;

    fn release(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CodecDescriptor {
    pub name: String,
    pub mime: String,
    pub hardware: bool,
}

/// Creates devices and resolves codec identifiers for one encoder family.
pub trait EncoderBackend {
    type Device: EncoderDevice;

    /// Maps a codec name/short id or a MIME type to a concrete device name.
    fn resolve_codec(&self, codec: Option<&str>, mime: Option<&str>)
    -> Result<String, DeviceError>;

    fn create_by_name(&self, name: &str) -> Result<Self::Device, DeviceError>;

    fn list_encoders(&self) -> Vec<CodecDescriptor>;

    /// File extension of what [`EncoderBackend::create_sink`] writes.
    fn container_extension(&self) -> &'static str {
        "es"
    }

    /// Opens the container sink this backend's output is written into.
    fn create_sink(&self, path: &Path) -> Result<Box<dyn ContainerSink + Send>, SinkError> {
        Ok(Box::new(RawStreamSink::create(path)?))
    }
}

/// A claimed input slot, handed back to the device on drop unless submitted.
pub struct InputClaim<'a, D: EncoderDevice + ?Sized> {
    device: &'a mut D,
    slot: InputSlot,
    submitted: bool,
}

impl<'a, D: EncoderDevice + ?Sized> InputClaim<'a, D> {
    pub fn new(device: &'a mut D, slot: InputSlot) -> Self {
        Self {
            device,
            slot,
            submitted: false,
        }
    }

    pub fn buffer(&mut self) -> Result<&mut [u8], DeviceError> {
        self.device.input_buffer(self.slot.index)
    }

    pub fn device(&mut self) -> &mut D {
        &mut *self.device
    }

    pub fn submit(
        mut self,
        len: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), DeviceError> {
        if len > self.slot.capacity {
            return Err(DeviceError::BufferOverflow {
                len,
                capacity: self.slot.capacity,
            });
        }

        self.device
            .queue_input(self.slot.index, len, presentation_time_us, flags)?;
        self.submitted = true;
        Ok(())
    }
}

impl<D: EncoderDevice + ?Sized> Drop for InputClaim<'_, D> {
    fn drop(&mut self) {
        if !self.submitted {
            tracing::trace!("Returning unsubmitted input slot {}", self.slot.index);
            self.device.cancel_input(self.slot.index);
        }
    }
}

/// A borrowed output unit, released back to the device on drop.
pub struct OutputClaim<'a, D: EncoderDevice + ?Sized> {
    device: &'a mut D,
    unit: OutputUnit,
    released: bool,
}

impl<'a, D: EncoderDevice + ?Sized> OutputClaim<'a, D> {
    pub fn new(device: &'a mut D, unit: OutputUnit) -> Self {
        Self {
            device,
            unit,
            released: false,
        }
    }

    pub fn unit(&self) -> &OutputUnit {
        &self.unit
    }

    pub fn payload(&self) -> Result<&[u8], DeviceError> {
        let buffer = self.device.output_buffer(self.unit.index)?;
        let end = self.unit.offset + self.unit.size;
        buffer
            .get(self.unit.offset..end)
            .ok_or(DeviceError::BufferOverflow {
                len: end,
                capacity: buffer.len(),
            })
    }

    pub fn device(&self) -> &D {
        &*self.device
    }

    pub fn release(mut self) -> Result<(), DeviceError> {
        self.released = true;
        self.device.release_output(self.unit.index)
    }
}

impl<D: EncoderDevice + ?Sized> Drop for OutputClaim<'_, D> {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = self.device.release_output(self.unit.index)
        {
            tracing::warn!("Failed to release output slot {}: {e}", self.unit.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_kind_prefers_codec_config() {
        let unit = OutputUnit {
            index: 0,
            offset: 0,
            size: 4,
            presentation_time_us: 0,
            flags: BufferFlags::CODEC_CONFIG | BufferFlags::END_OF_STREAM,
        };
        assert_eq!(unit.kind(), OutputKind::CodecConfig);

        let unit = OutputUnit {
            flags: BufferFlags::KEY_FRAME,
            ..unit
        };
        assert_eq!(unit.kind(), OutputKind::Payload);
        assert!(unit.is_key_frame());
    }

    #[test]
    fn busy_and_invalid_state_are_transient() {
        assert!(DeviceError::Busy("x".into()).is_transient());
        assert!(DeviceError::InvalidState("x".into()).is_transient());
        assert!(!DeviceError::Encode("x".into()).is_transient());
        assert!(!DeviceError::UnknownBuffer(3).is_transient());
    }
}
