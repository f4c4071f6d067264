mod codec;
mod device;
mod mp4;

pub use codec::*;
pub use device::*;
pub use mp4::*;

use std::path::Path;

use encbench_buffer_encoder::{
    CodecDescriptor, ContainerSink, DeviceError, EncoderBackend, SinkError,
};
use ffmpeg::codec::encoder;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("{0:?}")]
    FFmpeg(#[from] ffmpeg::Error),
}

/// Encoders provided by the linked libavcodec, written into mp4 files.
#[derive(Debug, Clone, Copy)]
pub struct FfmpegBackend {
    _private: (),
}

impl FfmpegBackend {
    pub fn new() -> Result<Self, InitError> {
        ffmpeg::init()?;
        Ok(Self { _private: () })
    }
}

impl EncoderBackend for FfmpegBackend {
    type Device = FfmpegDevice;

    fn resolve_codec(
        &self,
        codec: Option<&str>,
        mime: Option<&str>,
    ) -> Result<String, DeviceError> {
        let not_found = || DeviceError::CodecNotFound(codec.or(mime).unwrap_or_default().to_string());

        if let Some(codec) = codec.filter(|c| !c.is_empty()) {
            if let Some(family) = family_for_alias(codec) {
                return first_available(family)
                    .map(str::to_string)
                    .ok_or_else(not_found);
            }

            let found = encoder::find_by_name(codec).ok_or_else(not_found)?;
            if family_for_id(found.id()).is_none() {
                debug!("{codec} encodes {:?}, which has no mp4 mapping", found.id());
                return Err(not_found());
            }
            return Ok(found.name().to_string());
        }

        let family = mime.and_then(family_for_mime).ok_or_else(not_found)?;
        first_available(family).map(str::to_string).ok_or_else(not_found)
    }

    fn create_by_name(&self, name: &str) -> Result<Self::Device, DeviceError> {
        let codec = encoder::find_by_name(name)
            .ok_or_else(|| DeviceError::CodecNotFound(name.to_string()))?;
        let family = family_for_id(codec.id())
            .ok_or_else(|| DeviceError::Create(format!("{name} has no known output format")))?;

        Ok(FfmpegDevice::new(codec, family))
    }

    fn list_encoders(&self) -> Vec<CodecDescriptor> {
        FAMILIES
            .iter()
            .flat_map(|family| {
                family
                    .encoders
                    .iter()
                    .filter(|name| encoder::find_by_name(name).is_some())
                    .map(|name| CodecDescriptor {
                        name: name.to_string(),
                        mime: family.mime.to_string(),
                        hardware: is_hardware(name),
                    })
            })
            .collect()
    }

    fn container_extension(&self) -> &'static str {
        "mp4"
    }

    fn create_sink(&self, path: &Path) -> Result<Box<dyn ContainerSink + Send>, SinkError> {
        Ok(Box::new(Mp4Sink::create(path)?))
    }
}
