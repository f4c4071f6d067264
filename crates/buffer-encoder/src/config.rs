use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid resolution '{0}', expected WxH")]
    InvalidResolution(String),
    #[error("Invalid frame rate {0}")]
    InvalidFrameRate(f32),
    #[error("Neither codec nor mime is set")]
    NoCodec,
}

/// Picture dimensions, written as `WxH` in test definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Byte size of one 4:2:0 picture at this resolution.
    pub fn raw_frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3 / 2
    }
}

impl FromStr for Resolution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidResolution(s.to_string());

        let (width, height) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width = width.trim().parse::<u32>().map_err(|_| invalid())?;
        let height = height.trim().parse::<u32>().map_err(|_| invalid())?;

        if width == 0 || height == 0 {
            return Err(invalid());
        }

        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawPixelLayout {
    #[default]
    Yuv420p,
    Nv12,
    Nv21,
}

impl RawPixelLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yuv420p => "yuv420p",
            Self::Nv12 => "nv12",
            Self::Nv21 => "nv21",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    pub path: PathBuf,
    pub resolution: Resolution,
    pub framerate: f32,
    #[serde(default)]
    pub pix_fmt: RawPixelLayout,
    /// Source frames to consume before signalling end of stream.
    #[serde(default)]
    pub playout_frames: Option<u64>,
    /// Source time in seconds after which end of stream is signalled.
    #[serde(default)]
    pub stoptime_sec: Option<f64>,
    /// Pace submissions to the source frame clock.
    #[serde(default)]
    pub realtime: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureConfig {
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    /// Target frame rate, defaults to the source frame rate.
    #[serde(default)]
    pub framerate: Option<f32>,
    #[serde(default)]
    pub bitrate: Option<u64>,
    #[serde(default)]
    pub i_frame_interval: Option<u32>,
    /// Write the compressed stream to a container file.
    #[serde(default = "default_true")]
    pub encode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ConfigureConfig {
    fn default() -> Self {
        Self {
            codec: None,
            mime: None,
            framerate: None,
            bitrate: None,
            i_frame_interval: None,
            encode: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrateChange {
    pub frame: u64,
    pub bitrate: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub request_sync: Vec<u64>,
    #[serde(default)]
    pub video_bitrate: Vec<BitrateChange>,
    #[serde(default)]
    pub drop: Vec<u64>,
}

/// One encode test as written in a test definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub input: InputConfig,
    #[serde(default)]
    pub configure: ConfigureConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl SessionConfig {
    pub fn source_frame_rate(&self) -> f32 {
        self.input.framerate
    }

    pub fn target_frame_rate(&self) -> f32 {
        self.configure.framerate.unwrap_or(self.input.framerate)
    }

    pub fn write_file(&self) -> bool {
        self.configure.encode
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for rate in [self.source_frame_rate(), self.target_frame_rate()] {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ConfigError::InvalidFrameRate(rate));
            }
        }

        let has_codec = self.configure.codec.as_deref().is_some_and(|c| !c.is_empty());
        let has_mime = self.configure.mime.as_deref().is_some_and(|m| !m.is_empty());
        if !has_codec && !has_mime {
            return Err(ConfigError::NoCodec);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resolution() {
        let res: Resolution = "1280x720".parse().unwrap();
        assert_eq!(res, Resolution::new(1280, 720));
        assert_eq!(res.raw_frame_size(), 1280 * 720 * 3 / 2);

        let res: Resolution = " 64X48 ".parse().unwrap();
        assert_eq!(res, Resolution::new(64, 48));
    }

    #[test]
    fn rejects_bad_resolution() {
        assert!("1280".parse::<Resolution>().is_err());
        assert!("0x720".parse::<Resolution>().is_err());
        assert!("axb".parse::<Resolution>().is_err());
    }

    #[test]
    fn target_rate_defaults_to_source() {
        let config = SessionConfig {
            id: "t".into(),
            description: String::new(),
            input: InputConfig {
                path: "in.yuv".into(),
                resolution: Resolution::new(16, 16),
                framerate: 30.0,
                pix_fmt: RawPixelLayout::Nv12,
                playout_frames: None,
                stoptime_sec: None,
                realtime: false,
            },
            configure: ConfigureConfig {
                mime: Some("video/avc".into()),
                ..Default::default()
            },
            runtime: RuntimeConfig::default(),
        };

        assert_eq!(config.target_frame_rate(), 30.0);
        assert!(config.validate().is_ok());
    }
}
