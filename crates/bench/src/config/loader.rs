use anyhow::{Context, Result, bail};
use encbench_buffer_encoder::{
    BitrateChange, ConfigureConfig, InputConfig, RawPixelLayout, Resolution, RuntimeConfig,
    SessionConfig,
};
use std::{collections::HashSet, path::Path};

use super::types::*;

const PATTERN_RESOLUTION: Resolution = Resolution::new(320, 240);

/// Shape of the built-in synthetic run.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticOptions {
    pub frames: u32,
    pub source_fps: f32,
    pub target_fps: f32,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            frames: 60,
            source_fps: 30.0,
            target_fps: 30.0,
        }
    }
}

impl TestConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .check()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Rejects definitions that could never produce a meaningful run.
    pub fn check(&self) -> Result<()> {
        if self.tests.is_empty() {
            bail!("No [[test]] entries");
        }

        let mut ids = HashSet::new();
        for test in &self.tests {
            if !ids.insert(test.id.as_str()) {
                bail!("Duplicate test id '{}'", test.id);
            }
            test.validate()
                .with_context(|| format!("Test '{}'", test.id))?;
        }

        Ok(())
    }

    /// Tests against the synthetic device, fed from a generated pattern, so
    /// the harness runs with no inputs.
    pub fn synthetic(options: SyntheticOptions) -> Self {
        let output_dir = std::path::PathBuf::from("encbench-output");
        let pattern_path = output_dir.join(format!(
            "pattern_{}x{}.yuv",
            PATTERN_RESOLUTION.width, PATTERN_RESOLUTION.height
        ));

        let input = InputConfig {
            path: pattern_path.clone(),
            resolution: PATTERN_RESOLUTION,
            framerate: options.source_fps,
            pix_fmt: RawPixelLayout::Yuv420p,
            playout_frames: Some(u64::from(options.frames) * 2),
            stoptime_sec: None,
            realtime: false,
        };
        let target = format!("{}fps", options.target_fps);

        let tests = vec![
            SessionConfig {
                id: format!("avc-{target}"),
                description: "Two passes over the pattern".to_string(),
                input: input.clone(),
                configure: ConfigureConfig {
                    codec: Some("avc".to_string()),
                    framerate: Some(options.target_fps),
                    bitrate: Some(2_000_000),
                    i_frame_interval: Some(1),
                    ..Default::default()
                },
                runtime: RuntimeConfig::default(),
            },
            SessionConfig {
                id: format!("hevc-{target}-runtime"),
                description: "Sync request, bitrate change and a forced drop".to_string(),
                input: input.clone(),
                configure: ConfigureConfig {
                    mime: Some("video/hevc".to_string()),
                    framerate: Some(options.target_fps),
                    bitrate: Some(2_000_000),
                    ..Default::default()
                },
                runtime: RuntimeConfig {
                    request_sync: vec![10],
                    video_bitrate: vec![BitrateChange {
                        frame: 20,
                        bitrate: 1_000_000,
                    }],
                    drop: vec![6],
                },
            },
            SessionConfig {
                id: format!("vp9-{target}-stats"),
                description: "Statistics only, nothing written".to_string(),
                input,
                configure: ConfigureConfig {
                    codec: Some("vp9".to_string()),
                    framerate: Some(options.target_fps),
                    encode: false,
                    ..Default::default()
                },
                runtime: RuntimeConfig::default(),
            },
        ];

        Self {
            meta: MetaConfig {
                name: "Synthetic Tests".to_string(),
                description: "Synthetic device fed from a generated pattern (no codecs required)"
                    .to_string(),
            },
            run: RunConfig {
                backend: BackendKind::Synthetic,
                parallel: true,
                output_dir,
                ..Default::default()
            },
            pattern: Some(PatternConfig {
                path: pattern_path,
                resolution: PATTERN_RESOLUTION,
                frames: options.frames,
            }),
            tests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITION: &str = r#"
[meta]
name = "h264 ladder"

[run]
backend = "ffmpeg"
parallel = true
max_consecutive_rejections = 50

[[test]]
id = "720p30"
input = { path = "in.yuv", resolution = "1280x720", framerate = 30.0, playout_frames = 300 }
configure = { codec = "libx264", bitrate = 4000000 }

[[test]]
id = "720p15-stats"
input = { path = "in.yuv", resolution = "1280X720", framerate = 30.0, pix_fmt = "nv12" }
configure = { mime = "video/avc", framerate = 15.0, encode = false }
runtime = { request_sync = [30], drop = [4, 5], video_bitrate = [{ frame = 60, bitrate = 1000000 }] }
"#;

    #[test]
    fn parses_run_and_tests() {
        let config: TestConfig = toml::from_str(DEFINITION).unwrap();
        config.check().unwrap();

        assert_eq!(config.run.backend, BackendKind::Ffmpeg);
        assert!(config.run.parallel);
        assert_eq!(config.run.max_consecutive_rejections, Some(50));
        assert_eq!(config.run.start_timeout_ms, 5000);
        assert!(config.pattern.is_none());

        let first = &config.tests[0];
        assert_eq!(first.input.resolution, Resolution::new(1280, 720));
        assert_eq!(first.input.pix_fmt, RawPixelLayout::Yuv420p);
        assert!(first.write_file());
        assert_eq!(first.target_frame_rate(), 30.0);

        let second = &config.tests[1];
        assert_eq!(second.input.pix_fmt, RawPixelLayout::Nv12);
        assert!(!second.write_file());
        assert_eq!(second.target_frame_rate(), 15.0);
        assert_eq!(second.runtime.drop, vec![4, 5]);
        assert_eq!(second.runtime.video_bitrate[0].bitrate, 1_000_000);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut config: TestConfig = toml::from_str(DEFINITION).unwrap();
        config.tests[1].id = "720p30".to_string();
        assert!(config.check().is_err());
    }

    #[test]
    fn rejects_tests_without_codec() {
        let mut config: TestConfig = toml::from_str(DEFINITION).unwrap();
        config.tests[0].configure.codec = None;
        assert!(config.check().is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let error = TestConfig::load(Path::new("/nonexistent/encbench.toml")).unwrap_err();
        assert!(error.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn synthetic_preset_is_valid() {
        let config = TestConfig::synthetic(SyntheticOptions {
            frames: 30,
            source_fps: 30.0,
            target_fps: 15.0,
        });
        config.check().unwrap();

        let pattern = config.pattern.as_ref().unwrap();
        assert_eq!(pattern.frames, 30);
        assert!(config.tests.iter().all(|t| t.input.path == pattern.path));
        assert_eq!(config.tests[0].input.playout_frames, Some(60));
        assert_eq!(config.tests[0].id, "avc-15fps");
    }
}
