use encbench_buffer_encoder::{
    ConfigureConfig, EncoderBackend, InputConfig, RawPixelLayout, Resolution, RuntimeConfig,
    SessionConfig, SessionOptions, run_session,
};
use encbench_enc_ffmpeg::FfmpegBackend;
use std::io::Write;

fn gradient_source(resolution: Resolution, frames: u8) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for i in 0..frames {
        let frame: Vec<u8> = (0..resolution.raw_frame_size())
            .map(|p| (p as u8).wrapping_add(i.wrapping_mul(8)))
            .collect();
        file.write_all(&frame).unwrap();
    }
    file.flush().unwrap();
    file
}

#[test]
fn test_lists_only_available_encoders() {
    let backend = FfmpegBackend::new().unwrap();
    for descriptor in backend.list_encoders() {
        assert!(ffmpeg::codec::encoder::find_by_name(&descriptor.name).is_some());
    }
}

#[test]
fn test_unknown_codec_is_not_found() {
    let backend = FfmpegBackend::new().unwrap();
    assert!(backend.resolve_codec(Some("not-a-codec"), None).is_err());
    assert!(backend.resolve_codec(None, Some("video/mp4v-es")).is_err());
}

#[test]
fn test_encodes_h264_into_mp4() {
    let backend = FfmpegBackend::new().unwrap();
    if backend.resolve_codec(Some("libx264"), None).is_err() {
        eprintln!("libx264 not available, skipping");
        return;
    }

    let resolution = Resolution::new(64, 64);
    let source = gradient_source(resolution, 10);
    let dir = tempfile::tempdir().unwrap();

    let config = SessionConfig {
        id: "x264".into(),
        description: String::new(),
        input: InputConfig {
            path: source.path().to_path_buf(),
            resolution,
            framerate: 30.0,
            pix_fmt: RawPixelLayout::Yuv420p,
            playout_frames: Some(20),
            stoptime_sec: None,
            realtime: false,
        },
        configure: ConfigureConfig {
            codec: Some("libx264".into()),
            bitrate: Some(200_000),
            ..Default::default()
        },
        runtime: RuntimeConfig::default(),
    };
    let options = SessionOptions {
        output_dir: dir.path().to_path_buf(),
        ..Default::default()
    };

    let outcome = run_session(&config, &backend, &options, None);
    assert_eq!(outcome.status(), "");
    assert_eq!(outcome.report.frames_submitted, 20);
    assert_eq!(outcome.report.loops, 2);
    assert_eq!(outcome.statistics.frame_count(), 20);
    assert!(outcome.statistics.keyframe_count() >= 1);

    let path = outcome.output_path.unwrap();
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("mp4"));
    assert!(std::fs::metadata(path).unwrap().len() > 0);
}
