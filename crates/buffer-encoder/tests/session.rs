use encbench_buffer_encoder::{
    CancellationFlag, ConfigureConfig, EncodeSession, ExchangeOptions, InputConfig, MemorySink,
    RawPixelLayout, Resolution, RuntimeConfig, SessionConfig, SessionError, SessionOptions,
    SessionState, StartCoordinator, run_session,
    synthetic::{SyntheticBackend, SyntheticProfile},
};
use std::{
    io::Write,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

const RESOLUTION: Resolution = Resolution::new(16, 16);

/// A source whose frame `i` is filled with byte `i`.
fn source_file(frames: u8) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for i in 0..frames {
        file.write_all(&vec![i; RESOLUTION.raw_frame_size()])
            .unwrap();
    }
    file.flush().unwrap();
    file
}

fn session_config(source: &tempfile::NamedTempFile, codec: &str) -> SessionConfig {
    SessionConfig {
        id: format!("{codec}-test"),
        description: String::new(),
        input: InputConfig {
            path: source.path().to_path_buf(),
            resolution: RESOLUTION,
            framerate: 30.0,
            pix_fmt: RawPixelLayout::Yuv420p,
            playout_frames: None,
            stoptime_sec: None,
            realtime: false,
        },
        configure: ConfigureConfig {
            codec: Some(codec.to_string()),
            ..Default::default()
        },
        runtime: RuntimeConfig::default(),
    }
}

fn options(dir: &tempfile::TempDir) -> SessionOptions {
    SessionOptions {
        exchange: ExchangeOptions {
            drain_timeout: Duration::from_millis(50),
            ..Default::default()
        },
        output_dir: dir.path().to_path_buf(),
        cancel: None,
    }
}

fn memory_backend(profile: SyntheticProfile) -> (SyntheticBackend, Arc<Mutex<MemorySink>>) {
    let sink = Arc::new(Mutex::new(MemorySink::new()));
    (
        SyntheticBackend::new(profile).with_memory_sink(sink.clone()),
        sink,
    )
}

/// Recovers the source frame index the synthetic device folded into a payload.
fn payload_seed(payload: &[u8]) -> u8 {
    payload[5].wrapping_sub(5)
}

#[test]
fn test_halved_rate_over_two_passes() {
    let source = source_file(10);
    let dir = tempfile::tempdir().unwrap();
    let mut config = session_config(&source, "avc");
    config.configure.framerate = Some(15.0);
    config.input.playout_frames = Some(20);

    let (backend, sink) = memory_backend(SyntheticProfile::default());
    let outcome = run_session(&config, &backend, &options(&dir), None);

    assert_eq!(outcome.status(), "");
    assert_eq!(outcome.report.loops, 2);
    assert_eq!(outcome.report.frames_submitted, 10);
    assert_eq!(outcome.report.frames_skipped, 9);
    assert_eq!(outcome.report.payload_units, 10);
    assert_eq!(outcome.report.eos_submitted, 1);
    assert!(outcome.report.eos_received);

    let sink = sink.lock().unwrap();
    assert_eq!(sink.initializations, 1);
    assert_eq!(sink.finalizations, 1);
    assert_eq!(sink.units.len(), 10);

    let seeds: Vec<u8> = sink.units.iter().map(|u| payload_seed(&u.payload)).collect();
    assert_eq!(seeds, vec![0, 2, 4, 6, 8, 0, 2, 4, 6, 8]);

    let pts: Vec<i64> = sink.units.iter().map(|u| u.presentation_time_us).collect();
    assert_eq!(pts[1], 66_667);
    assert!(pts.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_end_of_stream_submitted_once_and_teardown_is_idempotent() {
    let source = source_file(7);
    let dir = tempfile::tempdir().unwrap();
    let config = session_config(&source, "hevc");
    let (backend, sink) = memory_backend(SyntheticProfile::default());

    let mut session = EncodeSession::start(&config, &backend, &options(&dir)).unwrap();
    assert_eq!(session.state(), SessionState::Started);

    let report = session.run().unwrap();
    assert_eq!(report.frames_submitted, 7);
    assert_eq!(report.eos_submitted, 1);
    assert_eq!(session.device().counters().eos_inputs, 1);
    assert_eq!(session.device().counters().eos_outputs, 1);

    session.stop().unwrap();
    session.stop().unwrap();
    session.release();
    session.release();

    assert_eq!(session.state(), SessionState::Released);
    assert_eq!(session.device().counters().stops, 1);
    assert_eq!(session.device().counters().releases, 1);
    assert_eq!(sink.lock().unwrap().finalizations, 1);

    assert!(matches!(
        session.run(),
        Err(SessionError::Lifecycle { op: "run", .. })
    ));
}

#[test]
fn test_wraps_to_reach_frame_ceiling() {
    let source = source_file(10);
    let dir = tempfile::tempdir().unwrap();

    for (ceiling, reopens) in [(10, 0), (11, 1), (20, 1), (25, 2), (31, 3)] {
        let mut config = session_config(&source, "avc");
        config.input.playout_frames = Some(ceiling);
        let (backend, _) = memory_backend(SyntheticProfile::default());

        let outcome = run_session(&config, &backend, &options(&dir), None);
        assert_eq!(outcome.status(), "");
        assert_eq!(outcome.report.source_frames, ceiling);
        assert_eq!(outcome.report.frames_submitted, ceiling);
        assert_eq!(outcome.report.loops - 1, reopens, "ceiling {ceiling}");
    }
}

#[test]
fn test_plays_once_without_termination_policy() {
    let source = source_file(6);
    let dir = tempfile::tempdir().unwrap();
    let config = session_config(&source, "avc");
    let (backend, _) = memory_backend(SyntheticProfile::default());

    let outcome = run_session(&config, &backend, &options(&dir), None);
    assert_eq!(outcome.report.loops, 1);
    assert_eq!(outcome.report.frames_submitted, 6);
}

#[test]
fn test_time_ceiling_uses_source_time() {
    let source = source_file(10);
    let dir = tempfile::tempdir().unwrap();
    let mut config = session_config(&source, "avc");
    config.input.stoptime_sec = Some(0.5);
    let (backend, _) = memory_backend(SyntheticProfile::default());

    let outcome = run_session(&config, &backend, &options(&dir), None);
    assert_eq!(outcome.report.frames_submitted, 15);
    assert_eq!(outcome.report.loops, 2);
}

#[test]
fn test_statistics_match_payload_units() {
    let source = source_file(12);
    let dir = tempfile::tempdir().unwrap();
    let config = session_config(&source, "avc");
    let (backend, _) = memory_backend(SyntheticProfile {
        keyframe_interval: 5,
        ..Default::default()
    });

    let outcome = run_session(&config, &backend, &options(&dir), None);
    let stats = &outcome.statistics;

    assert_eq!(stats.frame_count() as u64, outcome.report.payload_units);
    assert_eq!(outcome.report.config_units, 1);
    assert_eq!(stats.keyframe_count(), 3);
    assert!(stats.records().iter().all(|r| r.latency().is_some()));
    assert_eq!(stats.codec(), Some("synthetic.avc"));
    assert_eq!(stats.output_format().map(|f| f.mime.as_str()), Some("video/avc"));
}

#[test]
fn test_rejected_submissions_do_not_advance_the_source() {
    let source = source_file(10);
    let dir = tempfile::tempdir().unwrap();
    let config = session_config(&source, "avc");
    let (backend, sink) = memory_backend(SyntheticProfile {
        reject_every: Some(3),
        ..Default::default()
    });

    let outcome = run_session(&config, &backend, &options(&dir), None);
    assert_eq!(outcome.status(), "");
    assert!(outcome.report.rejections > 0);
    assert_eq!(outcome.report.frames_submitted, 10);
    assert_eq!(outcome.report.source_frames, 10);

    let seeds: Vec<u8> = sink
        .lock()
        .unwrap()
        .units
        .iter()
        .map(|u| payload_seed(&u.payload))
        .collect();
    assert_eq!(seeds, (0..10).collect::<Vec<u8>>());
}

#[test]
fn test_persistent_rejection_stalls_when_capped() {
    let source = source_file(10);
    let dir = tempfile::tempdir().unwrap();
    let config = session_config(&source, "avc");
    let (backend, sink) = memory_backend(SyntheticProfile {
        stall_after: Some(3),
        ..Default::default()
    });

    let mut options = options(&dir);
    options.exchange.max_consecutive_rejections = Some(5);

    let outcome = run_session(&config, &backend, &options, None);
    assert!(matches!(outcome.error, Some(SessionError::DeviceStalled(6))));
    assert!(!outcome.status().is_empty());
    assert_eq!(outcome.report.frames_submitted, 3);
    assert_eq!(sink.lock().unwrap().finalizations, 1);
}

#[test]
fn test_cancellation_skips_to_teardown() {
    let source = source_file(10);
    let dir = tempfile::tempdir().unwrap();
    let config = session_config(&source, "avc");
    let (backend, sink) = memory_backend(SyntheticProfile::default());

    let cancel = CancellationFlag::new();
    cancel.cancel();
    let mut options = options(&dir);
    options.cancel = Some(cancel);

    let outcome = run_session(&config, &backend, &options, None);
    assert_eq!(outcome.status(), "");
    assert!(outcome.report.cancelled);
    assert_eq!(outcome.report.frames_submitted, 0);
    assert_eq!(sink.lock().unwrap().finalizations, 1);
}

#[test]
fn test_statistics_without_file_output() {
    let source = source_file(10);
    let dir = tempfile::tempdir().unwrap();
    let mut config = session_config(&source, "avc");
    config.configure.encode = false;
    let (backend, sink) = memory_backend(SyntheticProfile::default());

    let outcome = run_session(&config, &backend, &options(&dir), None);
    assert_eq!(outcome.status(), "");
    assert_eq!(outcome.statistics.frame_count(), 10);
    assert!(outcome.output_path.is_none());

    let sink = sink.lock().unwrap();
    assert_eq!(sink.initializations, 0);
    assert!(sink.units.is_empty());
}

#[test]
fn test_vp_codec_track_is_added_at_start() {
    let source = source_file(4);
    let dir = tempfile::tempdir().unwrap();
    let config = session_config(&source, "vp9");
    let (backend, sink) = memory_backend(SyntheticProfile::default());

    let outcome = run_session(&config, &backend, &options(&dir), None);
    assert_eq!(outcome.status(), "");
    assert_eq!(outcome.report.config_units, 0);

    let sink = sink.lock().unwrap();
    assert_eq!(sink.initializations, 1);
    assert_eq!(
        sink.format.as_ref().map(|f| f.mime.as_str()),
        Some("video/x-vnd.on2.vp9")
    );
    assert_eq!(sink.units.len(), 4);
}

#[test]
fn test_format_announcement_and_config_initialize_track_once() {
    let source = source_file(4);
    let dir = tempfile::tempdir().unwrap();
    let config = session_config(&source, "avc");
    let (backend, sink) = memory_backend(SyntheticProfile {
        format_change: true,
        ..Default::default()
    });

    let outcome = run_session(&config, &backend, &options(&dir), None);
    assert_eq!(outcome.status(), "");
    assert_eq!(outcome.report.config_units, 1);

    let sink = sink.lock().unwrap();
    assert_eq!(sink.initializations, 1);
    let format = sink.format.as_ref().unwrap();
    assert!(!format.codec_config.is_empty());
    assert_eq!(sink.units.len(), 4);
}

#[test]
fn test_elementary_stream_starts_with_parameter_sets_after_format_change() {
    let source = source_file(4);
    let dir = tempfile::tempdir().unwrap();
    let config = session_config(&source, "avc");
    let backend = SyntheticBackend::new(SyntheticProfile {
        format_change: true,
        ..Default::default()
    });

    let outcome = run_session(&config, &backend, &options(&dir), None);
    assert_eq!(outcome.status(), "");

    let bytes = std::fs::read(outcome.output_path.as_ref().unwrap()).unwrap();
    assert_eq!(&bytes[..5], &[0, 0, 0, 1, 0x67]);
}

#[test]
fn test_quiet_device_is_drained_by_timeout() {
    let source = source_file(5);
    let dir = tempfile::tempdir().unwrap();
    let config = session_config(&source, "avc");
    let (backend, sink) = memory_backend(SyntheticProfile {
        end_of_stream_unit: false,
        ..Default::default()
    });

    let outcome = run_session(&config, &backend, &options(&dir), None);
    assert_eq!(outcome.status(), "");
    assert!(!outcome.report.eos_received);
    assert_eq!(outcome.report.payload_units, 5);
    assert_eq!(sink.lock().unwrap().units.len(), 5);
}

#[test]
fn test_runtime_actions_apply_per_frame() {
    let source = source_file(10);
    let dir = tempfile::tempdir().unwrap();
    let mut config = session_config(&source, "avc");
    config.runtime.drop = vec![3, 9];
    config.runtime.request_sync = vec![5];
    config.runtime.video_bitrate = vec![encbench_buffer_encoder::BitrateChange {
        frame: 6,
        bitrate: 250_000,
    }];
    let (backend, _) = memory_backend(SyntheticProfile {
        keyframe_interval: 0,
        ..Default::default()
    });

    let mut session = EncodeSession::start(&config, &backend, &options(&dir)).unwrap();
    let report = session.run().unwrap();

    // frame 9 is never read: frame 8 already carries end of stream
    assert_eq!(report.frames_submitted, 8);
    assert_eq!(report.frames_dropped, 1);
    assert_eq!(report.eos_submitted, 1);
    assert_eq!(session.device().counters().sync_requests, 1);
    assert_eq!(session.device().counters().bitrate_changes, 1);

    let keyframes: Vec<i64> = session
        .statistics()
        .records()
        .iter()
        .filter(|r| r.keyframe)
        .map(|r| r.pts_us)
        .collect();
    assert_eq!(keyframes, vec![0, 166_667]);
}

#[test]
fn test_setup_failures_report_status() {
    let source = source_file(2);
    let dir = tempfile::tempdir().unwrap();
    let (backend, _) = memory_backend(SyntheticProfile::default());

    let mut missing = session_config(&source, "avc");
    missing.input.path = dir.path().join("missing.yuv");
    let outcome = run_session(&missing, &backend, &options(&dir), None);
    assert!(outcome.status().starts_with("Could not open file"));

    let unknown = session_config(&source, "mpeg2");
    let outcome = run_session(&unknown, &backend, &options(&dir), None);
    assert!(outcome.status().starts_with("Failed to create codec"));

    let (no_slots, _) = memory_backend(SyntheticProfile {
        input_slots: 0,
        ..Default::default()
    });
    let outcome = run_session(&session_config(&source, "avc"), &no_slots, &options(&dir), None);
    assert!(outcome.status().starts_with("Failed to configure codec"));

    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();
    let mut unwritable = options(&dir);
    unwritable.output_dir = blocker.join("out");
    let outcome = run_session(
        &session_config(&source, "avc"),
        &SyntheticBackend::default(),
        &unwritable,
        None,
    );
    assert!(outcome.status().starts_with("Failed to create output"));
    assert!(outcome.error.as_ref().unwrap().is_setup());
}

#[test]
fn test_vp_codec_track_falls_back_to_first_unit() {
    let source = source_file(4);
    let dir = tempfile::tempdir().unwrap();
    let config = session_config(&source, "vp9");
    let (backend, sink) = memory_backend(SyntheticProfile::default());
    sink.lock().unwrap().rejected_initializations = 1;

    let outcome = run_session(&config, &backend, &options(&dir), None);
    assert_eq!(outcome.status(), "");

    let sink = sink.lock().unwrap();
    assert_eq!(sink.initializations, 1);
    assert_eq!(sink.units.len(), 4);
}

#[test]
fn test_realtime_paces_submissions() {
    let source = source_file(5);
    let dir = tempfile::tempdir().unwrap();
    let mut config = session_config(&source, "avc");
    config.input.framerate = 100.0;
    config.input.realtime = true;
    let (backend, _) = memory_backend(SyntheticProfile::default());

    let started = Instant::now();
    let outcome = run_session(&config, &backend, &options(&dir), None);
    assert_eq!(outcome.status(), "");
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[test]
fn test_sessions_start_together() {
    let source = source_file(5);
    let dir = tempfile::tempdir().unwrap();
    let backend = SyntheticBackend::default();
    let configs = [session_config(&source, "avc"), session_config(&source, "vp8")];

    let (coordinator, gates) = StartCoordinator::new(configs.len(), Duration::from_secs(5));
    let options = options(&dir);

    let outcomes = std::thread::scope(|scope| {
        let handles: Vec<_> = configs
            .iter()
            .zip(gates)
            .map(|(config, gate)| {
                let backend = &backend;
                let options = &options;
                scope.spawn(move || run_session(config, backend, options, Some(gate)))
            })
            .collect();

        let ready = coordinator.wait_ready(Duration::from_secs(5));
        assert_eq!(ready.len(), 2);
        coordinator.release();

        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert!(outcomes.iter().all(|o| o.is_success()));
}

#[test]
fn test_writes_elementary_stream_file() {
    let source = source_file(3);
    let dir = tempfile::tempdir().unwrap();
    let config = session_config(&source, "avc");

    let outcome = run_session(
        &config,
        &SyntheticBackend::default(),
        &options(&dir),
        None,
    );
    assert_eq!(outcome.status(), "");

    let path = outcome.output_path.unwrap();
    assert_eq!(path, dir.path().join("avc-test.es"));
    let written = std::fs::read(path).unwrap();
    assert_eq!(&written[..5], &[0, 0, 0, 1, 0x67]);
}
