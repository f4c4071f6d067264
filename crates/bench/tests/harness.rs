use encbench::{
    BackendKind, SyntheticOptions, TestConfig, TestResults, TestRunner, results::TestStatus,
    runner,
};
use std::path::Path;

fn synthetic_in(dir: &Path, parallel: bool) -> TestConfig {
    let mut config = TestConfig::synthetic(SyntheticOptions {
        frames: 20,
        source_fps: 30.0,
        target_fps: 15.0,
    });
    config.run.output_dir = dir.to_path_buf();
    config.run.parallel = parallel;

    let pattern_path = dir.join("pattern.yuv");
    if let Some(pattern) = config.pattern.as_mut() {
        pattern.path = pattern_path.clone();
    }
    for test in &mut config.tests {
        test.input.path = pattern_path.clone();
    }
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn test_synthetic_preset_runs_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let results = TestRunner::new(synthetic_in(dir.path(), true))
        .run()
        .await
        .unwrap();

    assert_eq!(results.summary.total_tests, 3);
    assert_eq!(results.summary.passed, 3);
    assert!(results.meta.parallel);
    assert_eq!(results.meta.backend, "synthetic");

    let avc = &results.results[0];
    assert_eq!(avc.status, TestStatus::Pass);
    assert_eq!(avc.failure_reason, None);
    assert_eq!(avc.codec.as_deref(), Some("synthetic.avc"));
    assert_eq!(avc.exchange.frames_submitted, 20);
    assert_eq!(avc.exchange.loops, 2);
    assert_eq!(avc.frames.encoded, 20);
    assert_eq!(avc.records.len(), 20);
    assert!(avc.latency_ms.is_some());
    assert!(avc.frames.average_bitrate_bps > 0.0);
    let path = avc.output_path.as_deref().unwrap();
    assert!(path.ends_with(".es"));
    assert!(std::fs::metadata(path).unwrap().len() > 0);

    let vp9 = &results.results[2];
    assert_eq!(vp9.status, TestStatus::Pass);
    assert!(vp9.output_path.is_none());
    assert_eq!(vp9.frames.encoded, 20);

    assert_eq!(
        results.summary.total_frames,
        results.results.iter().map(|r| r.frames.encoded).sum::<u64>()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sequential_run_matches_frame_counts() {
    let dir = tempfile::tempdir().unwrap();
    let results = TestRunner::new(synthetic_in(dir.path(), false))
        .run()
        .await
        .unwrap();

    assert!(!results.meta.parallel);
    assert_eq!(results.summary.passed, 3);
    for result in &results.results {
        assert_eq!(result.frames.encoded, result.exchange.payload_units);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_codec_is_reported_as_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = synthetic_in(dir.path(), false);
    config.tests.truncate(1);
    config.tests[0].configure.codec = Some("mpeg2".to_string());

    let results = TestRunner::new(config).run().await.unwrap();

    let result = &results.results[0];
    assert_eq!(result.status, TestStatus::Error);
    assert!(
        result
            .failure_reason
            .as_deref()
            .unwrap()
            .starts_with("Failed to create codec")
    );
    assert_eq!(result.frames.encoded, 0);
    assert!(result.latency_ms.is_none());
    assert_eq!(results.summary.errors, 1);
    assert_eq!(results.summary.pass_rate, 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_results_round_trip_through_json() {
    let dir = tempfile::tempdir().unwrap();
    let results = TestRunner::new(synthetic_in(dir.path(), false))
        .run()
        .await
        .unwrap();

    let path = dir.path().join("reports").join("results.json");
    results.save_json(&path).unwrap();
    let loaded = TestResults::load(&path).unwrap();

    assert_eq!(loaded.meta.config_name, results.meta.config_name);
    assert_eq!(loaded.summary.total_frames, results.summary.total_frames);
    assert_eq!(loaded.results.len(), results.results.len());
    for (a, b) in loaded.results.iter().zip(&results.results) {
        assert_eq!(a.test_id, b.test_id);
        assert_eq!(a.exchange, b.exchange);
        assert_eq!(a.records, b.records);
        assert_eq!(a.latency_ms, b.latency_ms);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_runs_definition_file() {
    let dir = tempfile::tempdir().unwrap();
    let pattern = dir.path().join("in.yuv");
    let definition = format!(
        r#"
[meta]
name = "from file"

[run]
output_dir = "{out}"

[pattern]
path = "{pattern}"
resolution = "32x16"
frames = 5

[[test]]
id = "h264"
input = {{ path = "{pattern}", resolution = "32x16", framerate = 30.0, playout_frames = 12 }}
configure = {{ codec = "h264" }}
"#,
        out = dir.path().join("out").display(),
        pattern = pattern.display(),
    );
    let file = dir.path().join("bench.toml");
    std::fs::write(&file, definition).unwrap();

    let config = TestConfig::load(&file).unwrap();
    assert_eq!(config.run.backend, BackendKind::Synthetic);

    let results = TestRunner::new(config)
        .with_config_path(file.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(results.meta.config_path, Some(file.display().to_string()));
    let result = &results.results[0];
    assert_eq!(result.status, TestStatus::Pass);
    assert_eq!(result.exchange.source_frames, 12);
    assert_eq!(result.exchange.loops, 3);
    assert!(dir.path().join("out").join("h264.es").exists());
}

#[test]
fn test_lists_synthetic_codecs() {
    let codecs = runner::list_codecs(BackendKind::Synthetic).unwrap();
    assert!(codecs.iter().any(|c| c.mime == "video/avc"));
    assert!(codecs.iter().all(|c| !c.hardware));
}
