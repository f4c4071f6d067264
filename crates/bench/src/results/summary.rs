use colored::Colorize;

use super::types::{TestResult, TestResults, TestStatus};

fn status_label(status: TestStatus) -> colored::ColoredString {
    match status {
        TestStatus::Pass => "PASS".green().bold(),
        TestStatus::Fail => "FAIL".red().bold(),
        TestStatus::Error => "ERROR".red().bold(),
    }
}

impl TestResults {
    pub fn print_summary(&self) {
        println!("\n{}", "=== Encode Benchmark Summary ===".bold().cyan());

        println!("\n{}", "Configuration:".bold());
        println!("  Name: {}", self.meta.config_name);
        if let Some(path) = &self.meta.config_path {
            println!("  File: {path}");
        }
        println!(
            "  Backend: {}{}",
            self.meta.backend,
            if self.meta.parallel { " (parallel)" } else { "" }
        );
        println!("  Platform: {}", self.meta.platform);
        println!("  Timestamp: {}", self.meta.timestamp);

        println!("\n{}", "Results:".bold());
        let passed_str = format!("{} passed", self.summary.passed).green();
        let failed_str = if self.summary.failed > 0 {
            format!("{} failed", self.summary.failed).red()
        } else {
            format!("{} failed", self.summary.failed).normal()
        };
        let errors_str = if self.summary.errors > 0 {
            format!("{} errors", self.summary.errors).red().bold()
        } else {
            format!("{} errors", self.summary.errors).normal()
        };

        println!(
            "  {} | {} | {} | {} total",
            passed_str, failed_str, errors_str, self.summary.total_tests
        );

        let pass_rate = format!("{:.1}", self.summary.pass_rate);
        let pass_rate = if self.summary.pass_rate >= 100.0 {
            pass_rate.green()
        } else if self.summary.pass_rate >= 80.0 {
            pass_rate.yellow()
        } else {
            pass_rate.red()
        };
        println!("  Pass Rate: {pass_rate}%");
        println!(
            "  Output: {} frames, {:.2} MiB",
            self.summary.total_frames,
            self.summary.total_bytes as f64 / (1024.0 * 1024.0)
        );
        println!("  Duration: {:.1}s", self.summary.duration_secs);

        println!("\n{}", "Tests:".bold());
        for test in &self.results {
            println!(
                "  {} {:<28} {:>6} frames {:>8.1} fps",
                status_label(test.status),
                test.test_id,
                test.frames.encoded,
                test.frames.effective_fps
            );
        }

        let failed: Vec<_> = self
            .results
            .iter()
            .filter(|r| r.status != TestStatus::Pass)
            .collect();

        if !failed.is_empty() {
            println!("\n{}", "Failed Tests:".red().bold());
            for test in failed {
                let icon = match test.status {
                    TestStatus::Error => "!".red().bold(),
                    _ => "✗".red(),
                };
                println!("  {} {}", icon, test.test_id);
                if let Some(reason) = &test.failure_reason {
                    println!("    Reason: {}", reason.dimmed());
                }
            }
        }

        println!();
    }

    pub fn print_detailed_report(&self) {
        self.print_summary();

        println!("{}", "=== Detailed Results ===".bold().cyan());

        for test in &self.results {
            print_test(test);
        }

        println!();
    }
}

fn print_test(test: &TestResult) {
    println!("\n{} - {}", test.test_id.bold(), status_label(test.status));
    if !test.description.is_empty() {
        println!("  {}", test.description.dimmed());
    }

    if let Some(codec) = &test.codec {
        println!("  Codec: {codec}");
    }
    if let Some(input) = &test.input_format {
        println!("  Input: {input}");
    }
    if let Some(output) = &test.output_format {
        println!(
            "  Output: {} {}x{} @ {}fps",
            output.mime, output.width, output.height, output.frame_rate
        );
    }
    if let Some(path) = &test.output_path {
        println!("  File: {path}");
    }

    let exchange = &test.exchange;
    println!(
        "  Exchange: {} submitted, {} skipped ({} forced), {} source frames, {} loops",
        exchange.frames_submitted,
        exchange.frames_skipped,
        exchange.frames_dropped,
        exchange.source_frames,
        exchange.loops
    );
    if exchange.rejections > 0 {
        println!("    {} rejected submissions", exchange.rejections.to_string().yellow());
    }
    if exchange.cancelled {
        println!("    {}", "cancelled".yellow());
    }

    let frames = &test.frames;
    println!("  Performance:");
    println!(
        "    Frames: {} ({} key), {} bytes",
        frames.encoded, frames.keyframes, frames.bytes
    );
    println!("    Effective FPS: {:.1}", frames.effective_fps);
    println!("    Bitrate: {:.1} kbps", frames.average_bitrate_bps / 1000.0);

    if let Some(latency) = &test.latency_ms {
        println!(
            "    Latency: avg {:.2}ms, p50 {:.2}ms, p95 {:.2}ms, p99 {:.2}ms, max {:.2}ms",
            latency.avg, latency.p50, latency.p95, latency.p99, latency.max
        );
    }

    if let Some(reason) = &test.failure_reason {
        println!("  {}: {}", "Failure".red(), reason);
    }
}
