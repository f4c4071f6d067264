use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use encbench::{BackendKind, SyntheticOptions, TestConfig, TestResults, TestRunner, runner};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "encbench")]
#[command(about = "Drives video encoders through their buffer queues and reports timing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tests of a TOML definition file
    Run {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the built-in tests against the synthetic device
    Synthetic {
        #[arg(long, default_value = "60")]
        frames: u32,

        #[arg(long, default_value = "30")]
        source_fps: f32,

        #[arg(long, default_value = "30")]
        target_fps: f32,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the encoders a backend can create
    Codecs {
        #[arg(long, value_enum, default_value_t = BackendKind::Synthetic)]
        backend: BackendKind,

        #[arg(long)]
        json: bool,
    },

    /// Print a saved results file
    Report { results: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    match cli.command {
        Commands::Run { config, output } => {
            cmd_run(config, output).await?;
        }

        Commands::Synthetic {
            frames,
            source_fps,
            target_fps,
            output,
        } => {
            let options = SyntheticOptions {
                frames,
                source_fps,
                target_fps,
            };
            cmd_synthetic(options, output).await?;
        }

        Commands::Codecs { backend, json } => {
            cmd_codecs(backend, json)?;
        }

        Commands::Report { results } => {
            cmd_report(results)?;
        }
    }

    Ok(())
}

async fn cmd_run(config_path: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let config = TestConfig::load(&config_path)?;
    let runner = TestRunner::new(config).with_config_path(config_path);

    finish(run_until_interrupted(&runner).await?, output)
}

async fn cmd_synthetic(options: SyntheticOptions, output: Option<PathBuf>) -> Result<()> {
    let config = TestConfig::synthetic(options);
    config.check()?;
    let runner = TestRunner::new(config);

    finish(run_until_interrupted(&runner).await?, output)
}

async fn run_until_interrupted(runner: &TestRunner) -> Result<TestResults> {
    let cancel = runner.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping sessions");
            cancel.cancel();
        }
    });

    runner.run().await
}

fn finish(results: TestResults, output: Option<PathBuf>) -> Result<()> {
    results.print_summary();

    if let Some(path) = output {
        results.save_json(&path)?;
        println!("Results saved to: {}", path.display());
    }

    let passed = results.summary.passed;
    let total = results.summary.total_tests;
    if passed < total {
        anyhow::bail!("{} of {total} tests did not pass", total - passed);
    }

    Ok(())
}

fn cmd_codecs(backend: BackendKind, json_output: bool) -> Result<()> {
    let codecs = runner::list_codecs(backend)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&codecs)?);
        return Ok(());
    }

    println!(
        "\n{} {}",
        "Encoders on the".bold().cyan(),
        format!("{} backend:", backend.display_name()).bold().cyan()
    );
    if codecs.is_empty() {
        println!("  {}", "none available".yellow());
    }
    for codec in &codecs {
        let kind = if codec.hardware {
            "hardware".green()
        } else {
            "software".normal()
        };
        println!("  {:<24} {:<24} {}", codec.name, codec.mime, kind);
    }
    println!();

    Ok(())
}

fn cmd_report(results_path: PathBuf) -> Result<()> {
    let results = TestResults::load(&results_path)?;
    results.print_detailed_report();

    Ok(())
}
