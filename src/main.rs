mod audio;
mod cli;
mod config;
mod error;
mod pipeline;
mod sink;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use audio::analysis::SpectralAnalyzer;
use audio::features::OnsetMethod;
use audio::source::{FileSource, FrameSource};
use cli::Cli;
use config::{Config, PipelineConfig, PipelineSection};
use pipeline::Pipeline;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let mut cli = Cli::parse();

    if cli.list_methods {
        println!("Onset detection methods:");
        for method in OnsetMethod::ALL {
            println!("  {:<10} {}", method.name(), method.description());
        }
        return Ok(());
    }

    let mut cfg = Config::default();
    if let Some(path) = config::discover(cli.config.as_deref()) {
        match config::load_config(&path) {
            Ok(loaded) => {
                log::info!("Loaded config from {}", path.display());
                cfg = loaded;
            }
            Err(err) => log::warn!("Ignoring config {}: {:#}", path.display(), err),
        }
    }

    // Merge: config values apply only when CLI is at its default
    if cli.rate == 30.0 { cli.rate = cfg.pipeline.publish_rate; }
    if cli.frame_length == 512 { cli.frame_length = cfg.pipeline.frame_length; }
    if cli.speed == 1.0 { cli.speed = cfg.pipeline.replay_speed; }
    if cli.sink == "stdout" { cli.sink = cfg.sink.kind.clone(); }
    if cli.output.is_none() { cli.output = cfg.sink.path.clone(); }
    if cli.url.is_none() { cli.url = cfg.sink.url.clone(); }
    if let Some(policy) = cli.bpm_policy { cfg.fusion.bpm_policy = policy; }
    if let Some(policy) = cli.pitch_policy { cfg.fusion.pitch_policy = policy; }

    cfg.pipeline = PipelineSection {
        publish_rate: cli.rate,
        frame_length: cli.frame_length,
        replay_speed: cli.speed,
    };
    cfg.sink.kind = cli.sink.clone();
    cfg.sink.path = cli.output.clone();
    cfg.sink.url = cli.url.clone();

    let input = cli.input.as_ref().context("Input audio file is required")?;
    if !input.exists() {
        anyhow::bail!("Input file not found: {}", input.display());
    }

    log::info!("beatzero - audio feature fusion");
    log::info!("Input: {}", input.display());
    log::info!("Sink: {}", cfg.sink.kind);

    let source = FileSource::open(input, cli.frame_length)
        .with_context(|| format!("Failed to open {}", input.display()))?;
    let sample_rate = source.sample_rate();

    let pipeline_config = PipelineConfig::new(&cfg.pipeline, sample_rate, &cfg)?;
    let mut source = source.paced(pipeline_config.frame_period());
    log::info!(
        "Publishing at {:.1}Hz, frames of {} samples, replay x{:.2}, bpm {:?}, pitch {:?}",
        pipeline_config.publish_rate,
        pipeline_config.frame_length,
        cli.speed,
        pipeline_config.fusion.bpm_policy,
        pipeline_config.fusion.pitch_policy
    );

    if !cli.quiet {
        let pb = ProgressBar::new(source.total_frames() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} frames ({eta} remaining)")
                .context("Invalid progress bar template")?
                .progress_chars("=>-"),
        );
        source = source.with_progress(pb);
    }

    let analyzer = SpectralAnalyzer::new(sample_rate, cli.frame_length);
    let mut sink = sink::build_sink(&cfg.sink)?;

    let pipeline = Pipeline::new(pipeline_config);
    ctrlc::set_handler(pipeline.shutdown_handle().on_signal())
        .context("Failed to install interrupt handler")?;

    let report = pipeline
        .run(source, analyzer, &mut sink)
        .context("Frame source failed")?;

    if report.skipped_ticks > 0 {
        log::warn!("Flush loop overran {} publish deadlines", report.skipped_ticks);
    }
    log::info!(
        "Done! {} summaries from {} frames",
        report.summaries_published,
        report.frames_analyzed
    );

    Ok(())
}
