use clap::Parser;
use std::path::PathBuf;

use crate::pipeline::fusion::{BpmPolicy, PitchPolicy};

#[derive(Parser, Debug)]
#[command(name = "beatzero", about = "Real-time audio feature fusion at a fixed publish rate")]
pub struct Cli {
    /// Input audio file to replay (WAV, MP3, FLAC, OGG)
    pub input: Option<PathBuf>,

    /// Config file (defaults to ./beatzero.toml or the user config dir)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Summaries published per second
    #[arg(short, long, default_value_t = 30.0)]
    pub rate: f32,

    /// Samples per analysed frame
    #[arg(long, default_value_t = 512)]
    pub frame_length: usize,

    /// Replay speed multiplier
    #[arg(long, default_value_t = 1.0)]
    pub speed: f32,

    /// BPM fusion policy
    #[arg(long, value_enum)]
    pub bpm_policy: Option<BpmPolicy>,

    /// Pitch fusion policy
    #[arg(long, value_enum)]
    pub pitch_policy: Option<PitchPolicy>,

    /// Summary sink: stdout, file or http
    #[arg(short, long, default_value = "stdout")]
    pub sink: String,

    /// Output file for the file sink
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Endpoint for the http sink
    #[arg(long)]
    pub url: Option<String>,

    /// Hide the replay progress bar
    #[arg(short, long)]
    pub quiet: bool,

    /// List onset detection methods and exit
    #[arg(long)]
    pub list_methods: bool,
}
