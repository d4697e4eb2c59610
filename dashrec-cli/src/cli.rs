use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use dashrec_engine::{ConcatStrategy, LatencyClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConcatMethod {
    /// Join chunks byte by byte
    Direct,
    /// Join chunks with ffmpeg's concat demuxer
    Tool,
}

impl From<ConcatMethod> for ConcatStrategy {
    fn from(method: ConcatMethod) -> Self {
        match method {
            ConcatMethod::Direct => ConcatStrategy::DirectConcat,
            ConcatMethod::Tool => ConcatStrategy::ToolConcat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LatencyArg {
    Normal,
    Low,
    UltraLow,
}

impl From<LatencyArg> for LatencyClass {
    fn from(arg: LatencyArg) -> Self {
        match arg {
            LatencyArg::Normal => LatencyClass::Normal,
            LatencyArg::Low => LatencyClass::Low,
            LatencyArg::UltraLow => LatencyClass::UltraLow,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Record a live DASH stream while it is on air", long_about = None)]
pub struct Args {
    /// Manifest (MPD) URL of the live stream
    pub url: String,

    /// Representation ids to record, e.g. "137+140"
    #[arg(short, long)]
    pub format: Option<String>,

    /// Keep the temporary chunk directory after muxing
    #[arg(short, long)]
    pub keep: bool,

    /// Concurrent chunk downloads
    #[arg(short, long, default_value_t = 10)]
    pub threads: usize,

    /// Force the chunk join method instead of probing
    #[arg(long, value_enum)]
    pub concat_method: Option<ConcatMethod>,

    /// Produce a single output even when the recording has gaps
    #[arg(long)]
    pub force_merge: bool,

    /// Pause after every downloaded chunk, in milliseconds
    #[arg(long, value_name = "MS")]
    pub cooldown: Option<u64>,

    /// Extra HTTP headers, one "Name: value" per line
    #[arg(long, env = "DASHREC_HEADERS")]
    pub headers: Option<String>,

    /// Output file name (without extension)
    #[arg(long, default_value = "output")]
    pub title: String,

    /// Latency class advertised by the broadcaster
    #[arg(long, value_enum, default_value_t = LatencyArg::Normal)]
    pub latency_class: LatencyArg,

    /// Shorthand for --latency-class low
    #[arg(long, conflicts_with = "latency_class")]
    pub low_latency: bool,

    /// The stream is a premiere of pre-recorded content
    #[arg(long)]
    pub premiere: bool,

    /// The stream has DVR enabled
    #[arg(long)]
    pub dvr: bool,

    /// Directory for outputs and the temporary chunk directory
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Output container extension
    #[arg(long, default_value = "mp4")]
    pub container: String,

    /// Abort when the finished video and audio chunk counts differ
    #[arg(long)]
    pub strict_count: bool,

    /// Print the session report as JSON
    #[arg(long)]
    pub json: bool,

    /// Verbose logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    pub fn latency(&self) -> LatencyClass {
        if self.low_latency {
            LatencyClass::Low
        } else {
            self.latency_class.into()
        }
    }
}
