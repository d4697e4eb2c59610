mod cli;
mod error;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dashrec_engine::{
    CountMismatchPolicy, FfmpegMuxer, FfprobeProber, FormatSelector, HttpChunkFetcher, HttpConfig,
    HttpManifestSource, LiveConfig, LiveSession, MpdExtractor, SessionReport, StreamInfo,
    create_client, install_rustls_provider,
};
use tokio::sync::mpsc;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Args;
use crate::error::AppError;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!(error = %e, "Recording failed");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .init();
}

async fn run(args: Args) -> Result<(), AppError> {
    if args.url.trim().is_empty() {
        return Err(AppError::InvalidInput("manifest URL is empty".to_string()));
    }
    install_rustls_provider();

    let mut http = HttpConfig::default();
    if let Some(raw) = args.headers.as_deref() {
        http = http.with_raw_headers(raw)?;
    }

    let count_mismatch = if args.strict_count {
        CountMismatchPolicy::Abort
    } else {
        CountMismatchPolicy::MatchById
    };

    let config = LiveConfig::builder()
        .with_http(http)
        .with_max_workers(args.threads)
        .with_cooldown(args.cooldown.map(Duration::from_millis))
        .with_force_merge(args.force_merge)
        .with_concat_override(args.concat_method.map(Into::into))
        .with_count_mismatch(count_mismatch)
        .with_keep_temporary_files(args.keep)
        .with_output_dir(&args.output_dir)
        .with_container(args.container.trim_start_matches('.'))
        .build();

    let client = create_client(&config.http)?;

    let mut info = StreamInfo::new(args.url.trim());
    info.title = args.title.clone();
    info.latency_class = args.latency();
    info.is_dvr_enabled = args.dvr;
    info.is_premiere = args.premiere;

    let session = LiveSession::new(
        Arc::new(HttpManifestSource::new(client.clone(), info)),
        Arc::new(MpdExtractor::new(FormatSelector::new(args.format.as_deref()))),
        Arc::new(HttpChunkFetcher::new(client)),
        Arc::new(FfmpegMuxer::new(&config.tools)),
        Arc::new(FfprobeProber::new(&config.tools)),
        config,
    );

    let (interrupt_tx, interrupt_rx) = mpsc::channel(2);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    let report = session.run(interrupt_rx).await?;
    print_report(&report, args.json)
}

fn print_report(report: &SessionReport, json: bool) -> Result<(), AppError> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    if report.artifacts.is_empty() {
        warn!("No output was produced");
    }
    for artifact in &report.artifacts {
        println!("{} -> {}", artifact.description, artifact.path.display());
    }
    if report.dropped_chunk_count > 0 {
        println!("{} chunk(s) could not be downloaded", report.dropped_chunk_count);
    }
    if report.orphan_chunk_count > 0 {
        println!(
            "{} chunk(s) had no counterpart in the other track",
            report.orphan_chunk_count
        );
    }
    if report.work_dir_retained {
        info!(path = %report.work_dir.display(), "Temporary files kept");
    }
    Ok(())
}
