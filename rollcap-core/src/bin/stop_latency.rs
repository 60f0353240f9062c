//! Measures stop latency against session length.
//!
//! Each run records a synthetic tone for the given length (driven through a
//! manual clock, so a one-hour session takes seconds), waits for the merge
//! worker to catch up, then times `finish()`. Stop latency should stay flat
//! as the session grows.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rollcap_core::{
    config::apply_env_overrides,
    session::{RecordingSession, SessionSetup},
    AudioFormat, EncodedChunk, ManualClock, Pacing, RecorderConfig, StubEncoder, WavStore,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct Args {
    /// Defaults plus `ROLLCAP_*` environment overrides; flags win over both.
    base: RecorderConfig,
    lengths_secs: Vec<u64>,
    iterations: usize,
    window_secs: u64,
    segment_secs: u64,
    sample_rate: u32,
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
struct CaseResult {
    session_secs: u64,
    iteration: usize,
    stop_latency_ms: f64,
    duration_ms: u64,
    segments: u64,
}

#[derive(Debug, Clone, Serialize)]
struct LengthSummary {
    session_secs: u64,
    runs: usize,
    p50_latency_ms: f64,
    p95_latency_ms: f64,
    avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
struct Summary {
    window_secs: u64,
    segment_secs: u64,
    sample_rate: u32,
    iterations: usize,
    lengths: Vec<LengthSummary>,
    cases: Vec<CaseResult>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("stop latency benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn parse_args() -> Result<Args, String> {
    let mut base = RecorderConfig {
        window_secs: 60,
        segment_secs: 30,
        sample_rate: 16_000,
        ..RecorderConfig::default()
    };
    apply_env_overrides(&mut base);
    let mut args = Args {
        lengths_secs: vec![60, 600, 1_800, 3_600],
        iterations: 3,
        window_secs: base.window_secs,
        segment_secs: base.segment_secs,
        sample_rate: base.sample_rate,
        output: None,
        base,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| {
            it.next()
                .ok_or_else(|| format!("missing value for {name}"))
        };
        match arg.as_str() {
            "--lengths" => {
                args.lengths_secs = value("--lengths")?
                    .split(',')
                    .map(|s| s.trim().parse::<u64>())
                    .collect::<Result<_, _>>()
                    .map_err(|_| "invalid value for --lengths".to_string())?;
            }
            "--iterations" => {
                args.iterations = value("--iterations")?
                    .parse::<usize>()
                    .map_err(|_| "invalid value for --iterations".to_string())?
                    .clamp(1, 20);
            }
            "--window" => {
                args.window_secs = value("--window")?
                    .parse()
                    .map_err(|_| "invalid value for --window".to_string())?;
            }
            "--segment" => {
                args.segment_secs = value("--segment")?
                    .parse()
                    .map_err(|_| "invalid value for --segment".to_string())?;
            }
            "--sample-rate" => {
                args.sample_rate = value("--sample-rate")?
                    .parse()
                    .map_err(|_| "invalid value for --sample-rate".to_string())?;
            }
            "--output" => args.output = Some(PathBuf::from(value("--output")?)),
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p rollcap-core --release --bin stop_latency -- \\
  [--lengths 60,600,3600] [--iterations <n>] [--window <s>] [--segment <s>] \\
  [--sample-rate <hz>] [--output <file.json>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    if args.lengths_secs.is_empty() {
        return Err("--lengths must name at least one session length".into());
    }
    Ok(args)
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let scratch = std::env::temp_dir().join(format!("rollcap-bench-{}", std::process::id()));

    let mut cases = Vec::new();
    for &session_secs in &args.lengths_secs {
        for iteration in 0..args.iterations {
            let case = run_case(&args, &scratch, session_secs, iteration)?;
            eprintln!(
                "{session_secs:>6}s  run {iteration}: stop {:.2} ms ({} segments)",
                case.stop_latency_ms, case.segments
            );
            cases.push(case);
        }
    }
    let _ = std::fs::remove_dir_all(&scratch);

    let lengths = args
        .lengths_secs
        .iter()
        .map(|&secs| {
            let latencies: Vec<f64> = cases
                .iter()
                .filter(|c| c.session_secs == secs)
                .map(|c| c.stop_latency_ms)
                .collect();
            summarize(secs, latencies)
        })
        .collect();

    let summary = Summary {
        window_secs: args.window_secs,
        segment_secs: args.segment_secs,
        sample_rate: args.sample_rate,
        iterations: args.iterations,
        lengths,
        cases,
    };
    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    match &args.output {
        Some(path) => std::fs::write(path, json).map_err(|e| e.to_string())?,
        None => println!("{json}"),
    }
    Ok(())
}

fn run_case(
    args: &Args,
    scratch: &std::path::Path,
    session_secs: u64,
    iteration: usize,
) -> Result<CaseResult, String> {
    let config = RecorderConfig {
        window_secs: args.window_secs,
        segment_secs: args.segment_secs,
        sample_rate: args.sample_rate,
        output_dir: scratch.to_path_buf(),
        ..args.base.clone()
    };
    let store = Arc::new(WavStore::new(scratch).map_err(|e| e.to_string())?);
    let clock = ManualClock::new();
    let mut setup = SessionSetup::new(config, store);
    setup.clock = Arc::new(clock.clone());
    setup.timer_rotation = false;

    let (mut session, _inbox) =
        RecordingSession::begin(setup, Box::new(StubEncoder::new(Pacing::Manual, 20)))
            .map_err(|e| e.to_string())?;
    let segment_secs = session.config().segment_secs;
    let format = AudioFormat {
        sample_rate: session.config().sample_rate,
        channels: session.config().channels,
    };
    let segment_audio = StubEncoder::tone_chunks(format, 1_000, Duration::from_secs(segment_secs));

    let mut recorded = 0;
    while recorded < session_secs {
        let secs = segment_secs.min(session_secs - recorded);
        let offset = Duration::from_secs(recorded);
        for chunk in segment_audio.iter().take(secs as usize) {
            let chunk = EncodedChunk::new(offset + chunk.pts, chunk.samples.clone());
            session.ingest(chunk).map_err(|e| e.to_string())?;
        }
        clock.advance(Duration::from_secs(secs));
        recorded += secs;
        if recorded < session_secs {
            session.rotate().map_err(|e| e.to_string())?;
        }
    }
    // Only the final segment's merge should land inside the timed stop.
    session.retention_snapshot();

    let started = Instant::now();
    let recording = session.finish().map_err(|e| e.to_string())?;
    let stop_latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
    let _ = std::fs::remove_file(&recording.path);

    Ok(CaseResult {
        session_secs,
        iteration,
        stop_latency_ms,
        duration_ms: recording.duration_ms,
        segments: recording.segments_recorded,
    })
}

fn summarize(session_secs: u64, mut latencies: Vec<f64>) -> LengthSummary {
    latencies.sort_by(|a, b| a.total_cmp(b));
    let runs = latencies.len();
    let avg = if runs == 0 {
        0.0
    } else {
        latencies.iter().sum::<f64>() / runs as f64
    };
    LengthSummary {
        session_secs,
        runs,
        p50_latency_ms: percentile(&latencies, 0.50),
        p95_latency_ms: percentile(&latencies, 0.95),
        avg_latency_ms: avg,
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
