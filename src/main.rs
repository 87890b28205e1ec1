//! EmuCam demo - runs a burst of frames through the simulated sensor
//!
//! Usage: `emucam [--config PATH] [--caps PATH] [--frames N]`; see `emucam --help`

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use emucam::{
    capabilities::DEFAULT_CAPABILITIES_JSON,
    config::{default_config_path, ProcessorConfig},
    BufferHandle, BufferStatus, CaptureEvent, CaptureRequest, ChannelCallback, FrameNumber,
    PipelineDescriptor, PipelineId, PixelFormat, RequestProcessor, RequestTemplate,
    StreamDescriptor, StreamId,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOGICAL: PipelineId = PipelineId(0);
const PHYSICAL: PipelineId = PipelineId(1);
const PREVIEW: StreamId = StreamId(0);
const JPEG: StreamId = StreamId(1);
const MONO: StreamId = StreamId(0);
const JPEG_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Parser)]
#[command(name = "emucam")]
#[command(about = "Run a burst of frames through the emulated camera")]
#[command(version)]
struct Args {
    /// Processor config (TOML); defaults to the platform data directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Capability table (JSON); defaults to the built-in table
    #[arg(long)]
    caps: Option<PathBuf>,

    /// Number of frames to submit
    #[arg(short, long, default_value = "10")]
    frames: u32,
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,emucam=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match args.config.or_else(default_config_path) {
        Some(path) if path.exists() => {
            tracing::info!("Loading config from {:?}", path);
            ProcessorConfig::load(&path)?
        }
        _ => ProcessorConfig::default(),
    };

    let caps = match &args.caps {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading capabilities from {:?}", path))?,
        None => DEFAULT_CAPABILITIES_JSON.to_string(),
    };

    let (mut processor, _mapper) = RequestProcessor::with_simulated_sensor(config)?;
    processor.initialize(&caps)?;

    let (callback, events) = ChannelCallback::new();
    let callback = Arc::new(callback);
    let pipelines = [
        PipelineDescriptor::new(
            LOGICAL,
            0,
            vec![
                StreamDescriptor::output(PREVIEW, 640, 480, PixelFormat::Ycbcr420),
                StreamDescriptor::blob(JPEG, 640, 480, JPEG_BUFFER_SIZE),
            ],
            callback.clone(),
        )?,
        PipelineDescriptor::new(
            PHYSICAL,
            1,
            vec![StreamDescriptor::output(MONO, 640, 480, PixelFormat::Y8)],
            callback,
        )?,
    ];

    tracing::info!("Submitting {} frames", args.frames);

    let mut handle = 0u64;
    let mut next_handle = || {
        handle += 1;
        BufferHandle(handle)
    };

    let mut frame = FrameNumber(0);
    for _ in 0..args.frames {
        let mut logical = CaptureRequest::new(LOGICAL)
            .with_output(PREVIEW, next_handle())
            .with_output(JPEG, next_handle());
        let mut physical = CaptureRequest::new(PHYSICAL).with_output(MONO, next_handle());

        // Later frames repeat the last settings
        if frame == FrameNumber(0) {
            let settings = processor.get_default_request(RequestTemplate::Preview)?;
            logical = logical.with_settings(settings.clone());
            physical = physical.with_settings(settings);
        }

        processor.process_pipeline_requests(frame, &[logical, physical], &pipelines)?;
        frame = frame.next();
    }

    let expected = args.frames as usize * 3;
    let (mut ok, mut failed, mut shutters) = (0usize, 0usize, 0usize);
    while ok + failed < expected {
        match events.recv_timeout(Duration::from_secs(5)) {
            Ok(CaptureEvent::Buffer { status, .. }) => match status {
                BufferStatus::Ok => ok += 1,
                BufferStatus::Error => failed += 1,
            },
            Ok(CaptureEvent::Shutter { .. }) => shutters += 1,
            Ok(CaptureEvent::RequestError {
                pipeline_id,
                frame,
                reason,
            }) => tracing::warn!("{} {} failed: {}", pipeline_id, frame, reason),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("Timed out waiting for results");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let flushed = processor.flush();
    let stats = processor.stats();

    println!("frames submitted:   {}", args.frames);
    println!("shutters:           {}", shutters);
    println!("buffers ok/failed:  {}/{}", ok, failed);
    println!("requests flushed:   {}", flushed);
    println!(
        "requests:           {} submitted, {} completed, {} failed",
        stats.submitted, stats.completed, stats.failed
    );
    println!(
        "capture time:       avg {:.1}us, jitter {}us",
        stats.avg_capture_time_us(),
        stats.jitter_us()
    );

    Ok(())
}
