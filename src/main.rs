//! OVD demo: renders a synthetic pattern with the software GPU and records it
//! through the output device.
//!
//! Usage: `ovd [--frames N] [--config FILE] [device options...]`

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use ovd::{Config, OutputDevice, SoftwareFramebuffer, SoftwareGpu};

const FRAMEBUFFERS: usize = 3;

struct DemoArgs {
    frames: u64,
    config: Option<PathBuf>,
    device: Vec<String>,
}

fn parse_args() -> Result<DemoArgs> {
    let mut frames = 48;
    let mut config = None;
    let mut device = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--frames" => {
                let n = args.next().ok_or_else(|| eyre!("--frames requires a value"))?;
                frames = n.parse().wrap_err_with(|| format!("--frames {n}"))?;
            }
            "--config" => {
                config = Some(PathBuf::from(
                    args.next().ok_or_else(|| eyre!("--config requires a value"))?,
                ));
            }
            _ => device.push(arg),
        }
    }
    Ok(DemoArgs {
        frames,
        config,
        device,
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ovd=info"));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

/// Moving gradient, one byte per channel.
fn render_pattern(frame: u64, width: usize, height: usize, pixel_size: usize, out: &mut Vec<u8>) {
    out.clear();
    for y in 0..height {
        for x in 0..width {
            let v = (x + y + frame as usize) as u8;
            out.extend(std::iter::repeat(v).take(pixel_size));
        }
    }
}

fn render_loop(
    mut device: OutputDevice<SoftwareGpu>,
    frames: u64,
    stop: Arc<AtomicBool>,
) -> ovd::Result<OutputDevice<SoftwareGpu>> {
    let (width, height) = device.resolution();
    let pixel_size = device.data_format().map_or(3, |f| f.pixel_size());
    let framebuffers: Vec<_> = (0..FRAMEBUFFERS)
        .map(|id| Arc::new(SoftwareFramebuffer::filled(id as u64, width * height * pixel_size, 0)))
        .collect();

    device.bind()?;
    let start = Instant::now();
    let mut pixels = Vec::with_capacity(width * height * pixel_size);
    let mut rendered = 0;
    for frame in 0..frames {
        if stop.load(Ordering::Relaxed) {
            warn!(frame, "interrupted");
            break;
        }
        let fb = &framebuffers[frame as usize % FRAMEBUFFERS];
        if !fb.wait_released(Duration::from_secs(5)) {
            warn!(frame, "framebuffer still in read-back, rendering anyway");
        }
        render_pattern(frame, width, height, pixel_size, &mut pixels);
        fb.render(&pixels);
        device.transfer(fb)?;
        rendered += 1;
    }
    device.unbind()?;

    let elapsed = start.elapsed();
    info!(
        frames = rendered,
        ?elapsed,
        fps = rendered as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        "render loop finished"
    );
    Ok(device)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let args = parse_args()?;
    let config = Config::load(args.config.as_deref())?;
    info!("OVD launching ({} frames)", args.frames);

    let mut device = OutputDevice::new("ovd-demo", Arc::new(SoftwareGpu::new()), config);
    let mut open_args = args.device;
    if !open_args.iter().any(|a| a == "--frame-end") {
        let start = open_args
            .iter()
            .position(|a| a == "--frame-start")
            .and_then(|i| open_args.get(i + 1))
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(1);
        open_args.push("--frame-end".into());
        open_args.push((start + args.frames.max(1) as i64 - 1).to_string());
    }
    device.open(&open_args)?;
    if let Some(format) = device.format() {
        info!("recording {}", format.description);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.store(true, Ordering::Relaxed);
        }
    });

    let frames = args.frames;
    let mut device = tokio::task::spawn_blocking(move || render_loop(device, frames, stop)).await??;
    let stats = device.stats();
    device.close()?;
    info!(
        written = stats.write_count,
        dropped = stats.frames_dropped,
        "OVD shutdown complete"
    );
    Ok(())
}
