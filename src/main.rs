// Demo runner for the `tpx_viewer` library.
//
// Feeds synthetic detector frames through the capture workers, simulates a slowly
// tilting device for the scroll speed, and logs per-kind rates once a second.
// `TPX_DEMO_SECONDS` bounds the run (default 10); `RUST_LOG` controls verbosity.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tpx_viewer::core_modules::classifier::ParticleKind;
use tpx_viewer::core_modules::demo_source::DemoSource;
use tpx_viewer::core_modules::frame_buffer_pool::SharedSurface;
use tpx_viewer::core_modules::motion::{MotionSmoother, Orientation};
use tpx_viewer::core_modules::surface::Compositor;
use tpx_viewer::{CaptureWorkers, ViewerConfig, ViewerPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ViewerConfig::from_env();
    let seconds: u64 = std::env::var("TPX_DEMO_SECONDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10);
    info!(?config, seconds, "viewer demo starting");

    let surface: SharedSurface = Arc::new(Mutex::new(Compositor::new(
        config.detector_width,
        config.detector_height,
    )));
    let smoother = Arc::new(MotionSmoother::new(config.smoothing));
    let mut pipeline = ViewerPipeline::new(config.clone(), surface, &smoother);
    let mut workers = CaptureWorkers::new(Arc::clone(pipeline.pool()), config.worker_count());

    // Attitude simulation: a gentle pitch oscillation sampled at 50 Hz.
    let sensor = {
        let smoother = Arc::clone(&smoother);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(20));
            let mut t = 0.0_f64;
            loop {
                interval.tick().await;
                t += 0.02;
                smoother.sample(Orientation::new(0.0, 0.3 * (t * 0.5).sin(), 0.05 * t.sin()));
            }
        })
    };

    let mut source = DemoSource::new(
        config.detector_width.min(u16::MAX as u32) as u16,
        config.detector_height.min(u16::MAX as u32) as u16,
        0x5EED,
    );
    let tick_hz = config.tick_hz.max(1.0);
    let dt = 1.0 / tick_hz;
    let mut render = tokio::time::interval(Duration::from_secs_f64(dt));
    let total_ticks = (seconds as f64 * tick_hz) as u64;

    for tick in 0..total_ticks {
        render.tick().await;

        // Roughly one frame every other tick.
        if tick % 2 == 0 {
            let (_, frame) = source.next_frame();
            workers.submit(frame)?;
        }
        pipeline.drain_workers(&mut workers)?;
        let report = pipeline.tick(dt)?;

        if tick % tick_hz as u64 == 0 {
            let rates: Vec<String> = ParticleKind::ALL
                .iter()
                .map(|&kind| format!("{}={:.2}/s", kind.name(), pipeline.rates().rate_per_second(kind, tick_hz)))
                .collect();
            info!(
                speed = report.speed,
                nodes = pipeline.scene().node_count(),
                held = pipeline.held_frames(),
                rates = %rates.join(" "),
                "viewer status"
            );
        }
    }

    sensor.abort();
    smoother.stop();
    let remaining = workers.shutdown().await;
    info!(stats = ?pipeline.stats(), undrained = remaining.len(), "viewer demo finished");
    Ok(())
}
