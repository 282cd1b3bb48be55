// THEORY:
// The `pipeline` module is the top-level API of the viewer. It wires the building blocks
// into the two flows the application runs:
//
//   detector frame → FrameBufferPool::fill_next → FrameStats → classify
//                  → ClusterScene node (+ label) → rate counters
//   render tick    → motion snapshot → scroll speed → ClusterScene::scroll → cull
//                  → present held frames → recycle frames whose hold time ran out
//
// `ViewerPipeline` belongs to the render loop. It never blocks on producers: frames
// filled by capture workers arrive through `drain_workers`, and the motion vector is
// read from the smoother's latest-value channel. Pool exhaustion drops the frame and
// is counted, never waited on.

use crate::core_modules::classifier::{ClusterClassifier, ParticleKind};
use crate::core_modules::cluster_scene::{ClusterScene, NodeId, SceneConfig};
use crate::core_modules::frame_buffer::{DetectorFrame, FrameStats};
use crate::core_modules::frame_buffer_pool::{FrameBufferPool, SharedSurface};
use crate::core_modules::motion::{DEFAULT_SMOOTHING, MotionSmoother, ScrollMapping, Vector3};
use crate::core_modules::rate_counter::{DEFAULT_WINDOW_TICKS, RateCounter};
use crate::error::{PipelineError, PoolError};
use crate::parallel_pipeline::{CaptureOutcome, CaptureWorkers};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Configuration for the ViewerPipeline.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ViewerConfig {
    pub detector_width: u32,
    pub detector_height: u32,
    pub pool_capacity: usize,
    /// Render ticks a filled frame stays on screen before its buffer is recycled.
    pub frame_hold_ticks: u32,
    /// Nominal render rate, used for per-second rates.
    pub tick_hz: f64,
    /// Attach a label to every new cluster node.
    pub label_clusters: bool,
    pub smoothing: f64,
    /// Capture workers; 0 means one per CPU.
    pub workers: usize,
    pub rate_window_ticks: usize,
    pub scroll: ScrollMapping,
    pub scene: SceneConfig,
    pub classifier: ClusterClassifier,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            detector_width: 256,
            detector_height: 256,
            pool_capacity: 16,
            frame_hold_ticks: 30,
            tick_hz: 60.0,
            label_clusters: true,
            smoothing: DEFAULT_SMOOTHING,
            workers: 0,
            rate_window_ticks: DEFAULT_WINDOW_TICKS,
            scroll: ScrollMapping::default(),
            scene: SceneConfig::default(),
            classifier: ClusterClassifier::default(),
        }
    }
}

impl ViewerConfig {
    /// Defaults overlaid with `TPX_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from any key → value source. Unparseable values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring malformed configuration value");
                    None
                }
            }
        }

        if let Some(v) = parse(&lookup, "TPX_POOL_CAPACITY") {
            self.pool_capacity = v;
        }
        if let Some(v) = parse(&lookup, "TPX_FRAME_HOLD_TICKS") {
            self.frame_hold_ticks = v;
        }
        if let Some(v) = parse(&lookup, "TPX_SCROLL_BASE_SPEED") {
            self.scroll.base_speed = v;
        }
        if let Some(v) = parse(&lookup, "TPX_SCROLL_GAIN") {
            self.scroll.gain = v;
        }
        if let Some(v) = parse(&lookup, "TPX_SMOOTHING") {
            self.smoothing = v;
        }
        if let Some(v) = parse(&lookup, "TPX_WORKERS") {
            self.workers = v;
        }
        self
    }

    pub fn worker_count(&self) -> usize {
        if self.workers == 0 { num_cpus::get() } else { self.workers }
    }
}

/// What happened to one accepted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub stats: FrameStats,
    pub kind: ParticleKind,
    pub node: NodeId,
}

/// What one render tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickReport {
    pub speed: f64,
    pub culled: usize,
    pub presented: usize,
    pub recycled: usize,
}

/// Running counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineStats {
    pub accepted_frames: u64,
    pub dropped_frames: u64,
    pub rejected_frames: u64,
    pub ticks: u64,
}

#[derive(Debug, Clone, Copy)]
struct HeldFrame {
    index: usize,
    ticks_left: u32,
}

/// The render-loop owner of the pool, scene and counters.
pub struct ViewerPipeline {
    config: ViewerConfig,
    pool: Arc<FrameBufferPool>,
    scene: ClusterScene,
    rates: RateCounter,
    motion: watch::Receiver<Option<Vector3>>,
    held: Vec<HeldFrame>,
    stats: PipelineStats,
}

impl ViewerPipeline {
    /// Builds the pool on `surface` and subscribes to `motion` for scroll speed.
    pub fn new(config: ViewerConfig, surface: SharedSurface, motion: &MotionSmoother) -> Self {
        let pool = Arc::new(FrameBufferPool::initialize(surface, config.pool_capacity));
        let mut scene = ClusterScene::new(config.scene.clone());
        if config.label_clusters {
            scene.add_label_container();
        }
        Self {
            rates: RateCounter::new(config.rate_window_ticks),
            held: Vec::with_capacity(config.pool_capacity),
            motion: motion.subscribe(),
            stats: PipelineStats::default(),
            pool,
            scene,
            config,
        }
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    /// The shared pool, for handing to capture workers.
    pub fn pool(&self) -> &Arc<FrameBufferPool> {
        &self.pool
    }

    pub fn scene(&self) -> &ClusterScene {
        &self.scene
    }

    pub fn rates(&self) -> &RateCounter {
        &self.rates
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Fills a buffer with `frame` on the calling thread. Returns `None` when the
    /// pool is exhausted and the frame was dropped.
    pub fn ingest(&mut self, frame: &DetectorFrame) -> Result<Option<FrameReport>, PipelineError> {
        match self.pool.fill_next(frame.samples(), frame.max_count, frame.seed) {
            Ok(stats) => Ok(Some(self.accept_filled(stats)?)),
            Err(PoolError::Exhausted) => {
                self.record_drop();
                Ok(None)
            }
            Err(err) => {
                self.stats.rejected_frames += 1;
                Err(err.into())
            }
        }
    }

    /// Applies every outcome the capture workers have produced so far.
    pub fn drain_workers(&mut self, workers: &mut CaptureWorkers) -> Result<Vec<FrameReport>, PipelineError> {
        let mut reports = Vec::new();
        while let Some(outcome) = workers.try_next() {
            match outcome {
                CaptureOutcome::Filled(stats) => reports.push(self.accept_filled(stats)?),
                CaptureOutcome::Dropped => self.record_drop(),
                CaptureOutcome::Rejected(err) => {
                    self.stats.rejected_frames += 1;
                    warn!(error = %err, "capture worker rejected a frame");
                }
            }
        }
        Ok(reports)
    }

    fn record_drop(&mut self) {
        self.stats.dropped_frames += 1;
        warn!(dropped = self.stats.dropped_frames, "frame buffer pool exhausted, dropping frame");
    }

    /// Turns a filled buffer into a scene node, label and rate sample.
    fn accept_filled(&mut self, stats: FrameStats) -> Result<FrameReport, PipelineError> {
        let kind = self.config.classifier.classify(&stats.shape);
        let node = self.scene.add_cluster_node(&stats, kind);
        if self.config.label_clusters {
            self.scene.add_label_for_node(node, &format!("cluster-{}", node.0))?;
        }
        self.rates.record(kind);
        self.held.push(HeldFrame {
            index: stats.index,
            ticks_left: self.config.frame_hold_ticks,
        });
        self.stats.accepted_frames += 1;
        debug!(index = stats.index, %kind, energy = stats.energy, hits = stats.hits, "cluster accepted");
        Ok(FrameReport { stats, kind, node })
    }

    /// Scroll speed from the latest motion snapshot.
    pub fn current_speed(&self) -> f64 {
        self.config.scroll.speed(*self.motion.borrow())
    }

    /// One render tick of `dt` seconds.
    pub fn tick(&mut self, dt: f64) -> Result<TickReport, PipelineError> {
        let speed = self.current_speed();
        let offscreen = self.scene.scroll(dt, speed);
        let culled = self.scene.cull(&offscreen);
        let presented = self.pool.present_filled();

        let mut recycled = 0;
        let mut still_held = Vec::with_capacity(self.held.len());
        for mut frame in self.held.drain(..) {
            frame.ticks_left = frame.ticks_left.saturating_sub(1);
            if frame.ticks_left == 0 {
                self.pool.clear(frame.index)?;
                recycled += 1;
            } else {
                still_held.push(frame);
            }
        }
        self.held = still_held;

        self.rates.end_tick();
        self.stats.ticks += 1;
        Ok(TickReport {
            speed,
            culled,
            presented,
            recycled,
        })
    }

    /// Presents every held frame defocused to `lens_position` (0 sharp, 1 blurred).
    pub fn apply_focus(&self, lens_position: f32) -> Result<(), PipelineError> {
        for frame in &self.held {
            self.pool.animate(frame.index, lens_position)?;
        }
        Ok(())
    }

    /// Frames currently on screen.
    pub fn held_frames(&self) -> usize {
        self.held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::motion::{Axis, Orientation};
    use crate::core_modules::surface::Compositor;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn config(capacity: usize, hold: u32) -> ViewerConfig {
        ViewerConfig {
            pool_capacity: capacity,
            frame_hold_ticks: hold,
            scroll: ScrollMapping { base_speed: 10.0, gain: 100.0, axis: Axis::Y },
            ..ViewerConfig::default()
        }
    }

    fn pipeline(capacity: usize, hold: u32) -> (ViewerPipeline, MotionSmoother) {
        let smoother = MotionSmoother::new(1.0);
        let surface: SharedSurface = Arc::new(Mutex::new(Compositor::new(256, 256)));
        (ViewerPipeline::new(config(capacity, hold), surface, &smoother), smoother)
    }

    fn gamma_frame() -> DetectorFrame {
        let mut frame = DetectorFrame::default();
        frame.push(10, 20, 30);
        frame
    }

    #[test]
    fn ingest_places_labelled_node() {
        let (mut pipeline, _smoother) = pipeline(4, 10);
        let report = pipeline.ingest(&gamma_frame()).unwrap().unwrap();
        assert_eq!(report.kind, ParticleKind::Gamma);
        assert_eq!(report.stats.index, 0);
        assert_eq!(pipeline.scene().node_count(), 1);
        assert_eq!(pipeline.scene().label_count(), 1);
        assert_eq!(pipeline.rates().total(ParticleKind::Gamma), 1);
    }

    #[test]
    fn exhausted_pool_drops_frames() {
        let (mut pipeline, _smoother) = pipeline(2, 10);
        assert!(pipeline.ingest(&gamma_frame()).unwrap().is_some());
        assert!(pipeline.ingest(&gamma_frame()).unwrap().is_some());
        assert!(pipeline.ingest(&gamma_frame()).unwrap().is_none());
        assert_eq!(pipeline.stats().dropped_frames, 1);
        assert_eq!(pipeline.stats().accepted_frames, 2);
    }

    #[test]
    fn invalid_frames_are_rejected() {
        let (mut pipeline, _smoother) = pipeline(2, 10);
        let mut frame = gamma_frame();
        frame.y.push(3);
        assert!(matches!(
            pipeline.ingest(&frame),
            Err(PipelineError::Pool(PoolError::LengthMismatch { .. }))
        ));
        assert_eq!(pipeline.stats().rejected_frames, 1);
        assert_eq!(pipeline.pool().free_count(), 2);
    }

    #[test]
    fn frames_are_recycled_after_hold_time() {
        let (mut pipeline, _smoother) = pipeline(1, 2);
        pipeline.ingest(&gamma_frame()).unwrap();
        assert_eq!(pipeline.tick(1.0 / 60.0).unwrap().recycled, 0);
        assert_eq!(pipeline.tick(1.0 / 60.0).unwrap().recycled, 1);
        assert_eq!(pipeline.pool().free_count(), 1);
        assert!(pipeline.ingest(&gamma_frame()).unwrap().is_some());
    }

    #[test]
    fn tick_speed_follows_motion_snapshot() {
        let (mut pipeline, smoother) = pipeline(2, 10);
        assert_eq!(pipeline.tick(0.1).unwrap().speed, 10.0);

        smoother.sample(Orientation::default());
        smoother.sample(Orientation::new(0.0, 0.5, 0.0));
        let report = pipeline.tick(0.1).unwrap();
        assert_eq!(report.speed, 60.0);

        smoother.stop();
        assert_eq!(pipeline.tick(0.1).unwrap().speed, 10.0);
    }

    #[test]
    fn scrolled_out_clusters_are_culled_with_labels() {
        let (mut pipeline, _smoother) = pipeline(4, 1000);
        pipeline.ingest(&gamma_frame()).unwrap();
        // The default viewport is 1024 wide; at 10 units/s this clears it.
        let report = pipeline.tick(200.0).unwrap();
        assert_eq!(report.culled, 1);
        assert_eq!(pipeline.scene().node_count(), 0);
        assert_eq!(pipeline.scene().label_count(), 0);
    }

    #[test]
    fn focus_applies_to_held_frames() {
        let (mut pipeline, _smoother) = pipeline(2, 10);
        pipeline.apply_focus(0.5).unwrap();
        pipeline.ingest(&gamma_frame()).unwrap();
        pipeline.apply_focus(0.5).unwrap();
        assert_eq!(pipeline.held_frames(), 1);
    }

    #[test]
    fn overrides_are_parsed_and_bad_values_ignored() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TPX_POOL_CAPACITY", "8"),
            ("TPX_SCROLL_GAIN", "2.5"),
            ("TPX_WORKERS", "not-a-number"),
        ]);
        let config = ViewerConfig::default().with_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.pool_capacity, 8);
        assert_eq!(config.scroll.gain, 2.5);
        assert_eq!(config.workers, 0);
        assert!(config.worker_count() >= 1);
    }
}
