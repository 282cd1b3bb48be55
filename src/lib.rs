// THEORY:
// This file is the main entry point for the `tpx_viewer` library crate.
//
// The crate renders a stream of pixel-detector frames: every frame is painted into a
// pooled off-screen buffer through a count → colour palette, summarized into a cluster
// (centroid, energy, shape), classified, and placed as a node in a scrolling scene whose
// speed follows a smoothed device-attitude signal.
//
// `ViewerPipeline` (with `ViewerConfig`) is the high-level interface; `CaptureWorkers`
// moves buffer filling onto tokio tasks. The building blocks in `core_modules` are public
// so hosts can embed the pool or the scene on their own.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use error::{PipelineError, PoolError, SceneError};
pub use parallel_pipeline::{CaptureOutcome, CaptureWorkers};
pub use pipeline::{FrameReport, PipelineStats, TickReport, ViewerConfig, ViewerPipeline};
