// THEORY:
// Error types for the viewer. Each subsystem gets its own enum so callers can
// match on exactly the conditions that subsystem can produce. Pool exhaustion
// is a normal backpressure signal rather than a failure; it lives in `PoolError`
// only so that `fill_next` can report it through the same `Result`.
//
// Missing motion data has no variant here: it is modelled as
// `Option::None` by the smoother.

use crate::core_modules::cluster_scene::NodeId;
use thiserror::Error;

/// Conditions reported by the `FrameBufferPool`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Every buffer is claimed or filled. The caller should drop the frame.
    #[error("no free frame buffer available")]
    Exhausted,
    #[error("buffer index {index} out of range for pool of {capacity}")]
    IndexOutOfRange { index: usize, capacity: usize },
    #[error("sample sequences differ in length: x={x}, y={y}, counts={counts}")]
    LengthMismatch { x: usize, y: usize, counts: usize },
    #[error("sample {sample} at ({x}, {y}) lies outside the {width}x{height} raster")]
    PixelOutOfBounds {
        sample: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    /// Seed hits plus the fill's samples do not fit the hit counter.
    #[error("{samples} samples on top of {seed_hits} seed hits overflow the hit count")]
    HitCountOverflow { seed_hits: u32, samples: usize },
    /// A seed centroid or energy is NaN or infinite.
    #[error("fill seed has a non-finite centroid or energy")]
    NonFiniteSeed,
    /// `fill` was called on a buffer that already holds a frame.
    #[error("buffer {0} is already filled")]
    BufferInUse(usize),
    /// The operation needs a filled buffer (`animate`, `extend`).
    #[error("buffer {0} is not filled")]
    NotFilled(usize),
}

/// Conditions reported by the `ClusterScene`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SceneError {
    #[error("node {0:?} is not in the scene")]
    NodeNotFound(NodeId),
    #[error("label container has not been created")]
    NoLabelContainer,
    #[error("label key {key:?} already belongs to node {owner:?}")]
    DuplicateLabel { key: String, owner: NodeId },
}

/// Errors surfaced by the top-level pipeline and its worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error("capture worker pool is closed")]
    WorkerPoolClosed,
}
