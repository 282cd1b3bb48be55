// THEORY:
// `CaptureWorkers` moves buffer filling off the render loop. Detector frames are
// submitted to a dispatcher task that hands them round-robin to a fixed set of worker
// tasks; each worker fills the next free buffer of the shared pool and reports the
// outcome on a results channel. The render loop drains that channel once per tick
// (`ViewerPipeline::drain_workers`) and never waits on a producer.
//
// The pool's own per-buffer locks make concurrent `fill_next` calls safe, so workers
// share nothing but the `Arc<FrameBufferPool>`.

use crate::core_modules::frame_buffer::{DetectorFrame, FrameStats};
use crate::core_modules::frame_buffer_pool::FrameBufferPool;
use crate::error::{PipelineError, PoolError};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Result of one submitted frame.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Filled(FrameStats),
    /// The pool had no free buffer.
    Dropped,
    Rejected(PoolError),
}

pub struct CaptureWorkers {
    task_sender: Option<mpsc::UnboundedSender<DetectorFrame>>,
    results: mpsc::UnboundedReceiver<CaptureOutcome>,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl CaptureWorkers {
    /// Spawns `worker_count` workers (at least one) on the current tokio runtime.
    pub fn new(pool: Arc<FrameBufferPool>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<DetectorFrame>();
        let (result_sender, results) = mpsc::unbounded_channel::<CaptureOutcome>();

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..worker_count)
            .map(|_| mpsc::unbounded_channel::<DetectorFrame>())
            .unzip();

        let dispatcher = tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(frame) = task_receiver.recv().await {
                if worker_senders[worker_idx].send(frame).is_err() {
                    break;
                }
                worker_idx = (worker_idx + 1) % worker_senders.len();
            }
        });

        let workers = worker_receivers
            .into_iter()
            .enumerate()
            .map(|(id, mut receiver)| {
                let pool = Arc::clone(&pool);
                let results = result_sender.clone();
                tokio::spawn(async move {
                    while let Some(frame) = receiver.recv().await {
                        let outcome = match pool.fill_next(frame.samples(), frame.max_count, frame.seed) {
                            Ok(stats) => CaptureOutcome::Filled(stats),
                            Err(PoolError::Exhausted) => CaptureOutcome::Dropped,
                            Err(err) => CaptureOutcome::Rejected(err),
                        };
                        if results.send(outcome).is_err() {
                            break;
                        }
                    }
                    debug!(worker = id, "capture worker finished");
                })
            })
            .collect();

        info!(workers = worker_count, "capture workers started");
        Self {
            task_sender: Some(task_sender),
            results,
            dispatcher,
            workers,
        }
    }

    /// Queues a frame for filling.
    pub fn submit(&self, frame: DetectorFrame) -> Result<(), PipelineError> {
        let sender = self.task_sender.as_ref().ok_or(PipelineError::WorkerPoolClosed)?;
        sender.send(frame).map_err(|_| PipelineError::WorkerPoolClosed)
    }

    /// The next finished outcome, if one is ready.
    pub fn try_next(&mut self) -> Option<CaptureOutcome> {
        self.results.try_recv().ok()
    }

    /// Waits for the next outcome; `None` once every worker has finished.
    pub async fn next(&mut self) -> Option<CaptureOutcome> {
        self.results.recv().await
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting frames, lets queued frames finish and joins every task.
    /// Outcomes not yet drained are returned.
    pub async fn shutdown(mut self) -> Vec<CaptureOutcome> {
        self.task_sender.take();
        let _ = self.dispatcher.await;
        join_all(self.workers.drain(..)).await;

        let mut remaining = Vec::new();
        while let Ok(outcome) = self.results.try_recv() {
            remaining.push(outcome);
        }
        info!(remaining = remaining.len(), "capture workers shut down");
        remaining
    }
}
