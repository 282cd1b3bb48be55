// THEORY:
// `RateCounter` keeps a short memory of how many clusters of each particle kind were
// seen per render tick. The window is a fixed-length FIFO, so the reported rate tracks
// the recent past and forgets old bursts on its own.

use crate::core_modules::classifier::ParticleKind;
use std::collections::{BTreeMap, VecDeque};

pub const DEFAULT_WINDOW_TICKS: usize = 120;

/// Sliding-window hit counters, one FIFO per particle kind.
#[derive(Debug, Clone)]
pub struct RateCounter {
    window: usize,
    /// Counts accumulated during the tick in progress.
    pending: BTreeMap<ParticleKind, u32>,
    fifos: BTreeMap<ParticleKind, VecDeque<u32>>,
    totals: BTreeMap<ParticleKind, u64>,
}

impl RateCounter {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        let fifos = ParticleKind::ALL
            .iter()
            .map(|kind| (*kind, VecDeque::with_capacity(window + 1)))
            .collect();
        Self {
            window,
            pending: BTreeMap::new(),
            fifos,
            totals: BTreeMap::new(),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Counts one cluster in the current tick.
    pub fn record(&mut self, kind: ParticleKind) {
        *self.pending.entry(kind).or_insert(0) += 1;
        *self.totals.entry(kind).or_insert(0) += 1;
    }

    /// Closes the current tick, pushing its counts into every FIFO.
    pub fn end_tick(&mut self) {
        for (kind, fifo) in self.fifos.iter_mut() {
            fifo.push_back(self.pending.get(kind).copied().unwrap_or(0));
            if fifo.len() > self.window {
                fifo.pop_front();
            }
        }
        self.pending.clear();
    }

    /// Clusters of `kind` inside the window.
    pub fn windowed(&self, kind: ParticleKind) -> u32 {
        self.fifos.get(&kind).map_or(0, |fifo| fifo.iter().sum())
    }

    /// Average clusters per second over the filled part of the window.
    pub fn rate_per_second(&self, kind: ParticleKind, tick_hz: f64) -> f64 {
        let ticks = self.fifos.get(&kind).map_or(0, |fifo| fifo.len());
        if ticks == 0 || tick_hz <= 0.0 {
            return 0.0;
        }
        self.windowed(kind) as f64 * tick_hz / ticks as f64
    }

    /// All clusters of `kind` ever recorded.
    pub fn total(&self, kind: ParticleKind) -> u64 {
        self.totals.get(&kind).copied().unwrap_or(0)
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_TICKS)
    }
}
