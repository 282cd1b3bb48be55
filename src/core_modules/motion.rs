// THEORY:
// The `MotionSmoother` turns raw device-attitude samples into a steady motion vector
// that drives how fast the cluster scene scrolls. Raw attitude is noisy, so each
// sample is measured against a calibrated reference attitude and passed through a
// single-pole low-pass filter:
//
//     output = previous_output · (1 − α) + delta · α
//
// The filter assumes samples arrive at a roughly uniform cadence; α is expressed in
// samples, not seconds.
//
// Sensor delivery, UI calibration and the render loop all touch the smoother from
// different contexts. Filter state lives behind one mutex, and the filtered vector is
// also published through a `watch` channel so the render loop reads a whole vector
// snapshot without ever contending with the sensor path.

use std::f64::consts::{PI, TAU};
use std::ops::{Add, Mul};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};

/// Default smoothing factor: about a six-sample time constant, ~0.1 s at 60 Hz.
pub const DEFAULT_SMOOTHING: f64 = 0.15;

/// Device attitude in radians.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Orientation {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl Orientation {
    pub fn new(roll: f64, pitch: f64, yaw: f64) -> Self {
        Self { roll, pitch, yaw }
    }

    pub fn is_finite(&self) -> bool {
        self.roll.is_finite() && self.pitch.is_finite() && self.yaw.is_finite()
    }

    /// Per-axis angular difference `self − reference`, wrapped into (−π, π].
    pub fn delta_from(&self, reference: &Orientation) -> Vector3 {
        Vector3::new(
            wrap_angle(self.roll - reference.roll),
            wrap_angle(self.pitch - reference.pitch),
            wrap_angle(self.yaw - reference.yaw),
        )
    }
}

fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI { wrapped + TAU } else { wrapped }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Axis {
    X,
    Y,
    Z,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub const ZERO: Vector3 = Vector3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn component(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }
}

impl Add for Vector3 {
    type Output = Vector3;
    fn add(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Mul<f64> for Vector3 {
    type Output = Vector3;
    fn mul(self, rhs: f64) -> Vector3 {
        Vector3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Maps a smoothed motion vector to a scene scroll speed (field units per second).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScrollMapping {
    /// Speed with the device at its reference attitude, or with no motion data.
    pub base_speed: f64,
    /// Added speed per radian of smoothed deflection along `axis`.
    pub gain: f64,
    pub axis: Axis,
}

impl Default for ScrollMapping {
    fn default() -> Self {
        Self {
            base_speed: 40.0,
            gain: 120.0,
            axis: Axis::Y,
        }
    }
}

impl ScrollMapping {
    pub fn speed(&self, motion: Option<Vector3>) -> f64 {
        match motion {
            Some(vector) => self.base_speed + self.gain * vector.component(self.axis),
            None => self.base_speed,
        }
    }
}

#[derive(Debug, Default)]
struct FilterState {
    reference: Option<Orientation>,
    last_raw: Option<Orientation>,
    output: Option<Vector3>,
    calibrate_pending: bool,
    stopped: bool,
}

/// Low-pass filtered attitude relative to a calibrated reference.
#[derive(Debug)]
pub struct MotionSmoother {
    alpha: f64,
    state: Mutex<FilterState>,
    snapshot: watch::Sender<Option<Vector3>>,
}

impl MotionSmoother {
    /// `alpha` is clamped into (0, 1]; non-finite values fall back to the default.
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() && alpha > 0.0 { alpha.min(1.0) } else { DEFAULT_SMOOTHING };
        let (snapshot, _) = watch::channel(None);
        Self {
            alpha,
            state: Mutex::new(FilterState::default()),
            snapshot,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    fn state(&self) -> MutexGuard<'_, FilterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the latest raw sample as the new reference and zeroes the filter.
    /// Without any sample yet, the next one becomes the reference. Also resumes a
    /// stopped smoother.
    pub fn calibrate(&self) {
        let mut state = self.state();
        state.stopped = false;
        match state.last_raw {
            Some(raw) => {
                state.reference = Some(raw);
                state.output = Some(Vector3::ZERO);
                state.calibrate_pending = false;
                info!(roll = raw.roll, pitch = raw.pitch, yaw = raw.yaw, "motion reference calibrated");
            }
            None => {
                state.output = None;
                state.calibrate_pending = true;
                debug!("calibration deferred until the first motion sample");
            }
        }
        self.snapshot.send_replace(state.output);
    }

    /// Filters one raw sample. Returns `None` while stopped, and for a sample with a
    /// non-finite component, which is discarded without touching the filter.
    pub fn sample(&self, raw: Orientation) -> Option<Vector3> {
        let mut state = self.state();
        if state.stopped || !raw.is_finite() {
            return None;
        }
        state.last_raw = Some(raw);

        let reference = match state.reference {
            Some(reference) if !state.calibrate_pending => reference,
            _ => {
                state.reference = Some(raw);
                state.calibrate_pending = false;
                state.output = Some(Vector3::ZERO);
                raw
            }
        };

        let delta = raw.delta_from(&reference);
        let previous = state.output.unwrap_or(Vector3::ZERO);
        let filtered = previous * (1.0 - self.alpha) + delta * self.alpha;
        state.output = Some(filtered);
        self.snapshot.send_replace(Some(filtered));
        Some(filtered)
    }

    /// Halts filtering until the next `calibrate`. Readers see no motion data.
    pub fn stop(&self) {
        let mut state = self.state();
        if !state.stopped {
            info!("motion sampling stopped");
        }
        state.stopped = true;
        self.snapshot.send_replace(None);
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    /// The last raw sample received, unfiltered. `None` before any data.
    pub fn current_orientation(&self) -> Option<Orientation> {
        self.state().last_raw
    }

    pub fn reference(&self) -> Option<Orientation> {
        self.state().reference
    }

    /// The latest filtered vector. `None` before any data or while stopped.
    pub fn smoothed(&self) -> Option<Vector3> {
        *self.snapshot.borrow()
    }

    /// Latest-value handoff of the filtered vector for the render loop.
    pub fn subscribe(&self) -> watch::Receiver<Option<Vector3>> {
        self.snapshot.subscribe()
    }
}

impl Default for MotionSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTHING)
    }
}
