// THEORY:
// The classifier gives each cluster a physical reading. Different particles leave
// characteristic footprints on a pixel detector:
//
// - Gamma: photons convert in a single point and deposit into one to a few pixels.
// - Beta: electrons scatter and leave short, curly tracks.
// - Muon: minimum-ionizing and fast, they cross the sensor in a straight line.
// - Alpha: heavy and slow, they dump a lot of charge into a large round blob.
//
// The footprint is summarized as a `ClusterShape` (hit count, energy, elongation and
// RMS radius derived from the second moments of the hit coordinates) and classified
// with a short list of threshold rules, checked in order.

use std::fmt;

/// Variance of a uniform distribution over one pixel. Keeps single-row tracks
/// from having an infinite elongation.
const PIXEL_VARIANCE: f64 = 1.0 / 12.0;

/// Geometric summary of a cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterShape {
    pub hits: u32,
    pub energy: f64,
    /// Ratio of major to minor axis. A straight track of length L gives ≈ L; a disc gives 1.
    pub elongation: f64,
    pub rms_radius: f64,
}

impl ClusterShape {
    /// Builds a shape from the coordinate covariance matrix of the hits.
    pub fn from_covariance(hits: u32, energy: f64, cxx: f64, cyy: f64, cxy: f64) -> Self {
        let half_trace = (cxx + cyy) / 2.0;
        let det = cxx * cyy - cxy * cxy;
        let disc = (half_trace * half_trace - det).max(0.0).sqrt();
        let major = (half_trace + disc).max(0.0);
        let minor = (half_trace - disc).max(0.0);
        Self {
            hits,
            energy,
            elongation: ((major + PIXEL_VARIANCE) / (minor + PIXEL_VARIANCE)).sqrt(),
            rms_radius: (major + minor).sqrt(),
        }
    }

    pub fn mean_count(&self) -> f64 {
        if self.hits == 0 {
            0.0
        } else {
            self.energy / self.hits as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParticleKind {
    Alpha,
    Beta,
    Gamma,
    Muon,
    Unknown,
}

impl ParticleKind {
    pub const ALL: [ParticleKind; 5] = [
        ParticleKind::Alpha,
        ParticleKind::Beta,
        ParticleKind::Gamma,
        ParticleKind::Muon,
        ParticleKind::Unknown,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ParticleKind::Alpha => "alpha",
            ParticleKind::Beta => "beta",
            ParticleKind::Gamma => "gamma",
            ParticleKind::Muon => "muon",
            ParticleKind::Unknown => "unknown",
        }
    }

    /// Greek-letter tag used on scene labels.
    pub fn symbol(&self) -> &'static str {
        match self {
            ParticleKind::Alpha => "α",
            ParticleKind::Beta => "β",
            ParticleKind::Gamma => "γ",
            ParticleKind::Muon => "μ",
            ParticleKind::Unknown => "?",
        }
    }
}

impl fmt::Display for ParticleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Threshold rules for `classify`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterClassifier {
    pub muon_min_hits: u32,
    pub muon_min_elongation: f64,
    pub alpha_min_hits: u32,
    pub alpha_max_elongation: f64,
    pub alpha_min_mean_count: f64,
    pub gamma_max_hits: u32,
}

impl Default for ClusterClassifier {
    fn default() -> Self {
        Self {
            muon_min_hits: 8,
            muon_min_elongation: 4.0,
            alpha_min_hits: 6,
            alpha_max_elongation: 1.8,
            alpha_min_mean_count: 80.0,
            gamma_max_hits: 4,
        }
    }
}

impl ClusterClassifier {
    pub fn classify(&self, shape: &ClusterShape) -> ParticleKind {
        if shape.hits == 0 {
            return ParticleKind::Unknown;
        }
        if shape.hits >= self.muon_min_hits && shape.elongation >= self.muon_min_elongation {
            return ParticleKind::Muon;
        }
        if shape.hits >= self.alpha_min_hits
            && shape.elongation < self.alpha_max_elongation
            && shape.mean_count() >= self.alpha_min_mean_count
        {
            return ParticleKind::Alpha;
        }
        if shape.hits <= self.gamma_max_hits {
            return ParticleKind::Gamma;
        }
        ParticleKind::Beta
    }
}
