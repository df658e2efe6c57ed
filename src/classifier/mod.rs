//! Patient classification boundary.
//!
//! The engine only needs `classify(features) -> cluster`. `NearestCentroid`
//! is the reference implementation; it owns its centroid table and is handed
//! to the experiment at setup.

use crate::error::{SimError, SimResult};
use serde::{Deserialize, Serialize};

pub type ClusterId = usize;

/// Number of features consumed by the classifier, in `PatientFeatures::to_vector` order.
pub const FEATURE_COUNT: usize = 11;

pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "age",
    "diagnosis_admission1",
    "diagnosis_admission2",
    "diagnosis_admission3",
    "diagnosis_admission4",
    "apache",
    "respiratory_insufficiency",
    "artificial_ventilation",
    "icu_stay",
    "ventilation_time",
    "pre_icu_stay",
];

/// Clinical inputs of one patient, already validated by the ingestion layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientFeatures {
    pub age: f64,
    pub diagnosis_admission1: f64,
    pub diagnosis_admission2: f64,
    pub diagnosis_admission3: f64,
    pub diagnosis_admission4: f64,
    pub apache: f64,
    pub respiratory_insufficiency: f64,
    pub artificial_ventilation: f64,
    pub icu_stay: f64,
    pub ventilation_time: f64,
    pub pre_icu_stay: f64,
}

impl PatientFeatures {
    pub fn to_vector(&self) -> [f64; FEATURE_COUNT] {
        [
            self.age,
            self.diagnosis_admission1,
            self.diagnosis_admission2,
            self.diagnosis_admission3,
            self.diagnosis_admission4,
            self.apache,
            self.respiratory_insufficiency,
            self.artificial_ventilation,
            self.icu_stay,
            self.ventilation_time,
            self.pre_icu_stay,
        ]
    }

    pub fn is_ventilated(&self) -> bool {
        self.artificial_ventilation != 0.0
    }
}

pub trait Classifier: Send + Sync {
    fn classify(&self, features: &PatientFeatures) -> ClusterId;
    fn n_clusters(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct NearestCentroid {
    centroids: Vec<[f64; FEATURE_COUNT]>,
}

impl NearestCentroid {
    /// Build from centroid rows. Rows may carry trailing columns; only the
    /// first `FEATURE_COUNT` are used.
    pub fn new(rows: &[Vec<f64>]) -> SimResult<Self> {
        if rows.is_empty() {
            return Err(SimError::InvalidParameter(
                "centroid table must contain at least one cluster".to_string(),
            ));
        }

        let mut centroids = Vec::with_capacity(rows.len());
        for (cluster, row) in rows.iter().enumerate() {
            if row.len() < FEATURE_COUNT {
                return Err(SimError::InvalidParameter(format!(
                    "centroid {} has {} columns, need at least {}",
                    cluster,
                    row.len(),
                    FEATURE_COUNT
                )));
            }
            let mut centroid = [0.0; FEATURE_COUNT];
            centroid.copy_from_slice(&row[..FEATURE_COUNT]);
            if centroid.iter().any(|v| !v.is_finite()) {
                return Err(SimError::InvalidParameter(format!(
                    "centroid {} contains a non-finite value",
                    cluster
                )));
            }
            centroids.push(centroid);
        }

        Ok(Self { centroids })
    }
}

impl Classifier for NearestCentroid {
    fn classify(&self, features: &PatientFeatures) -> ClusterId {
        let point = features.to_vector();
        let mut best = (0, f64::INFINITY);

        for (cluster, centroid) in self.centroids.iter().enumerate() {
            let dist: f64 = centroid
                .iter()
                .zip(point.iter())
                .map(|(c, p)| (c - p).powi(2))
                .sum();
            // Strict comparison keeps the lowest index on ties.
            if dist < best.1 {
                best = (cluster, dist);
            }
        }

        best.0
    }

    fn n_clusters(&self) -> usize {
        self.centroids.len()
    }
}

/// Inclusive per-feature range that cohort records must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBounds {
    pub age: Bound,
    pub apache: Bound,
    pub icu_stay: Bound,
    pub ventilation_time: Bound,
    pub pre_icu_stay: Bound,
}

impl Default for FeatureBounds {
    fn default() -> Self {
        Self {
            age: Bound { min: 14.0, max: 100.0 },
            apache: Bound { min: 0.0, max: 36.0 },
            icu_stay: Bound { min: 0.0, max: 180.0 * 24.0 },
            ventilation_time: Bound { min: 0.0, max: 180.0 * 24.0 },
            pre_icu_stay: Bound { min: 0.0, max: 30.0 * 24.0 },
        }
    }
}

impl FeatureBounds {
    pub fn check(&self, features: &PatientFeatures) -> SimResult<()> {
        let checks = [
            ("age", features.age, self.age),
            ("apache", features.apache, self.apache),
            ("icu_stay", features.icu_stay, self.icu_stay),
            ("ventilation_time", features.ventilation_time, self.ventilation_time),
            ("pre_icu_stay", features.pre_icu_stay, self.pre_icu_stay),
        ];

        for (name, value, bound) in checks {
            if !value.is_finite() || value < bound.min || value > bound.max {
                return Err(SimError::InvalidParameter(format!(
                    "{} = {} outside [{}, {}]",
                    name, value, bound.min, bound.max
                )));
            }
        }

        if features.ventilation_time > features.icu_stay {
            return Err(SimError::InvalidParameter(format!(
                "ventilation_time {} exceeds icu_stay {}",
                features.ventilation_time, features.icu_stay
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_features() -> PatientFeatures {
        PatientFeatures {
            age: 55.0,
            diagnosis_admission1: 11.0,
            diagnosis_admission2: 0.0,
            diagnosis_admission3: 0.0,
            diagnosis_admission4: 0.0,
            apache: 20.0,
            respiratory_insufficiency: 5.0,
            artificial_ventilation: 1.0,
            icu_stay: 100.0,
            ventilation_time: 50.0,
            pre_icu_stay: 10.0,
        }
    }

    #[test]
    fn test_nearest_centroid_picks_closest() {
        let mut near = sample_features().to_vector().to_vec();
        near.extend([0.0; 7]);
        let far = vec![1000.0; 18];

        let classifier = NearestCentroid::new(&[far, near]).unwrap();
        assert_eq!(classifier.n_clusters(), 2);
        assert_eq!(classifier.classify(&sample_features()), 1);
    }

    #[test]
    fn test_short_centroid_row_rejected() {
        let result = NearestCentroid::new(&[vec![1.0; FEATURE_COUNT - 1]]);
        assert!(matches!(result, Err(SimError::InvalidParameter(_))));
    }

    #[test]
    fn test_bounds() {
        let bounds = FeatureBounds::default();
        assert!(bounds.check(&sample_features()).is_ok());

        let mut old = sample_features();
        old.age = 120.0;
        assert!(bounds.check(&old).is_err());

        let mut inconsistent = sample_features();
        inconsistent.ventilation_time = 200.0;
        assert!(bounds.check(&inconsistent).is_err());
    }

    #[test]
    fn test_feature_names_match_vector() {
        assert_eq!(FEATURE_NAMES.len(), sample_features().to_vector().len());
    }
}
