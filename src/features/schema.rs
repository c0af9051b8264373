//! Declared feature columns and their missing-value policy.

use crate::error::{PipelineError, Result};

/// Neutral value for bounded [0, 1] performance scores
pub const NEUTRAL_SCORE: f64 = 0.5;

/// How a feature is filled when the underlying history is absent
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureKind {
    /// Bounded score; missing means the midpoint of `[lo, hi]`
    Ratio { lo: f64, hi: f64 },
    /// Count of events; missing means zero
    Count,
    /// Signed delta or z-score; missing means zero ("no evidence")
    Relative,
    /// Race or runner attribute with a declared typical value
    Measure { default: f64 },
}

impl FeatureKind {
    pub fn default_value(&self) -> f64 {
        match *self {
            FeatureKind::Ratio { lo, hi } => (lo + hi) / 2.0,
            FeatureKind::Count | FeatureKind::Relative => 0.0,
            FeatureKind::Measure { default } => default,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FeatureKind::Ratio { .. } => "ratio",
            FeatureKind::Count => "count",
            FeatureKind::Relative => "relative",
            FeatureKind::Measure { .. } => "measure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureSpec {
    pub name: &'static str,
    pub kind: FeatureKind,
}

const UNIT: FeatureKind = FeatureKind::Ratio { lo: 0.0, hi: 1.0 };

const fn spec(name: &'static str, kind: FeatureKind) -> FeatureSpec {
    FeatureSpec { name, kind }
}

/// Feature columns in model input order
pub const STANDARD_FEATURES: [FeatureSpec; 24] = [
    // Race conditions
    spec("distance", FeatureKind::Measure { default: 0.0 }),
    spec("field_size", FeatureKind::Measure { default: 0.0 }),
    spec("going_code", FeatureKind::Measure { default: 1.0 }),
    spec("current_class_score", FeatureKind::Ratio { lo: 0.2, hi: 3.0 }),
    spec("post_ratio", UNIT),
    // Runner
    spec("age", FeatureKind::Measure { default: 4.0 }),
    spec("weight_carried", FeatureKind::Measure { default: 55.0 }),
    spec("weight_zscore", FeatureKind::Relative),
    spec("weight_deviation", FeatureKind::Relative),
    // Trailing history
    spec("career_starts", FeatureKind::Count),
    spec("rest_days", FeatureKind::Count),
    spec("past_score", FeatureKind::Count),
    spec("recent_rel_finish_3", UNIT),
    spec("recent_rel_finish_5", UNIT),
    spec("recent_rel_finish_std_5", FeatureKind::Ratio { lo: 0.0, hi: 0.5 }),
    spec("last3f_index", FeatureKind::Relative),
    spec("distance_change", FeatureKind::Relative),
    spec("class_score_change", FeatureKind::Relative),
    // Aptitudes
    spec("distance_aptitude", UNIT),
    spec("surface_aptitude", UNIT),
    spec("direction_aptitude", UNIT),
    // Same race
    spec("same_race_zscore", FeatureKind::Relative),
    // Connections
    spec("jockey_recent_score", UNIT),
    spec("trainer_recent_score", UNIT),
];

/// Ordered subset of [`STANDARD_FEATURES`] a model consumes
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSchema {
    specs: Vec<FeatureSpec>,
}

impl FeatureSchema {
    pub fn standard() -> Self {
        Self {
            specs: STANDARD_FEATURES.to_vec(),
        }
    }

    /// Drop the named columns, keeping the order of the rest.
    pub fn without(&self, excluded: &[String]) -> Result<Self> {
        if let Some(unknown) = excluded
            .iter()
            .find(|name| !self.specs.iter().any(|s| s.name == name.as_str()))
        {
            return Err(PipelineError::SchemaMismatch(format!(
                "cannot exclude unknown feature '{}'",
                unknown
            )));
        }
        let specs: Vec<FeatureSpec> = self
            .specs
            .iter()
            .filter(|s| !excluded.iter().any(|name| name == s.name))
            .copied()
            .collect();
        if specs.is_empty() {
            return Err(PipelineError::SchemaMismatch(
                "every feature was excluded".to_string(),
            ));
        }
        Ok(Self { specs })
    }

    pub fn columns(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.name.to_string()).collect()
    }

    pub fn specs(&self) -> &[FeatureSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }
}

pub fn standard_index(name: &str) -> Option<usize> {
    STANDARD_FEATURES.iter().position(|s| s.name == name)
}
