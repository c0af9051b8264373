//! Native evaluator for LightGBM text models.
//!
//! Leaf values in the text format already include shrinkage, so a raw score
//! is the plain sum of tree outputs.

use ndarray::{Array2, ArrayView1};

use crate::error::{PipelineError, Result};

const ZERO_THRESHOLD: f64 = 1e-35;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MissingType {
    None,
    Zero,
    NaN,
}

#[derive(Debug, Clone)]
struct Tree {
    split_feature: Vec<usize>,
    threshold: Vec<f64>,
    default_left: Vec<bool>,
    missing: Vec<MissingType>,
    /// Negative entries are leaves, encoded as `!leaf_index`
    left_child: Vec<i32>,
    right_child: Vec<i32>,
    leaf_value: Vec<f64>,
}

impl Tree {
    fn predict(&self, features: ArrayView1<'_, f64>) -> f64 {
        if self.split_feature.is_empty() {
            return self.leaf_value[0];
        }
        let mut node = 0usize;
        loop {
            let mut value = features[self.split_feature[node]];
            let missing = self.missing[node];
            if missing != MissingType::NaN && value.is_nan() {
                value = 0.0;
            }
            let use_default = match missing {
                MissingType::Zero => value.abs() <= ZERO_THRESHOLD,
                MissingType::NaN => value.is_nan(),
                MissingType::None => false,
            };
            let go_left = if use_default {
                self.default_left[node]
            } else {
                value <= self.threshold[node]
            };
            let next = if go_left {
                self.left_child[node]
            } else {
                self.right_child[node]
            };
            if next < 0 {
                return self.leaf_value[!next as usize];
            }
            node = next as usize;
        }
    }
}

/// Parsed gradient-boosted tree ensemble
#[derive(Debug, Clone)]
pub struct Booster {
    trees: Vec<Tree>,
    num_features: usize,
    objective: String,
}

impl Booster {
    pub fn parse(text: &str) -> Result<Self> {
        let mut num_features = None;
        let mut objective = String::new();
        let mut trees = Vec::new();
        let mut block: Option<Vec<(&str, &str)>> = None;

        for line in text.lines().map(str::trim) {
            if line == "end of trees" {
                break;
            }
            if line.starts_with("Tree=") {
                if let Some(fields) = block.take() {
                    trees.push(parse_tree(&fields, trees.len())?);
                }
                block = Some(Vec::new());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match block.as_mut() {
                Some(fields) => fields.push((key, value)),
                None => match key {
                    "max_feature_idx" => {
                        let idx: usize = value.parse().map_err(|_| {
                            PipelineError::ModelFormat(format!("bad max_feature_idx '{}'", value))
                        })?;
                        num_features = Some(idx + 1);
                    }
                    "objective" => objective = value.to_string(),
                    "num_class" if value != "1" => {
                        return Err(PipelineError::ModelFormat(format!(
                            "multiclass models are not supported (num_class={})",
                            value
                        )));
                    }
                    _ => {}
                },
            }
        }
        if let Some(fields) = block.take() {
            trees.push(parse_tree(&fields, trees.len())?);
        }

        let num_features = num_features
            .ok_or_else(|| PipelineError::ModelFormat("missing max_feature_idx".to_string()))?;
        if trees.is_empty() {
            return Err(PipelineError::ModelFormat("no trees found".to_string()));
        }
        if let Some(bad) = trees
            .iter()
            .flat_map(|t| t.split_feature.iter())
            .find(|&&f| f >= num_features)
        {
            return Err(PipelineError::ModelFormat(format!(
                "split on feature {} but model declares {} features",
                bad, num_features
            )));
        }

        Ok(Self {
            trees,
            num_features,
            objective,
        })
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn objective(&self) -> &str {
        &self.objective
    }

    /// Raw scores, one per matrix row
    pub fn predict(&self, features: &Array2<f64>) -> Result<Vec<f64>> {
        if features.ncols() != self.num_features {
            return Err(PipelineError::SchemaMismatch(format!(
                "model expects {} features, got {}",
                self.num_features,
                features.ncols()
            )));
        }
        Ok(features
            .rows()
            .into_iter()
            .map(|row| self.trees.iter().map(|t| t.predict(row)).sum())
            .collect())
    }
}

fn parse_tree(fields: &[(&str, &str)], index: usize) -> Result<Tree> {
    let field = |name: &str| fields.iter().find(|(k, _)| *k == name).map(|(_, v)| *v);
    let list = |name: &str| field(name).unwrap_or("");

    let num_leaves: usize = field("num_leaves")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| PipelineError::ModelFormat(format!("tree {} has no num_leaves", index)))?;

    let leaf_value: Vec<f64> = parse_list(list("leaf_value"), "leaf_value", index)?;
    if leaf_value.len() != num_leaves {
        return Err(PipelineError::ModelFormat(format!(
            "tree {} declares {} leaves but has {} values",
            index,
            num_leaves,
            leaf_value.len()
        )));
    }

    let internal = num_leaves.saturating_sub(1);
    let split_feature: Vec<usize> = parse_list(list("split_feature"), "split_feature", index)?;
    let threshold: Vec<f64> = parse_list(list("threshold"), "threshold", index)?;
    let left_child: Vec<i32> = parse_list(list("left_child"), "left_child", index)?;
    let right_child: Vec<i32> = parse_list(list("right_child"), "right_child", index)?;
    let decision_type: Vec<u8> = if internal == 0 {
        Vec::new()
    } else {
        parse_list(list("decision_type"), "decision_type", index)?
    };

    for (name, len) in [
        ("split_feature", split_feature.len()),
        ("threshold", threshold.len()),
        ("left_child", left_child.len()),
        ("right_child", right_child.len()),
        ("decision_type", decision_type.len()),
    ] {
        if len != internal {
            return Err(PipelineError::ModelFormat(format!(
                "tree {} has {} {} entries, expected {}",
                index, len, name, internal
            )));
        }
    }

    let in_range = |c: i32| {
        if c < 0 {
            (!c as usize) < num_leaves
        } else {
            (c as usize) < internal
        }
    };
    if !left_child.iter().chain(&right_child).all(|&c| in_range(c)) {
        return Err(PipelineError::ModelFormat(format!(
            "tree {} has a child index out of range",
            index
        )));
    }
    if decision_type.iter().any(|d| d & 1 != 0) {
        return Err(PipelineError::ModelFormat(format!(
            "tree {} uses categorical splits",
            index
        )));
    }

    Ok(Tree {
        default_left: decision_type.iter().map(|d| d & 2 != 0).collect(),
        missing: decision_type
            .iter()
            .map(|d| match (d >> 2) & 3 {
                1 => MissingType::Zero,
                2 => MissingType::NaN,
                _ => MissingType::None,
            })
            .collect(),
        split_feature,
        threshold,
        left_child,
        right_child,
        leaf_value,
    })
}

fn parse_list<T: std::str::FromStr>(raw: &str, name: &str, index: usize) -> Result<Vec<T>> {
    raw.split_whitespace()
        .map(|v| {
            v.parse().map_err(|_| {
                PipelineError::ModelFormat(format!("tree {} has bad {} value '{}'", index, name, v))
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::array;

    /// Two-feature model: f0 <= 0.5 -> -0.1, else f1 <= 0.3 -> 0.2 else 0.3;
    /// plus a constant second tree.
    pub(crate) const SMALL_MODEL: &str = "tree
version=v4
num_class=1
num_tree_per_iteration=1
label_index=0
max_feature_idx=1
objective=lambdarank
feature_names=f0 f1

Tree=0
num_leaves=3
num_cat=0
split_feature=0 1
split_gain=100 50
threshold=0.5 0.29999999999999999
decision_type=2 2
left_child=-1 -2
right_child=1 -3
leaf_value=-0.10000000000000001 0.20000000000000001 0.29999999999999999
leaf_weight=100 200 300
leaf_count=100 200 300
internal_value=0 0
internal_weight=0 0
internal_count=600 500
is_linear=0
shrinkage=1


Tree=1
num_leaves=1
num_cat=0
split_feature=
split_gain=
threshold=
decision_type=
left_child=
right_child=
leaf_value=0.01
leaf_weight=
leaf_count=
internal_value=
internal_weight=
internal_count=
is_linear=0
shrinkage=1


end of trees

feature_importances:
f0=1
f1=1
";

    #[test]
    fn test_parse_and_predict() {
        let booster = Booster::parse(SMALL_MODEL).unwrap();
        assert_eq!(booster.num_trees(), 2);
        assert_eq!(booster.num_features(), 2);
        assert_eq!(booster.objective(), "lambdarank");

        let scores = booster
            .predict(&array![[0.3, 0.0], [0.6, 0.1], [0.6, 0.5]])
            .unwrap();
        assert!((scores[0] - (-0.1 + 0.01)).abs() < 1e-12);
        assert!((scores[1] - (0.2 + 0.01)).abs() < 1e-12);
        assert!((scores[2] - (0.3 + 0.01)).abs() < 1e-12);
    }

    #[test]
    fn test_threshold_is_inclusive_left() {
        let booster = Booster::parse(SMALL_MODEL).unwrap();
        let scores = booster.predict(&array![[0.5, 0.0]]).unwrap();
        assert!((scores[0] - (-0.09)).abs() < 1e-12);
    }

    #[test]
    fn test_zero_missing_uses_default_direction() {
        // missing type zero (4) with default-left bit clear: 0.0 goes right
        let text = SMALL_MODEL.replace("decision_type=2 2", "decision_type=4 2");
        let booster = Booster::parse(&text).unwrap();
        let scores = booster.predict(&array![[0.0, 0.0]]).unwrap();
        assert!((scores[0] - 0.21).abs() < 1e-12);
    }

    #[test]
    fn test_feature_count_mismatch() {
        let booster = Booster::parse(SMALL_MODEL).unwrap();
        let err = booster.predict(&array![[0.3, 0.0, 1.0]]).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch(_)));
    }

    #[test]
    fn test_malformed_models_rejected() {
        assert!(Booster::parse("tree\nmax_feature_idx=1\n").is_err());
        let no_header = SMALL_MODEL.replace("max_feature_idx=1\n", "");
        assert!(Booster::parse(&no_header).is_err());
        let short = SMALL_MODEL.replace("threshold=0.5 0.29999999999999999", "threshold=0.5");
        assert!(Booster::parse(&short).is_err());
        let categorical = SMALL_MODEL.replace("decision_type=2 2", "decision_type=1 2");
        assert!(Booster::parse(&categorical).is_err());
    }
}
