//! Hyperparameter search space and seeded random search.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// LightGBM parameters explored by the search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoosterParams {
    pub num_leaves: u32,
    pub max_depth: u32,
    pub learning_rate: f64,
    pub num_iterations: u32,
    pub min_data_in_leaf: u32,
    pub bagging_fraction: f64,
    pub feature_fraction: f64,
    pub lambda_l1: f64,
    pub lambda_l2: f64,
}

impl Default for BoosterParams {
    fn default() -> Self {
        Self {
            num_leaves: 31,
            max_depth: 6,
            learning_rate: 0.05,
            num_iterations: 300,
            min_data_in_leaf: 20,
            bagging_fraction: 0.8,
            feature_fraction: 0.8,
            lambda_l1: 0.0,
            lambda_l2: 0.0,
        }
    }
}

impl BoosterParams {
    /// `key=value` arguments for the LightGBM CLI
    pub fn to_args(&self) -> Vec<String> {
        vec![
            format!("num_leaves={}", self.num_leaves),
            format!("max_depth={}", self.max_depth),
            format!("learning_rate={}", self.learning_rate),
            format!("num_iterations={}", self.num_iterations),
            format!("min_data_in_leaf={}", self.min_data_in_leaf),
            format!("bagging_fraction={}", self.bagging_fraction),
            // bagging only takes effect with a non-zero frequency
            "bagging_freq=1".to_string(),
            format!("feature_fraction={}", self.feature_fraction),
            format!("lambda_l1={}", self.lambda_l1),
            format!("lambda_l2={}", self.lambda_l2),
        ]
    }
}

/// Source of candidate parameter sets, tried in order
pub trait ParamSearch {
    fn candidates(&self) -> Vec<BoosterParams>;
}

/// Uniform/log-uniform sampling over a fixed space, reproducible by seed
#[derive(Debug, Clone)]
pub struct RandomSearch {
    pub trials: usize,
    pub seed: u64,
}

fn log_uniform(rng: &mut ChaCha8Rng, lo: f64, hi: f64) -> f64 {
    rng.gen_range(lo.ln()..=hi.ln()).exp()
}

impl ParamSearch for RandomSearch {
    fn candidates(&self) -> Vec<BoosterParams> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        (0..self.trials)
            .map(|_| BoosterParams {
                num_leaves: rng.gen_range(20..=300),
                max_depth: rng.gen_range(3..=12),
                learning_rate: log_uniform(&mut rng, 1e-3, 0.3),
                num_iterations: rng.gen_range(100..=1000),
                min_data_in_leaf: rng.gen_range(5..=100),
                bagging_fraction: rng.gen_range(0.5..=1.0),
                feature_fraction: rng.gen_range(0.5..=1.0),
                lambda_l1: log_uniform(&mut rng, 1e-8, 10.0),
                lambda_l2: log_uniform(&mut rng, 1e-8, 10.0),
            })
            .collect()
    }
}
