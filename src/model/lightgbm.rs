//! LightGBM command-line backend.

use ndarray::Array2;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use super::search::BoosterParams;
use crate::error::{PipelineError, Result};

/// Learning task handed to the library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    Ranking,
    Binary,
}

impl Objective {
    fn lightgbm_args(&self, eval_at: usize) -> Vec<String> {
        match self {
            Objective::Ranking => vec![
                "objective=lambdarank".to_string(),
                "metric=ndcg".to_string(),
                format!("eval_at={}", eval_at),
            ],
            Objective::Binary => vec!["objective=binary".to_string(), "metric=auc".to_string()],
        }
    }
}

/// Features, labels and race group sizes in row order
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub features: Array2<f64>,
    pub labels: Vec<f64>,
    pub groups: Vec<usize>,
}

pub struct FitRequest<'a> {
    pub objective: Objective,
    pub params: &'a BoosterParams,
    pub train: &'a TrainingSet,
    pub valid: &'a TrainingSet,
    pub seed: u64,
    pub eval_at: usize,
    pub early_stopping_rounds: u32,
}

/// Gradient-boosting library behind a narrow interface
pub trait RankerBackend {
    /// Train one model and return it in LightGBM text format
    fn fit(&self, request: &FitRequest<'_>) -> Result<String>;
}

impl<B: RankerBackend + ?Sized> RankerBackend for &B {
    fn fit(&self, request: &FitRequest<'_>) -> Result<String> {
        (**self).fit(request)
    }
}

/// Drives the `lightgbm` executable through temporary LibSVM files
#[derive(Debug, Clone)]
pub struct LightGbmCli {
    executable: PathBuf,
}

impl LightGbmCli {
    pub fn new(executable: PathBuf) -> Self {
        Self { executable }
    }

    /// Configured path, then `LIGHTGBM_BIN`, then `lightgbm` on `PATH`.
    pub fn resolve(configured: Option<&str>) -> Result<Self> {
        if let Some(path) = configured.filter(|p| !p.is_empty()) {
            return Ok(Self::new(PathBuf::from(path)));
        }
        if let Some(path) = std::env::var_os("LIGHTGBM_BIN") {
            return Ok(Self::new(PathBuf::from(path)));
        }
        find_in_path("lightgbm").map(Self::new).ok_or_else(|| {
            PipelineError::ExternalLibrary(
                "lightgbm executable not found; set training.lightgbm_executable or LIGHTGBM_BIN"
                    .to_string(),
            )
        })
    }
}

impl RankerBackend for LightGbmCli {
    fn fit(&self, request: &FitRequest<'_>) -> Result<String> {
        let workdir = tempfile::tempdir()?;
        let train_path = workdir.path().join("train.svm");
        let valid_path = workdir.path().join("valid.svm");
        let model_path = workdir.path().join("model.txt");

        write_libsvm(request.train, &train_path)?;
        write_libsvm(request.valid, &valid_path)?;
        if request.objective == Objective::Ranking {
            write_queries(request.train, &train_path)?;
            write_queries(request.valid, &valid_path)?;
        }

        let mut args = vec!["task=train".to_string()];
        args.extend(request.objective.lightgbm_args(request.eval_at));
        args.extend(request.params.to_args());
        args.extend([
            format!("data={}", train_path.display()),
            format!("valid_data={}", valid_path.display()),
            format!("output_model={}", model_path.display()),
            format!("seed={}", request.seed),
            "deterministic=true".to_string(),
            "force_row_wise=true".to_string(),
            "num_threads=1".to_string(),
            "verbosity=-1".to_string(),
        ]);
        if request.early_stopping_rounds > 0 {
            args.push(format!("early_stopping_round={}", request.early_stopping_rounds));
        }

        debug!(executable = %self.executable.display(), ?args, "launching LightGBM");
        let output = Command::new(&self.executable)
            .args(&args)
            .output()
            .map_err(|e| {
                PipelineError::ExternalLibrary(format!(
                    "failed to launch {}: {}",
                    self.executable.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(PipelineError::ExternalLibrary(format!(
                "training exited with {}: {}",
                output.status,
                last_lines(&detail, 5)
            )));
        }

        let text = fs::read_to_string(&model_path).map_err(|e| {
            PipelineError::ExternalLibrary(format!("training produced no model file: {}", e))
        })?;
        info!(
            rows = request.train.labels.len(),
            groups = request.train.groups.len(),
            "LightGBM training complete"
        );
        Ok(text)
    }
}

fn write_libsvm(set: &TrainingSet, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for (label, row) in set.labels.iter().zip(set.features.rows()) {
        let mut line = format!("{}", label);
        for (idx, value) in row.iter().enumerate() {
            line.push_str(&format!(" {}:{:.10}", idx, value));
        }
        line.push('\n');
        writer.write_all(line.as_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Group sizes next to the data file, as `<data>.query`
fn write_queries(set: &TrainingSet, dataset_path: &Path) -> Result<()> {
    let mut os: OsString = dataset_path.as_os_str().to_os_string();
    os.push(".query");
    let mut writer = BufWriter::new(File::create(PathBuf::from(os))?);
    for size in &set.groups {
        writeln!(writer, "{}", size)?;
    }
    writer.flush()?;
    Ok(())
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path_value = std::env::var_os("PATH")?;
    std::env::split_paths(&path_value)
        .map(|entry| entry.join(binary))
        .find(|candidate| candidate.is_file())
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..].join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn small_set() -> TrainingSet {
        TrainingSet {
            features: array![[0.5, 1.0], [0.25, 0.0], [1.0, 2.0]],
            labels: vec![18.0, 17.0, 18.0],
            groups: vec![2, 1],
        }
    }

    #[test]
    fn test_write_libsvm_and_queries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.svm");
        write_libsvm(&small_set(), &path).unwrap();
        write_queries(&small_set(), &path).unwrap();

        let data = fs::read_to_string(&path).unwrap();
        let first = data.lines().next().unwrap();
        assert_eq!(first, "18 0:0.5000000000 1:1.0000000000");
        assert_eq!(data.lines().count(), 3);

        let queries = fs::read_to_string(dir.path().join("train.svm.query")).unwrap();
        assert_eq!(queries, "2\n1\n");
    }

    #[test]
    fn test_missing_executable_is_library_failure() {
        let backend = LightGbmCli::new(PathBuf::from("/nonexistent/lightgbm"));
        let set = small_set();
        let params = BoosterParams::default();
        let err = backend
            .fit(&FitRequest {
                objective: Objective::Ranking,
                params: &params,
                train: &set,
                valid: &set,
                seed: 42,
                eval_at: 10,
                early_stopping_rounds: 30,
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::ExternalLibrary(_)));
    }

    #[test]
    fn test_last_lines() {
        assert_eq!(last_lines("a\n\nb\nc\n", 2), "b | c");
        assert_eq!(last_lines("", 3), "");
    }
}
