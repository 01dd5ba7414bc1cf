//! smartcore-backed logistic regression: the supervised model behind the
//! bottom-event classifier.
//!
//! Grounded on the dependency pulled in via `examples/other_examples/
//! manifests/Zuytan-rustrade/Cargo.toml` (the sibling repo closest to this
//! one that ships an ML backend); no teacher file trains a model, so the
//! Fit/Predict split and error mapping follow the teacher's own
//! `retriever.rs`/`database.rs` "thin wrapper around a library call,
//! mapped into our own error type" shape.

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::arrays::Array;
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::linear::logistic_regression::{LogisticRegression, LogisticRegressionParameters};

#[derive(Serialize, Deserialize)]
pub struct TrainedModel {
    pub feature_names: Vec<String>,
    inner: LogisticRegression<f64, i32, DenseMatrix<f64>, Vec<i32>>,
}

impl TrainedModel {
    pub fn fit(feature_names: &[String], rows: &[Vec<f64>], labels: &[i32]) -> PipelineResult<Self> {
        if rows.is_empty() {
            return Err(PipelineError::Data("cannot fit a model on zero samples".into()));
        }
        let matrix = DenseMatrix::from_2d_vec(&rows.to_vec());
        let inner = LogisticRegression::fit(&matrix, &labels.to_vec(), LogisticRegressionParameters::default())
            .map_err(|e| PipelineError::Data(format!("logistic regression fit failed: {e}")))?;
        Ok(TrainedModel {
            feature_names: feature_names.to_vec(),
            inner,
        })
    }

    /// Sigmoid of the linear decision function, read directly off the
    /// fitted coefficients/intercept rather than through `predict`, since
    /// the training service needs calibrated probabilities, not class
    /// labels.
    pub fn predict_proba(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        let coef = self.inner.coefficients();
        let intercept = self.inner.intercept();
        rows.iter()
            .map(|row| {
                let mut z = *intercept.get((0, 0));
                for (j, v) in row.iter().enumerate() {
                    z += v * coef.get((0, j));
                }
                1.0 / (1.0 + (-z).exp())
            })
            .collect()
    }

    pub fn to_bytes(&self) -> PipelineResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| PipelineError::Integrity(format!("model serialize failed: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> PipelineResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| PipelineError::Integrity(format!("model deserialize failed: {e}")))
    }
}
