//! Fitting a logistic dropout model from a labelled sheet.

use chrono::Utc;
use linfa::prelude::*;
use linfa_logistic::LogisticRegression;
use ndarray::{Array1, Array2, Axis};
use std::path::Path;
use tracing::{info, warn};

use crate::data::{self, LABEL_COLUMN};
use crate::error::{AppError, Result};
use crate::model::{
    Classifier, LogisticModel, ModelArtifact, StandardScaler, StudentFeatures, StudentInput,
    FEATURE_COLUMNS,
};

#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub features: Array2<f64>,
    pub targets: Array1<bool>,
}

impl TrainingSet {
    pub fn from_rows(rows: &[(StudentInput, bool)]) -> Result<Self> {
        let flat: Vec<f64> = rows
            .iter()
            .flat_map(|(input, _)| StudentFeatures::from_input(input).as_slice().to_vec())
            .collect();
        let features = Array2::from_shape_vec((rows.len(), FEATURE_COLUMNS.len()), flat)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let targets = rows.iter().map(|(_, label)| *label).collect();
        Ok(Self { features, targets })
    }

    pub fn class_counts(&self) -> (usize, usize) {
        let dropouts = self.targets.iter().filter(|&&t| t).count();
        (dropouts, self.targets.len() - dropouts)
    }
}

pub fn load_training_set<P: AsRef<Path>>(path: P) -> Result<TrainingSet> {
    let file = std::fs::File::open(path)?;
    let sheet = data::parse_sheet(file)?;

    for failure in &sheet.failures {
        warn!(row = failure.row_number, reason = %failure.message, "skipping training row");
    }

    let mut rows = Vec::with_capacity(sheet.rows.len());
    for row in sheet.rows {
        match row.label {
            Some(label) => rows.push((row.input, label)),
            None => {
                return Err(AppError::InvalidSchema {
                    missing: vec![LABEL_COLUMN.to_string()],
                })
            }
        }
    }
    if rows.is_empty() && sheet.failures.is_empty() {
        return Err(AppError::Validation("training sheet has no rows".to_string()));
    }

    info!(rows = rows.len(), failed = sheet.failures.len(), "loaded training sheet");
    TrainingSet::from_rows(&rows)
}

/// Adds a few anchor students when either class has fewer than two examples,
/// so the optimiser always sees both outcomes.
pub fn enhance_data_if_needed(set: TrainingSet) -> Result<TrainingSet> {
    let (dropouts, stays) = set.class_counts();
    info!(dropouts, stays, "class distribution");

    if dropouts >= 2 && stays >= 2 {
        return Ok(set);
    }

    warn!("adding synthetic anchor rows for training");
    let anchor = |grade, attendance, absence, behavior: &str, label| {
        (
            StudentInput {
                final_grade: grade,
                attendance,
                absence,
                behavior: behavior.to_string(),
            },
            label,
        )
    };
    let anchors = TrainingSet::from_rows(&[
        anchor(18.0, 95.0, 5.0, "positivo", false),
        anchor(15.0, 88.0, 12.0, "neutral", false),
        anchor(5.0, 40.0, 60.0, "agresivo", true),
        anchor(8.0, 55.0, 45.0, "neutral", true),
    ])?;

    let features = ndarray::concatenate(Axis(0), &[anchors.features.view(), set.features.view()])
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let targets = ndarray::concatenate(Axis(0), &[anchors.targets.view(), set.targets.view()])
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(TrainingSet { features, targets })
}

/// Column means and population standard deviations.
pub fn fit_scaler(features: &Array2<f64>) -> StandardScaler {
    let n_features = features.ncols();
    let mean = features
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(n_features));
    let scale = features.std_axis(Axis(0), 0.0);
    StandardScaler {
        mean: mean.to_vec(),
        scale: scale.mapv(|s| if s == 0.0 { 1.0 } else { s }).to_vec(),
    }
}

pub fn calculate_accuracy(predictions: &Array1<bool>, targets: &Array1<bool>) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    predictions
        .iter()
        .zip(targets.iter())
        .filter(|(&pred, &actual)| pred == actual)
        .count() as f64
        / targets.len() as f64
}

pub fn train_logistic(set: &TrainingSet, max_iterations: u64) -> Result<ModelArtifact> {
    let scaler = fit_scaler(&set.features);
    let mean = Array1::from_vec(scaler.mean.clone());
    let scale = Array1::from_vec(scaler.scale.clone());
    let scaled = (&set.features - &mean) / &scale;

    info!(rows = scaled.nrows(), max_iterations, "training logistic regression");
    let dataset = Dataset::new(scaled.clone(), set.targets.clone());
    let fitted = LogisticRegression::default()
        .max_iterations(max_iterations)
        .fit(&dataset)
        .map_err(|e| AppError::Model(format!("training failed: {}", e)))?;

    let predictions = fitted.predict(&scaled);
    let accuracy = calculate_accuracy(&predictions, &set.targets);

    // The fitted probabilities refer to one of the two labels; orient them
    // so the exported model always scores the dropout class.
    let probabilities = fitted.predict_probabilities(&scaled);
    let agreement = predictions
        .iter()
        .zip(probabilities.iter())
        .filter(|(&pred, &p)| pred == (p >= 0.5))
        .count();
    let sign = if agreement * 2 >= predictions.len() { 1.0 } else { -1.0 };

    let logistic = LogisticModel {
        intercept: sign * fitted.intercept(),
        coefficients: fitted.params().mapv(|w| sign * w).to_vec(),
    };

    info!(accuracy, "model trained");

    let artifact = ModelArtifact {
        version: format!("logistic-{}", Utc::now().format("%Y%m%d%H%M%S")),
        feature_columns: FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(),
        scaler,
        classifier: Classifier::Logistic(logistic),
        accuracy: Some(accuracy),
        trained_at: Some(Utc::now().to_rfc3339()),
    };
    artifact.validate()?;
    Ok(artifact)
}
