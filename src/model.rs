//! Dropout risk classifier.
//!
//! Prepares the fixed feature vector for a student, scales it with the
//! pre-fit standard scaler stored in the model artifact and asks the
//! pre-trained classifier for the probability of the dropout class.
//! The probability is then bucketed into a [`RiskBand`].

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{AppError, Result};

pub type Probability = f64;

/// Feature order expected by every artifact.
pub const FEATURE_COLUMNS: [&str; 7] = [
    "nota_normalizada",
    "conducta_encoded",
    "asistencia_normalizada",
    "inasistencia_normalizada",
    "nota_baja",
    "alta_inasistencia",
    "conducta_problematica",
];

pub const HIGH_RISK_THRESHOLD: Probability = 0.7;
pub const MEDIUM_RISK_THRESHOLD: Probability = 0.4;
pub const DROPOUT_THRESHOLD: Probability = 0.5;

pub const PASSING_GRADE: f64 = 11.0;
pub const HIGH_ABSENCE_PERCENT: f64 = 30.0;
pub const LOW_ATTENDANCE_PERCENT: f64 = 75.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
pub enum RiskBand {
    Bajo,
    Medio,
    Alto,
}

impl RiskBand {
    /// Lower bounds are inclusive: 0.4 is Medio and 0.7 is Alto.
    pub fn from_probability(probability: Probability) -> Self {
        if probability >= HIGH_RISK_THRESHOLD {
            RiskBand::Alto
        } else if probability >= MEDIUM_RISK_THRESHOLD {
            RiskBand::Medio
        } else {
            RiskBand::Bajo
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBand::Bajo => "Bajo",
            RiskBand::Medio => "Medio",
            RiskBand::Alto => "Alto",
        }
    }
}

impl fmt::Display for RiskBand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Behavior {
    Positivo,
    Neutral,
    Agresivo,
}

impl Behavior {
    /// Unknown or empty values fall back to neutral.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "positivo" => Behavior::Positivo,
            "agresivo" => Behavior::Agresivo,
            _ => Behavior::Neutral,
        }
    }

    pub fn code(&self) -> f64 {
        match self {
            Behavior::Positivo => 0.0,
            Behavior::Neutral => 1.0,
            Behavior::Agresivo => 2.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Behavior::Positivo => "positivo",
            Behavior::Neutral => "neutral",
            Behavior::Agresivo => "agresivo",
        }
    }
}

/// Raw measurements for one student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentInput {
    /// Final grade on the 0-20 scale.
    pub final_grade: f64,
    /// Attendance percentage.
    pub attendance: f64,
    /// Absence percentage.
    #[serde(default)]
    pub absence: f64,
    #[serde(default)]
    pub behavior: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    LowGrade,
    LowAttendance,
    BehaviorIssues,
}

impl RiskFactor {
    pub fn for_student(input: &StudentInput) -> Vec<RiskFactor> {
        let mut factors = Vec::new();
        if input.final_grade < PASSING_GRADE {
            factors.push(RiskFactor::LowGrade);
        }
        if input.attendance < LOW_ATTENDANCE_PERCENT {
            factors.push(RiskFactor::LowAttendance);
        }
        if Behavior::parse(&input.behavior) == Behavior::Agresivo {
            factors.push(RiskFactor::BehaviorIssues);
        }
        factors
    }
}

/// The model-ready feature vector, in [`FEATURE_COLUMNS`] order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StudentFeatures([f64; 7]);

impl StudentFeatures {
    pub fn from_input(input: &StudentInput) -> Self {
        let behavior = Behavior::parse(&input.behavior);
        let flag = |cond: bool| if cond { 1.0 } else { 0.0 };

        StudentFeatures([
            input.final_grade / 20.0,
            behavior.code(),
            input.attendance / 100.0,
            input.absence / 100.0,
            flag(input.final_grade < PASSING_GRADE),
            flag(input.absence > HIGH_ABSENCE_PERCENT),
            flag(behavior == Behavior::Agresivo),
        ])
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn to_array(&self) -> Array1<f64> {
        Array1::from_vec(self.0.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn transform(&self, features: ArrayView1<f64>) -> Array1<f64> {
        let mean = ArrayView1::from(&self.mean[..]);
        let scale = ArrayView1::from(&self.scale[..]).mapv(|s| if s == 0.0 { 1.0 } else { s });
        (&features - &mean) / &scale
    }

    fn validate(&self, n_features: usize) -> Result<()> {
        if self.mean.len() != n_features || self.scale.len() != n_features {
            return Err(AppError::Model(format!(
                "scaler expects {} features, got mean={} scale={}",
                n_features,
                self.mean.len(),
                self.scale.len()
            )));
        }
        Ok(())
    }
}

/// Anything that maps a scaled feature vector to P(dropout).
pub trait ProbabilityModel {
    fn dropout_probability(&self, scaled: ArrayView1<f64>) -> Probability;
}

/// One fitted decision tree in scikit-learn's parallel-array layout.
/// Leaves have `children_left == -1`; `value` holds per-node class
/// weights `[no_dropout, dropout]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub children_left: Vec<i64>,
    pub children_right: Vec<i64>,
    pub feature: Vec<i64>,
    pub threshold: Vec<f64>,
    pub value: Vec<[f64; 2]>,
}

impl DecisionTree {
    fn validate(&self, index: usize, n_features: usize) -> Result<()> {
        let n_nodes = self.children_left.len();
        let invalid = |msg: String| Err(AppError::Model(format!("tree {}: {}", index, msg)));

        if n_nodes == 0 {
            return invalid("no nodes".to_string());
        }
        if self.children_right.len() != n_nodes
            || self.feature.len() != n_nodes
            || self.threshold.len() != n_nodes
            || self.value.len() != n_nodes
        {
            return invalid("node arrays differ in length".to_string());
        }

        for node in 0..n_nodes {
            let (left, right) = (self.children_left[node], self.children_right[node]);
            if left == -1 {
                continue;
            }
            for child in [left, right] {
                if child <= node as i64 || child >= n_nodes as i64 {
                    return invalid(format!("node {} has child {} out of order", node, child));
                }
            }
            let feature = self.feature[node];
            if feature < 0 || feature >= n_features as i64 {
                return invalid(format!("node {} splits on feature {}", node, feature));
            }
        }
        Ok(())
    }

    fn leaf_for(&self, scaled: ArrayView1<f64>) -> usize {
        let mut node = 0usize;
        while self.children_left[node] != -1 {
            let feature = self.feature[node] as usize;
            node = if scaled[feature] <= self.threshold[node] {
                self.children_left[node] as usize
            } else {
                self.children_right[node] as usize
            };
        }
        node
    }
}

impl ProbabilityModel for DecisionTree {
    fn dropout_probability(&self, scaled: ArrayView1<f64>) -> Probability {
        let [stay, dropout] = self.value[self.leaf_for(scaled)];
        let total = stay + dropout;
        if total > 0.0 {
            dropout / total
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub trees: Vec<DecisionTree>,
}

impl ProbabilityModel for RandomForest {
    fn dropout_probability(&self, scaled: ArrayView1<f64>) -> Probability {
        let sum: f64 = self
            .trees
            .iter()
            .map(|tree| tree.dropout_probability(scaled))
            .sum();
        sum / self.trees.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl ProbabilityModel for LogisticModel {
    fn dropout_probability(&self, scaled: ArrayView1<f64>) -> Probability {
        let weights = ArrayView1::from(&self.coefficients[..]);
        let z = self.intercept + weights.dot(&scaled);
        1.0 / (1.0 + (-z).exp())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Classifier {
    RandomForest(RandomForest),
    Logistic(LogisticModel),
}

impl Classifier {
    pub fn kind(&self) -> &'static str {
        match self {
            Classifier::RandomForest(_) => "random_forest",
            Classifier::Logistic(_) => "logistic",
        }
    }
}

impl ProbabilityModel for Classifier {
    fn dropout_probability(&self, scaled: ArrayView1<f64>) -> Probability {
        match self {
            Classifier::RandomForest(forest) => forest.dropout_probability(scaled),
            Classifier::Logistic(logistic) => logistic.dropout_probability(scaled),
        }
    }
}

/// Serialized pre-trained model: scaler plus classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: String,
    pub feature_columns: Vec<String>,
    pub scaler: StandardScaler,
    pub classifier: Classifier,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub trained_at: Option<String>,
}

impl ModelArtifact {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let artifact: ModelArtifact = serde_json::from_str(raw)?;
        artifact.validate()?;
        Ok(artifact)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Model(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let expected: Vec<&str> = FEATURE_COLUMNS.to_vec();
        let actual: Vec<&str> = self.feature_columns.iter().map(String::as_str).collect();
        if actual != expected {
            return Err(AppError::Model(format!(
                "feature columns {:?} do not match {:?}",
                actual, expected
            )));
        }

        let n_features = FEATURE_COLUMNS.len();
        self.scaler.validate(n_features)?;

        match &self.classifier {
            Classifier::RandomForest(forest) => {
                if forest.trees.is_empty() {
                    return Err(AppError::Model("forest has no trees".to_string()));
                }
                for (index, tree) in forest.trees.iter().enumerate() {
                    tree.validate(index, n_features)?;
                }
            }
            Classifier::Logistic(logistic) => {
                if logistic.coefficients.len() != n_features {
                    return Err(AppError::Model(format!(
                        "logistic model has {} coefficients, expected {}",
                        logistic.coefficients.len(),
                        n_features
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub probability: Probability,
    pub risk_band: RiskBand,
    pub predicted_dropout: bool,
    pub risk_factors: Vec<RiskFactor>,
}

impl Assessment {
    pub fn outcome_label(&self) -> &'static str {
        if self.predicted_dropout {
            "Sí deserta"
        } else {
            "No deserta"
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub version: String,
    pub classifier: String,
    pub estimators: usize,
    pub feature_columns: Vec<String>,
    pub accuracy: Option<f64>,
    pub trained_at: Option<String>,
}

/// Stateless once built; safe to share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct RiskClassifier {
    artifact: ModelArtifact,
}

impl RiskClassifier {
    pub fn new(artifact: ModelArtifact) -> Result<Self> {
        artifact.validate()?;
        Ok(Self { artifact })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let artifact = ModelArtifact::load(path)?;
        Ok(Self { artifact })
    }

    pub fn probability(&self, features: &StudentFeatures) -> Probability {
        let scaled = self.artifact.scaler.transform(features.to_array().view());
        self.artifact
            .classifier
            .dropout_probability(scaled.view())
            .clamp(0.0, 1.0)
    }

    pub fn assess(&self, input: &StudentInput) -> Assessment {
        let probability = self.probability(&StudentFeatures::from_input(input));
        Assessment {
            probability,
            risk_band: RiskBand::from_probability(probability),
            predicted_dropout: probability >= DROPOUT_THRESHOLD,
            risk_factors: RiskFactor::for_student(input),
        }
    }

    pub fn info(&self) -> ModelInfo {
        let estimators = match &self.artifact.classifier {
            Classifier::RandomForest(forest) => forest.trees.len(),
            Classifier::Logistic(_) => 1,
        };
        ModelInfo {
            version: self.artifact.version.clone(),
            classifier: self.artifact.classifier.kind().to_string(),
            estimators,
            feature_columns: self.artifact.feature_columns.clone(),
            accuracy: self.artifact.accuracy,
            trained_at: self.artifact.trained_at.clone(),
        }
    }
}
