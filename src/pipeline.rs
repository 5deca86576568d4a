//! Processing one uploaded sheet: parse, classify, persist, summarise.

use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analytics::round_to;
use crate::data::{self, RowError};
use crate::database::{Database, NewPrediction, PredictionRecord, UploadOutcome, UploadRecord, UploadStatus};
use crate::error::{AppError, Result};
use crate::model::{RiskBand, RiskClassifier};

/// Predictions of one upload, as served to the dashboards.
#[derive(Debug, Clone)]
pub struct PredictionBatch {
    pub upload_id: i64,
    pub predictions: Vec<PredictionRecord>,
}

/// Each user's most recent batch, kept to spare dashboard reads a query.
#[derive(Default)]
pub struct LatestPredictions {
    batches: RwLock<HashMap<i64, Arc<PredictionBatch>>>,
}

impl LatestPredictions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, user_id: i64) -> Option<Arc<PredictionBatch>> {
        self.batches.read().await.get(&user_id).cloned()
    }

    pub async fn store(&self, user_id: i64, batch: PredictionBatch) {
        self.batches.write().await.insert(user_id, Arc::new(batch));
    }

    /// Drops every cached batch built from `upload_id`.
    pub async fn evict_upload(&self, upload_id: i64) {
        self.batches
            .write()
            .await
            .retain(|_, batch| batch.upload_id != upload_id);
    }
}

#[derive(Debug, Serialize)]
pub struct RowFailure {
    pub row: usize,
    pub message: String,
}

impl From<RowError> for RowFailure {
    fn from(err: RowError) -> Self {
        RowFailure {
            row: err.row_number,
            message: err.message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UploadReport {
    pub upload: UploadRecord,
    pub failures: Vec<RowFailure>,
    pub predictions: Vec<PredictionRecord>,
}

fn upload_status(processed: usize, failed: usize) -> UploadStatus {
    match (processed, failed) {
        (0, _) => UploadStatus::Error,
        (_, 0) => UploadStatus::Success,
        _ => UploadStatus::Partial,
    }
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.trim_matches('_').is_empty() {
        "upload.csv".to_string()
    } else {
        cleaned
    }
}

pub struct UploadPipeline<'a> {
    db: &'a Database,
    classifier: &'a RiskClassifier,
    cache: &'a LatestPredictions,
    upload_dir: &'a Path,
}

impl<'a> UploadPipeline<'a> {
    pub fn new(
        db: &'a Database,
        classifier: &'a RiskClassifier,
        cache: &'a LatestPredictions,
        upload_dir: &'a Path,
    ) -> Self {
        Self {
            db,
            classifier,
            cache,
            upload_dir,
        }
    }

    /// Any failure after the history row exists marks that row `error`.
    pub async fn process(&self, user_id: i64, original_filename: &str, contents: &[u8]) -> Result<UploadReport> {
        let started = Instant::now();
        let stored_name = format!(
            "{}_{}",
            Uuid::new_v4().simple(),
            sanitize_filename(original_filename)
        );
        let upload_id = self.db.create_upload(&stored_name, original_filename, user_id).await?;
        info!(upload_id, user_id, filename = original_filename, "processing upload");

        match self.run(upload_id, user_id, &stored_name, contents, started).await {
            Ok(report) => Ok(report),
            Err(err) => {
                warn!(upload_id, error = %err, "upload failed");
                let outcome = UploadOutcome {
                    error_message: Some(err.to_string()),
                    processing_time: started.elapsed().as_secs_f64(),
                    ..Default::default()
                };
                if let Err(finish_err) = self.db.finish_upload(upload_id, UploadStatus::Error, &outcome).await {
                    error!(upload_id, error = %finish_err, "could not mark upload as failed");
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        upload_id: i64,
        user_id: i64,
        stored_name: &str,
        contents: &[u8],
        started: Instant,
    ) -> Result<UploadReport> {
        tokio::fs::create_dir_all(self.upload_dir).await?;
        tokio::fs::write(self.upload_dir.join(stored_name), contents).await?;

        let sheet = data::parse_sheet_bytes(contents)?;
        for failure in &sheet.failures {
            warn!(upload_id, row = failure.row_number, reason = %failure.message, "skipping malformed row");
        }

        let total = sheet.total_rows();
        let failed = sheet.failed_rows();
        let mut predictions = Vec::with_capacity(sheet.rows.len());
        let mut counts: HashMap<RiskBand, i64> = HashMap::new();

        for row in sheet.rows {
            let row_started = Instant::now();
            let assessment = self.classifier.assess(&row.input);
            *counts.entry(assessment.risk_band).or_default() += 1;

            predictions.push(NewPrediction {
                student_id: row.student_id,
                name: row.name,
                date: row.date,
                final_grade: row.input.final_grade,
                attendance: row.input.attendance,
                absence: row.input.absence,
                behavior: row.input.behavior,
                predicted_dropout: assessment.predicted_dropout,
                risk_band: assessment.risk_band,
                probability: assessment.probability,
                risk_factors: assessment.risk_factors,
                prediction_seconds: row_started.elapsed().as_secs_f64(),
            });
        }

        let processed = predictions.len();
        if processed > 0 {
            self.db.insert_predictions(upload_id, &predictions).await?;
        }

        let count = |band| counts.get(&band).copied().unwrap_or(0);
        let share = |n: i64| {
            if processed == 0 {
                0.0
            } else {
                round_to(n as f64 / processed as f64 * 100.0, 2)
            }
        };
        let status = upload_status(processed, failed);
        let outcome = UploadOutcome {
            total_students: total as i64,
            processed_students: processed as i64,
            failed_students: failed as i64,
            high_risk_count: count(RiskBand::Alto),
            medium_risk_count: count(RiskBand::Medio),
            low_risk_count: count(RiskBand::Bajo),
            high_risk_percentage: share(count(RiskBand::Alto)),
            medium_risk_percentage: share(count(RiskBand::Medio)),
            low_risk_percentage: share(count(RiskBand::Bajo)),
            error_message: (status == UploadStatus::Error).then(|| "no valid student rows".to_string()),
            processing_time: started.elapsed().as_secs_f64(),
        };
        self.db.finish_upload(upload_id, status, &outcome).await?;

        let stored = self.db.all_predictions(upload_id).await?;
        if !stored.is_empty() {
            self.cache
                .store(
                    user_id,
                    PredictionBatch {
                        upload_id,
                        predictions: stored.clone(),
                    },
                )
                .await;
        }

        let upload = self
            .db
            .get_upload(upload_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("upload {} not found", upload_id)))?;

        info!(
            upload_id,
            status = ?upload.status,
            processed,
            failed,
            high_risk = outcome.high_risk_count,
            "upload processed"
        );

        Ok(UploadReport {
            upload,
            failures: sheet.failures.into_iter().map(RowFailure::from).collect(),
            predictions: stored,
        })
    }
}
