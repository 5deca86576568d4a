//! Dashboard aggregations over one batch of stored predictions, plus
//! summaries across uploads.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::database::{PredictionRecord, UploadRecord};
use crate::model::{Behavior, RiskBand, PASSING_GRADE};

pub const MONTH_LABELS: [&str; 12] = [
    "Ene", "Feb", "Mar", "Abr", "May", "Jun", "Jul", "Ago", "Sep", "Oct", "Nov", "Dic",
];

pub const WEEKDAY_LABELS: [&str; 7] = ["Lun", "Mar", "Mié", "Jue", "Vie", "Sáb", "Dom"];

#[derive(Serialize, Clone, Debug)]
pub struct StudentRisk {
    pub student_id: String,
    pub name: String,
    pub risk_band: RiskBand,
    pub probability: f64,
    pub final_grade: f64,
    pub attendance: f64,
    pub absence: f64,
    pub behavior: String,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct BandCount {
    pub risk_band: RiskBand,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Serialize, Clone, Debug)]
pub struct RiskDistribution {
    pub total_students: usize,
    pub bands: Vec<BandCount>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct MonthlyRisk {
    pub month: &'static str,
    pub high_risk: usize,
    pub total: usize,
    pub percentage: f64,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct HeatmapSeries {
    /// Month label such as "Mar 2025".
    pub label: String,
    /// Average attendance per weekday, Monday first.
    pub values: Vec<f64>,
}

#[derive(Serialize, Clone, Debug)]
pub struct AttendanceHeatmap {
    pub labels: Vec<&'static str>,
    pub series: Vec<HeatmapSeries>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct BehaviorCount {
    pub behavior: Behavior,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Serialize, Clone, Debug)]
pub struct BehaviorDistribution {
    pub total_students: usize,
    pub behaviors: Vec<BehaviorCount>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct GradesSummary {
    pub total_students: usize,
    pub approved: usize,
    pub failed: usize,
    pub approval_percentage: f64,
    pub average_grade: f64,
    pub average_attendance: f64,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct UploadStatistics {
    pub total_uploads: usize,
    pub total_students_loaded: i64,
    pub total_students_processed: i64,
    pub total_high_risk: i64,
    pub total_medium_risk: i64,
    pub total_low_risk: i64,
    pub uploads_last_30_days: usize,
    pub average_processing_time: f64,
}

#[derive(Serialize, Clone, Debug)]
pub struct ComparisonEntry {
    pub id: i64,
    pub filename: String,
    pub upload_date: DateTime<Utc>,
    pub total_students: i64,
    pub high_risk_count: i64,
    pub medium_risk_count: i64,
    pub low_risk_count: i64,
    pub high_risk_percentage: f64,
    pub medium_risk_percentage: f64,
    pub low_risk_percentage: f64,
}

#[derive(Serialize, Clone, Debug)]
pub struct UploadComparison {
    pub uploads: Vec<ComparisonEntry>,
    /// Change in high-risk percentage from the oldest to the newest upload.
    pub high_risk_change: f64,
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RiskAnalyzer;

impl RiskAnalyzer {
    pub fn new() -> Self {
        RiskAnalyzer
    }

    /// Every student of the batch, highest probability first.
    pub fn students_at_risk(&self, predictions: &[PredictionRecord]) -> Vec<StudentRisk> {
        let mut students: Vec<StudentRisk> = predictions
            .iter()
            .map(|p| StudentRisk {
                student_id: p.student_id.clone(),
                name: p
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("Estudiante {}", p.student_id)),
                risk_band: p.risk_band,
                probability: round_to(p.probability, 4),
                final_grade: p.final_grade,
                attendance: p.attendance,
                absence: p.absence,
                behavior: p.behavior.clone(),
            })
            .collect();

        students.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        students
    }

    pub fn risk_distribution(&self, predictions: &[PredictionRecord]) -> RiskDistribution {
        let total = predictions.len();
        let bands = [RiskBand::Alto, RiskBand::Medio, RiskBand::Bajo]
            .into_iter()
            .map(|band| {
                let count = predictions.iter().filter(|p| p.risk_band == band).count();
                BandCount {
                    risk_band: band,
                    count,
                    percentage: round_to(percentage(count, total), 2),
                }
            })
            .collect();

        RiskDistribution {
            total_students: total,
            bands,
        }
    }

    /// One entry per calendar month; undated rows are ignored.
    pub fn monthly_risk_summary(&self, predictions: &[PredictionRecord]) -> Vec<MonthlyRisk> {
        let mut high = [0usize; 12];
        let mut totals = [0usize; 12];

        for prediction in predictions {
            if let Some(date) = prediction.date {
                let month = date.month0() as usize;
                totals[month] += 1;
                if prediction.risk_band == RiskBand::Alto {
                    high[month] += 1;
                }
            }
        }

        MONTH_LABELS
            .iter()
            .enumerate()
            .map(|(i, label)| MonthlyRisk {
                month: *label,
                high_risk: high[i],
                total: totals[i],
                percentage: round_to(percentage(high[i], totals[i]), 1),
            })
            .collect()
    }

    pub fn attendance_heatmap(&self, predictions: &[PredictionRecord]) -> AttendanceHeatmap {
        let mut months: BTreeMap<(i32, u32), [(f64, usize); 7]> = BTreeMap::new();

        for prediction in predictions {
            if let Some(date) = prediction.date {
                let cells = months
                    .entry((date.year(), date.month()))
                    .or_insert([(0.0, 0); 7]);
                let cell = &mut cells[date.weekday().num_days_from_monday() as usize];
                cell.0 += prediction.attendance;
                cell.1 += 1;
            }
        }

        let series = months
            .into_iter()
            .map(|((year, month), cells)| HeatmapSeries {
                label: NaiveDate::from_ymd_opt(year, month, 1)
                    .map(|first| first.format("%b %Y").to_string())
                    .unwrap_or_else(|| format!("{}-{:02}", year, month)),
                values: cells
                    .iter()
                    .map(|&(sum, count)| {
                        if count == 0 {
                            0.0
                        } else {
                            round_to(sum / count as f64, 1)
                        }
                    })
                    .collect(),
            })
            .collect();

        AttendanceHeatmap {
            labels: WEEKDAY_LABELS.to_vec(),
            series,
        }
    }

    pub fn behavior_distribution(&self, predictions: &[PredictionRecord]) -> BehaviorDistribution {
        let total = predictions.len();
        let behaviors = [Behavior::Positivo, Behavior::Neutral, Behavior::Agresivo]
            .into_iter()
            .map(|behavior| {
                let count = predictions
                    .iter()
                    .filter(|p| Behavior::parse(&p.behavior) == behavior)
                    .count();
                BehaviorCount {
                    behavior,
                    count,
                    percentage: round_to(percentage(count, total), 2),
                }
            })
            .collect();

        BehaviorDistribution {
            total_students: total,
            behaviors,
        }
    }

    pub fn grades_summary(&self, predictions: &[PredictionRecord]) -> GradesSummary {
        let total = predictions.len();
        let approved = predictions
            .iter()
            .filter(|p| p.final_grade >= PASSING_GRADE)
            .count();
        let average = |value: fn(&PredictionRecord) -> f64| {
            if total == 0 {
                0.0
            } else {
                round_to(predictions.iter().map(value).sum::<f64>() / total as f64, 2)
            }
        };

        GradesSummary {
            total_students: total,
            approved,
            failed: total - approved,
            approval_percentage: round_to(percentage(approved, total), 2),
            average_grade: average(|p| p.final_grade),
            average_attendance: average(|p| p.attendance),
        }
    }

    pub fn upload_statistics(&self, uploads: &[UploadRecord], now: DateTime<Utc>) -> UploadStatistics {
        let total_uploads = uploads.len();
        let cutoff = now - Duration::days(30);
        let processing: f64 = uploads.iter().filter_map(|u| u.processing_time).sum();

        UploadStatistics {
            total_uploads,
            total_students_loaded: uploads.iter().map(|u| u.total_students).sum(),
            total_students_processed: uploads.iter().map(|u| u.processed_students).sum(),
            total_high_risk: uploads.iter().map(|u| u.high_risk_count).sum(),
            total_medium_risk: uploads.iter().map(|u| u.medium_risk_count).sum(),
            total_low_risk: uploads.iter().map(|u| u.low_risk_count).sum(),
            uploads_last_30_days: uploads.iter().filter(|u| u.upload_date >= cutoff).count(),
            average_processing_time: if total_uploads == 0 {
                0.0
            } else {
                round_to(processing / total_uploads as f64, 3)
            },
        }
    }

    /// Expects uploads oldest first.
    pub fn compare_uploads(&self, uploads: &[UploadRecord]) -> UploadComparison {
        let entries: Vec<ComparisonEntry> = uploads
            .iter()
            .map(|u| ComparisonEntry {
                id: u.id,
                filename: u.original_filename.clone(),
                upload_date: u.upload_date,
                total_students: u.total_students,
                high_risk_count: u.high_risk_count,
                medium_risk_count: u.medium_risk_count,
                low_risk_count: u.low_risk_count,
                high_risk_percentage: round_to(u.high_risk_percentage, 2),
                medium_risk_percentage: round_to(u.medium_risk_percentage, 2),
                low_risk_percentage: round_to(u.low_risk_percentage, 2),
            })
            .collect();

        let high_risk_change = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => {
                round_to(last.high_risk_percentage - first.high_risk_percentage, 2)
            }
            _ => 0.0,
        };

        UploadComparison {
            uploads: entries,
            high_risk_change,
        }
    }
}
