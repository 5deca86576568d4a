//! Parsing of uploaded student sheets.

use chrono::NaiveDate;
use csv::{ByteRecord, ReaderBuilder, StringRecord, Trim, WriterBuilder};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Read;

use crate::database::PredictionRecord;
use crate::error::{AppError, Result};
use crate::model::{RiskBand, StudentInput};

pub const REQUIRED_COLUMNS: [&str; 4] = ["nota_final", "asistencia", "inasistencia", "conducta"];

/// Ground-truth column, only read by the training tool.
pub const LABEL_COLUMN: &str = "deserta";

#[derive(Debug, Clone, PartialEq)]
pub struct StudentRow {
    /// 1-based position among the data rows.
    pub row_number: usize,
    pub student_id: String,
    pub name: Option<String>,
    pub date: Option<NaiveDate>,
    pub input: StudentInput,
    pub label: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub row_number: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSheet {
    pub rows: Vec<StudentRow>,
    pub failures: Vec<RowError>,
}

impl ParsedSheet {
    pub fn total_rows(&self) -> usize {
        self.rows.len() + self.failures.len()
    }

    pub fn failed_rows(&self) -> usize {
        self.failures.len()
    }
}

struct ColumnIndex(HashMap<String, usize>);

impl ColumnIndex {
    fn from_headers(headers: &StringRecord) -> Self {
        let mut index = HashMap::new();
        for (position, header) in headers.iter().enumerate() {
            index
                .entry(header.trim().trim_start_matches('\u{feff}').to_lowercase())
                .or_insert(position);
        }
        ColumnIndex(index)
    }

    fn missing_required(&self) -> Vec<String> {
        REQUIRED_COLUMNS
            .iter()
            .filter(|column| !self.0.contains_key(**column))
            .map(|column| column.to_string())
            .collect()
    }

    fn cell<'r>(&self, record: &'r StringRecord, column: &str) -> Option<&'r str> {
        self.0
            .get(column)
            .and_then(|&position| record.get(position))
            .map(str::trim)
    }
}

/// Cells are UTF-8 when valid, otherwise read as Latin-1 (spreadsheet
/// exports on Windows often are).
fn decode_field(field: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(field) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(field.iter().map(|&b| char::from(b)).collect()),
    }
}

fn decode_record(record: &ByteRecord) -> StringRecord {
    record.iter().map(decode_field).collect()
}

pub fn parse_sheet_bytes(bytes: &[u8]) -> Result<ParsedSheet> {
    parse_sheet(bytes)
}

/// Reads a CSV sheet with a header row.
///
/// Missing required columns reject the whole sheet. Empty numeric cells
/// count as 0; a cell that is present but not a number fails its row.
pub fn parse_sheet<R: Read>(reader: R) -> Result<ParsedSheet> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(reader);

    let columns = ColumnIndex::from_headers(&decode_record(rdr.byte_headers()?));
    let missing = columns.missing_required();
    if !missing.is_empty() {
        return Err(AppError::InvalidSchema { missing });
    }
    let has_label = columns.0.contains_key(LABEL_COLUMN);

    let mut sheet = ParsedSheet::default();
    for (offset, result) in rdr.byte_records().enumerate() {
        let row_number = offset + 1;
        let parsed = result
            .map_err(|e| e.to_string())
            .and_then(|record| parse_row(&columns, &decode_record(&record), row_number, has_label));

        match parsed {
            Ok(Some(row)) => sheet.rows.push(row),
            Ok(None) => {}
            Err(message) => sheet.failures.push(RowError { row_number, message }),
        }
    }

    Ok(sheet)
}

fn parse_row(
    columns: &ColumnIndex,
    record: &StringRecord,
    row_number: usize,
    has_label: bool,
) -> std::result::Result<Option<StudentRow>, String> {
    if record.iter().all(|cell| cell.trim().is_empty()) {
        return Ok(None);
    }

    let number = |column: &str| parse_number(columns.cell(record, column).unwrap_or(""), column);

    let final_grade = number("nota_final")?;
    let attendance = number("asistencia")?;
    let absence = number("inasistencia")?;
    let behavior = columns.cell(record, "conducta").unwrap_or("").to_string();

    let student_id = columns
        .cell(record, "estudiante_id")
        .or_else(|| columns.cell(record, "id_estudiante"))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| row_number.to_string());

    let name = columns
        .cell(record, "nombre")
        .filter(|name| !name.is_empty())
        .map(str::to_string);

    let date = columns.cell(record, "fecha").and_then(parse_date);

    let label = if has_label {
        Some(parse_label(columns.cell(record, LABEL_COLUMN).unwrap_or(""))?)
    } else {
        None
    };

    Ok(Some(StudentRow {
        row_number,
        student_id,
        name,
        date,
        input: StudentInput {
            final_grade,
            attendance,
            absence,
            behavior,
        },
        label,
    }))
}

fn parse_number(raw: &str, column: &str) -> std::result::Result<f64, String> {
    if raw.is_empty() {
        return Ok(0.0);
    }
    raw.replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| format!("column '{}' has non-numeric value '{}'", column, raw))
}

/// `YYYY-MM-DD`, optionally followed by a time part.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn parse_label(raw: &str) -> std::result::Result<bool, String> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "si" | "sí" | "yes" | "sí deserta" => Ok(true),
        "0" | "false" | "no" | "no deserta" => Ok(false),
        other => Err(format!("column '{}' has unrecognised value '{}'", LABEL_COLUMN, other)),
    }
}

const EXPORT_COLUMNS: [&str; 10] = [
    "estudiante_id",
    "nombre",
    "fecha",
    "nota_final",
    "asistencia",
    "inasistencia",
    "conducta",
    "prediccion",
    "nivel_riesgo",
    "probabilidad",
];

#[derive(Serialize)]
struct ExportRow<'a> {
    estudiante_id: &'a str,
    nombre: Option<&'a str>,
    fecha: Option<NaiveDate>,
    nota_final: f64,
    asistencia: f64,
    inasistencia: f64,
    conducta: &'a str,
    prediccion: &'static str,
    nivel_riesgo: RiskBand,
    probabilidad: f64,
}

/// The uploaded rows enriched with their prediction, as CSV.
pub fn export_predictions(predictions: &[PredictionRecord]) -> Result<Vec<u8>> {
    let mut wtr = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    wtr.write_record(EXPORT_COLUMNS)?;
    for p in predictions {
        wtr.serialize(ExportRow {
            estudiante_id: &p.student_id,
            nombre: p.name.as_deref(),
            fecha: p.date,
            nota_final: p.final_grade,
            asistencia: p.attendance,
            inasistencia: p.absence,
            conducta: &p.behavior,
            prediccion: if p.predicted_dropout { "Sí deserta" } else { "No deserta" },
            nivel_riesgo: p.risk_band,
            probabilidad: (p.probability * 10_000.0).round() / 10_000.0,
        })?;
    }
    wtr.into_inner().map_err(|e| AppError::Io(e.into_error()))
}
