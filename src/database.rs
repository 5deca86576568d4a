use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite};
use std::str::FromStr;
use std::time::Duration;

use crate::model::{RiskBand, RiskFactor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Administrador,
    Docente,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UploadStatus {
    Processing,
    Success,
    Partial,
    Error,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
}

impl UserRecord {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Administrador
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Role,
    pub is_active: bool,
}

/// `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    pub username: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<Role>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UploadRecord {
    pub id: i64,
    pub filename: String,
    pub original_filename: String,
    pub upload_date: DateTime<Utc>,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub total_students: i64,
    pub processed_students: i64,
    pub failed_students: i64,
    pub high_risk_count: i64,
    pub medium_risk_count: i64,
    pub low_risk_count: i64,
    pub high_risk_percentage: f64,
    pub medium_risk_percentage: f64,
    pub low_risk_percentage: f64,
    pub status: UploadStatus,
    pub error_message: Option<String>,
    pub notes: Option<String>,
    pub processing_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadOutcome {
    pub total_students: i64,
    pub processed_students: i64,
    pub failed_students: i64,
    pub high_risk_count: i64,
    pub medium_risk_count: i64,
    pub low_risk_count: i64,
    pub high_risk_percentage: f64,
    pub medium_risk_percentage: f64,
    pub low_risk_percentage: f64,
    pub error_message: Option<String>,
    pub processing_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PredictionRecord {
    pub id: i64,
    pub upload_id: i64,
    pub student_id: String,
    pub name: Option<String>,
    pub date: Option<NaiveDate>,
    pub final_grade: f64,
    pub attendance: f64,
    pub absence: f64,
    pub behavior: String,
    pub predicted_dropout: bool,
    pub risk_band: RiskBand,
    pub probability: f64,
    pub risk_factors: Json<Vec<RiskFactor>>,
    pub prediction_seconds: f64,
    pub predicted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPrediction {
    pub student_id: String,
    pub name: Option<String>,
    pub date: Option<NaiveDate>,
    pub final_grade: f64,
    pub attendance: f64,
    pub absence: f64,
    pub behavior: String,
    pub predicted_dropout: bool,
    pub risk_band: RiskBand,
    pub probability: f64,
    pub risk_factors: Vec<RiskFactor>,
    pub prediction_seconds: f64,
}

#[derive(Debug, Clone, Default)]
pub struct UploadFilter {
    /// Restricts to one uploader; `None` means every upload.
    pub user_id: Option<i64>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Substring of the original filename.
    pub search: Option<String>,
    pub skip: i64,
    pub limit: i64,
}

const SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS usuarios (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        first_name TEXT,
        last_name TEXT,
        role TEXT NOT NULL DEFAULT 'docente',
        is_active BOOLEAN NOT NULL DEFAULT 1,
        created_at DATETIME NOT NULL,
        updated_at DATETIME,
        last_login DATETIME
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS upload_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        filename TEXT NOT NULL,
        original_filename TEXT NOT NULL,
        upload_date DATETIME NOT NULL,
        user_id INTEGER REFERENCES usuarios(id) ON DELETE SET NULL,
        total_students INTEGER NOT NULL DEFAULT 0,
        processed_students INTEGER NOT NULL DEFAULT 0,
        failed_students INTEGER NOT NULL DEFAULT 0,
        high_risk_count INTEGER NOT NULL DEFAULT 0,
        medium_risk_count INTEGER NOT NULL DEFAULT 0,
        low_risk_count INTEGER NOT NULL DEFAULT 0,
        high_risk_percentage REAL NOT NULL DEFAULT 0,
        medium_risk_percentage REAL NOT NULL DEFAULT 0,
        low_risk_percentage REAL NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'processing',
        error_message TEXT,
        notes TEXT,
        processing_time REAL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS upload_predictions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        upload_id INTEGER NOT NULL REFERENCES upload_history(id) ON DELETE CASCADE,
        student_id TEXT NOT NULL,
        name TEXT,
        date DATE,
        final_grade REAL NOT NULL,
        attendance REAL NOT NULL,
        absence REAL NOT NULL,
        behavior TEXT NOT NULL,
        predicted_dropout BOOLEAN NOT NULL,
        risk_band TEXT NOT NULL,
        probability REAL NOT NULL,
        risk_factors TEXT NOT NULL,
        prediction_seconds REAL NOT NULL,
        predicted_at DATETIME NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_upload_predictions_upload ON upload_predictions(upload_id)",
    "CREATE INDEX IF NOT EXISTS idx_upload_history_user ON upload_history(user_id, upload_date)",
];

const UPLOAD_SELECT: &str = r#"
    SELECT h.id, h.filename, h.original_filename, h.upload_date, h.user_id, u.username,
           h.total_students, h.processed_students, h.failed_students,
           h.high_risk_count, h.medium_risk_count, h.low_risk_count,
           h.high_risk_percentage, h.medium_risk_percentage, h.low_risk_percentage,
           h.status, h.error_message, h.notes, h.processing_time
    FROM upload_history h
    LEFT JOIN usuarios u ON u.id = h.user_id
"#;

const PREDICTION_SELECT: &str = r#"
    SELECT id, upload_id, student_id, name, date, final_grade, attendance, absence, behavior,
           predicted_dropout, risk_band, probability, risk_factors, prediction_seconds, predicted_at
    FROM upload_predictions
"#;

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Database { pool };
        db.create_schema().await?;
        Ok(db)
    }

    /// Every connection to `sqlite::memory:` is a separate database, so
    /// the pool is pinned to one connection that never expires.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        let db = Database { pool };
        db.create_schema().await?;
        Ok(db)
    }

    async fn create_schema(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), sqlx::Error> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    // --- users ---

    pub async fn insert_user(&self, user: &NewUser) -> Result<UserRecord, sqlx::Error> {
        let id = sqlx::query(
            r#"
            INSERT INTO usuarios (username, email, password_hash, first_name, last_name, role, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.role)
        .bind(user.is_active)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.find_user_by_id(id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn find_user_by_id(&self, id: i64) -> Result<Option<UserRecord>, sqlx::Error> {
        sqlx::query_as::<_, UserRecord>("SELECT * FROM usuarios WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>, sqlx::Error> {
        sqlx::query_as::<_, UserRecord>("SELECT * FROM usuarios WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, sqlx::Error> {
        sqlx::query_as::<_, UserRecord>("SELECT * FROM usuarios WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_users(&self, exclude_username: &str) -> Result<Vec<UserRecord>, sqlx::Error> {
        sqlx::query_as::<_, UserRecord>("SELECT * FROM usuarios WHERE username != ? ORDER BY id")
            .bind(exclude_username)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn update_user(&self, id: i64, changes: &UserChanges) -> Result<Option<UserRecord>, sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE usuarios SET
                username = COALESCE(?, username),
                email = COALESCE(?, email),
                first_name = COALESCE(?, first_name),
                last_name = COALESCE(?, last_name),
                role = COALESCE(?, role),
                is_active = COALESCE(?, is_active),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&changes.username)
        .bind(&changes.email)
        .bind(&changes.first_name)
        .bind(&changes.last_name)
        .bind(changes.role)
        .bind(changes.is_active)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.find_user_by_id(id).await
    }

    pub async fn set_password_hash(&self, id: i64, password_hash: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE usuarios SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(password_hash)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_last_login(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE usuarios SET last_login = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_user(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM usuarios WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- uploads ---

    pub async fn create_upload(
        &self,
        filename: &str,
        original_filename: &str,
        user_id: i64,
    ) -> Result<i64, sqlx::Error> {
        let id = sqlx::query(
            r#"
            INSERT INTO upload_history (filename, original_filename, upload_date, user_id, status)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(filename)
        .bind(original_filename)
        .bind(Utc::now())
        .bind(user_id)
        .bind(UploadStatus::Processing)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    pub async fn finish_upload(
        &self,
        id: i64,
        status: UploadStatus,
        outcome: &UploadOutcome,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE upload_history SET
                total_students = ?, processed_students = ?, failed_students = ?,
                high_risk_count = ?, medium_risk_count = ?, low_risk_count = ?,
                high_risk_percentage = ?, medium_risk_percentage = ?, low_risk_percentage = ?,
                status = ?, error_message = ?, processing_time = ?
            WHERE id = ?
            "#,
        )
        .bind(outcome.total_students)
        .bind(outcome.processed_students)
        .bind(outcome.failed_students)
        .bind(outcome.high_risk_count)
        .bind(outcome.medium_risk_count)
        .bind(outcome.low_risk_count)
        .bind(outcome.high_risk_percentage)
        .bind(outcome.medium_risk_percentage)
        .bind(outcome.low_risk_percentage)
        .bind(status)
        .bind(&outcome.error_message)
        .bind(outcome.processing_time)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_predictions(
        &self,
        upload_id: i64,
        predictions: &[NewPrediction],
    ) -> Result<(), sqlx::Error> {
        let predicted_at = Utc::now();
        let mut tx = self.pool.begin().await?;

        for prediction in predictions {
            sqlx::query(
                r#"
                INSERT INTO upload_predictions (
                    upload_id, student_id, name, date, final_grade, attendance, absence, behavior,
                    predicted_dropout, risk_band, probability, risk_factors, prediction_seconds, predicted_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(upload_id)
            .bind(&prediction.student_id)
            .bind(&prediction.name)
            .bind(prediction.date)
            .bind(prediction.final_grade)
            .bind(prediction.attendance)
            .bind(prediction.absence)
            .bind(&prediction.behavior)
            .bind(prediction.predicted_dropout)
            .bind(prediction.risk_band)
            .bind(prediction.probability)
            .bind(Json(&prediction.risk_factors))
            .bind(prediction.prediction_seconds)
            .bind(predicted_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    pub async fn get_upload(&self, id: i64) -> Result<Option<UploadRecord>, sqlx::Error> {
        let sql = format!("{} WHERE h.id = ?", UPLOAD_SELECT);
        sqlx::query_as::<_, UploadRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    fn push_upload_filter<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filter: &'a UploadFilter) {
        builder.push(" WHERE 1 = 1");
        if let Some(user_id) = filter.user_id {
            builder.push(" AND h.user_id = ").push_bind(user_id);
        }
        if let Some(start) = filter.start_date {
            builder.push(" AND h.upload_date >= ").push_bind(start);
        }
        if let Some(end) = filter.end_date {
            builder.push(" AND h.upload_date <= ").push_bind(end);
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            builder
                .push(" AND h.original_filename LIKE ")
                .push_bind(format!("%{}%", search));
        }
    }

    /// Newest first.
    pub async fn list_uploads(&self, filter: &UploadFilter) -> Result<Vec<UploadRecord>, sqlx::Error> {
        let mut builder = QueryBuilder::<Sqlite>::new(UPLOAD_SELECT);
        Self::push_upload_filter(&mut builder, filter);
        builder
            .push(" ORDER BY h.upload_date DESC, h.id DESC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.skip);

        builder
            .build_query_as::<UploadRecord>()
            .fetch_all(&self.pool)
            .await
    }

    pub async fn count_uploads(&self, filter: &UploadFilter) -> Result<i64, sqlx::Error> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM upload_history h");
        Self::push_upload_filter(&mut builder, filter);
        builder.build_query_scalar::<i64>().fetch_one(&self.pool).await
    }

    pub async fn uploads_by_ids(&self, ids: &[i64]) -> Result<Vec<UploadRecord>, sqlx::Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(UPLOAD_SELECT);
        builder.push(" WHERE h.id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY h.upload_date ASC, h.id ASC");

        builder
            .build_query_as::<UploadRecord>()
            .fetch_all(&self.pool)
            .await
    }

    /// Most recent upload that produced predictions.
    pub async fn latest_upload_id(&self, user_id: Option<i64>) -> Result<Option<i64>, sqlx::Error> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id FROM upload_history WHERE status IN ('success', 'partial')",
        );
        if let Some(user_id) = user_id {
            builder.push(" AND user_id = ").push_bind(user_id);
        }
        builder.push(" ORDER BY upload_date DESC, id DESC LIMIT 1");

        builder
            .build_query_scalar::<i64>()
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn update_upload_notes(&self, id: i64, notes: Option<&str>) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE upload_history SET notes = ? WHERE id = ?")
            .bind(notes)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_upload(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM upload_history WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- predictions ---

    pub async fn get_predictions(
        &self,
        upload_id: i64,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<PredictionRecord>, sqlx::Error> {
        let sql = format!("{} WHERE upload_id = ? ORDER BY id LIMIT ? OFFSET ?", PREDICTION_SELECT);
        sqlx::query_as::<_, PredictionRecord>(&sql)
            .bind(upload_id)
            .bind(limit)
            .bind(skip)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn all_predictions(&self, upload_id: i64) -> Result<Vec<PredictionRecord>, sqlx::Error> {
        let sql = format!("{} WHERE upload_id = ? ORDER BY id", PREDICTION_SELECT);
        sqlx::query_as::<_, PredictionRecord>(&sql)
            .bind(upload_id)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn count_predictions(&self, upload_id: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM upload_predictions WHERE upload_id = ?")
            .bind(upload_id)
            .fetch_one(&self.pool)
            .await
    }
}
