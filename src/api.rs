//! HTTP surface: application state, handlers and the route table.

use actix_web::{error::JsonPayloadError, http::header, web, HttpRequest, HttpResponse};
use chrono::{NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::analytics::RiskAnalyzer;
use crate::config::AppConfig;
use crate::data;
use crate::database::{Database, UploadFilter, UploadRecord, UserRecord};
use crate::error::{AppError, Result};
use crate::model::{RiskBand, RiskClassifier, RiskFactor, StudentInput};
use crate::pipeline::{LatestPredictions, PredictionBatch, UploadPipeline};
use crate::session::{AdminPanelUser, CurrentUser, IssuedToken, SessionScope, SessionStore};
use crate::users::{
    ChangePasswordRequest, CreateUserRequest, RegisterRequest, SetPasswordRequest, UpdateUserRequest,
    UserService,
};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

pub struct AppState {
    pub db: Database,
    pub classifier: Arc<RiskClassifier>,
    pub users: UserService,
    pub sessions: SessionStore,
    pub latest: LatestPredictions,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(config: AppConfig, db: Database, classifier: RiskClassifier) -> Self {
        Self {
            users: UserService::new(db.clone(), config.auth.clone()),
            sessions: SessionStore::new(
                config.auth.session_ttl_hours,
                config.auth.admin_session_ttl_hours,
            ),
            latest: LatestPredictions::new(),
            classifier: Arc::new(classifier),
            db,
            config,
        }
    }
}

// --- request / response bodies ---

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct AdminLoginRequest {
    username: String,
    password: String,
    access_code: String,
}

#[derive(Serialize)]
struct LoginResponse {
    #[serde(flatten)]
    token: IssuedToken,
    user: UserRecord,
}

#[derive(Serialize)]
struct PredictResponse {
    probability: f64,
    risk_band: RiskBand,
    predicted_dropout: bool,
    outcome: &'static str,
    risk_factors: Vec<RiskFactor>,
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Deserialize)]
struct UploadQuery {
    filename: Option<String>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    search: Option<String>,
    skip: Option<i64>,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct HistoryResponse {
    total: i64,
    skip: i64,
    limit: i64,
    uploads: Vec<UploadRecord>,
}

#[derive(Deserialize)]
struct PageQuery {
    skip: Option<i64>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct NotesRequest {
    notes: Option<String>,
}

#[derive(Deserialize)]
struct CompareQuery {
    ids: String,
}

#[derive(Deserialize)]
struct DashboardQuery {
    upload_id: Option<i64>,
}

#[derive(Serialize)]
struct DashboardResponse<T: Serialize> {
    upload_id: Option<i64>,
    data: T,
}

fn page(skip: Option<i64>, limit: Option<i64>) -> (i64, i64) {
    (
        skip.unwrap_or(0).max(0),
        limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
    )
}

fn parse_day(raw: &str, field: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::Validation(format!("{} must be a date in YYYY-MM-DD format", field)))
}

fn validate_student(input: &StudentInput) -> Result<()> {
    if !(0.0..=20.0).contains(&input.final_grade) {
        return Err(AppError::Validation("final_grade must be between 0 and 20".to_string()));
    }
    for (value, field) in [(input.attendance, "attendance"), (input.absence, "absence")] {
        if !(0.0..=100.0).contains(&value) {
            return Err(AppError::Validation(format!("{} must be between 0 and 100", field)));
        }
    }
    Ok(())
}

/// Malformed JSON bodies answer 422 like any other validation failure.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err: JsonPayloadError, _req: &HttpRequest| {
        AppError::Validation(err.to_string()).into()
    })
}

// --- public ---

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "model_loaded": true,
        "database": state.db.ping().await,
    }))
}

async fn get_model_info(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.classifier.info())
}

async fn predict(state: web::Data<AppState>, req: web::Json<StudentInput>) -> Result<HttpResponse> {
    validate_student(&req)?;
    let assessment = state.classifier.assess(&req);

    Ok(HttpResponse::Ok().json(PredictResponse {
        probability: assessment.probability,
        risk_band: assessment.risk_band,
        predicted_dropout: assessment.predicted_dropout,
        outcome: assessment.outcome_label(),
        risk_factors: assessment.risk_factors,
    }))
}

// --- auth ---

async fn login(state: web::Data<AppState>, req: web::Json<LoginRequest>) -> Result<HttpResponse> {
    let user = state.users.authenticate(&req.username, &req.password).await?;
    let token = state.sessions.issue(user.id, SessionScope::Standard).await;
    info!(user_id = user.id, "user logged in");
    Ok(HttpResponse::Ok().json(LoginResponse { token, user }))
}

async fn register(state: web::Data<AppState>, req: web::Json<RegisterRequest>) -> Result<HttpResponse> {
    let user = state.users.register(req.into_inner()).await?;
    Ok(HttpResponse::Created().json(user))
}

async fn me(current: CurrentUser) -> HttpResponse {
    HttpResponse::Ok().json(current.user)
}

async fn change_password(
    state: web::Data<AppState>,
    current: CurrentUser,
    req: web::Json<ChangePasswordRequest>,
) -> Result<HttpResponse> {
    state
        .users
        .change_own_password(&current.user, req.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(MessageResponse::new("password updated")))
}

async fn logout(state: web::Data<AppState>, current: CurrentUser) -> HttpResponse {
    state.sessions.revoke(&current.token).await;
    HttpResponse::Ok().json(MessageResponse::new("logged out"))
}

// --- admin panel ---

async fn admin_login(state: web::Data<AppState>, req: web::Json<AdminLoginRequest>) -> Result<HttpResponse> {
    if req.access_code != state.config.auth.admin_access_code {
        return Err(AppError::Forbidden("invalid access code".to_string()));
    }
    let user = state.users.authenticate(&req.username, &req.password).await?;
    if !user.is_admin() {
        return Err(AppError::Forbidden(
            "only administrators can open the admin panel".to_string(),
        ));
    }

    let token = state.sessions.issue(user.id, SessionScope::AdminPanel).await;
    info!(user_id = user.id, "admin panel session opened");
    Ok(HttpResponse::Ok().json(LoginResponse { token, user }))
}

async fn list_users(state: web::Data<AppState>, _admin: AdminPanelUser) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.users.list().await?))
}

async fn create_user(
    state: web::Data<AppState>,
    _admin: AdminPanelUser,
    req: web::Json<CreateUserRequest>,
) -> Result<HttpResponse> {
    let user = state.users.create(req.into_inner()).await?;
    Ok(HttpResponse::Created().json(user))
}

async fn get_user(
    state: web::Data<AppState>,
    _admin: AdminPanelUser,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.users.get(path.into_inner()).await?))
}

async fn update_user(
    state: web::Data<AppState>,
    _admin: AdminPanelUser,
    path: web::Path<i64>,
    req: web::Json<UpdateUserRequest>,
) -> Result<HttpResponse> {
    let user = state.users.update(path.into_inner(), req.into_inner()).await?;
    if !user.is_active {
        state.sessions.revoke_user(user.id).await;
    }
    Ok(HttpResponse::Ok().json(user))
}

async fn delete_user(
    state: web::Data<AppState>,
    admin: AdminPanelUser,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let id = path.into_inner();
    state.users.delete(&admin.0.user, id).await?;
    state.sessions.revoke_user(id).await;
    Ok(HttpResponse::Ok().json(MessageResponse::new(format!("user {} deleted", id))))
}

async fn set_user_password(
    state: web::Data<AppState>,
    _admin: AdminPanelUser,
    path: web::Path<i64>,
    req: web::Json<SetPasswordRequest>,
) -> Result<HttpResponse> {
    state.users.set_password(path.into_inner(), req.into_inner()).await?;
    Ok(HttpResponse::Ok().json(MessageResponse::new("password updated")))
}

// --- uploads ---

async fn upload_sheet(
    state: web::Data<AppState>,
    current: CurrentUser,
    query: web::Query<UploadQuery>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let filename = query
        .filename
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("upload.csv");
    if !filename.to_lowercase().ends_with(".csv") {
        return Err(AppError::Validation("only .csv files are accepted".to_string()));
    }
    if body.is_empty() {
        return Err(AppError::Validation("the uploaded file is empty".to_string()));
    }

    let upload_dir = Path::new(&state.config.storage.upload_dir);
    let pipeline = UploadPipeline::new(&state.db, &state.classifier, &state.latest, upload_dir);
    let report = pipeline.process(current.user.id, filename, &body).await?;
    Ok(HttpResponse::Ok().json(report))
}

async fn load_owned_upload(state: &AppState, current: &CurrentUser, id: i64) -> Result<UploadRecord> {
    let upload = state
        .db
        .get_upload(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("upload {} not found", id)))?;
    if !current.can_access(upload.user_id) {
        return Err(AppError::Forbidden(
            "you do not have access to this upload".to_string(),
        ));
    }
    Ok(upload)
}

async fn upload_history(
    state: web::Data<AppState>,
    current: CurrentUser,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse> {
    let query = query.into_inner();
    let (skip, limit) = page(query.skip, query.limit);

    let start_date = match query.start_date.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(parse_day(raw, "start_date")?.and_time(NaiveTime::MIN).and_utc()),
        None => None,
    };
    let end_date = match query.end_date.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => {
            let next_day = parse_day(raw, "end_date")?
                .succ_opt()
                .ok_or_else(|| AppError::Validation("end_date is out of range".to_string()))?;
            Some(next_day.and_time(NaiveTime::MIN).and_utc() - chrono::Duration::microseconds(1))
        }
        None => None,
    };

    let filter = UploadFilter {
        user_id: current.owner_filter(),
        start_date,
        end_date,
        search: query.search,
        skip,
        limit,
    };
    let total = state.db.count_uploads(&filter).await?;
    let uploads = state.db.list_uploads(&filter).await?;

    Ok(HttpResponse::Ok().json(HistoryResponse {
        total,
        skip,
        limit,
        uploads,
    }))
}

async fn upload_detail(
    state: web::Data<AppState>,
    current: CurrentUser,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let upload = load_owned_upload(&state, &current, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(upload))
}

async fn delete_upload(
    state: web::Data<AppState>,
    current: CurrentUser,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let upload = load_owned_upload(&state, &current, path.into_inner()).await?;
    state.db.delete_upload(upload.id).await?;
    state.latest.evict_upload(upload.id).await;
    if let Err(err) = tokio::fs::remove_file(stored_path(&state, &upload)).await {
        warn!(upload_id = upload.id, error = %err, "stored sheet not removed");
    }
    info!(upload_id = upload.id, user_id = current.user.id, "upload deleted");
    Ok(HttpResponse::Ok().json(MessageResponse::new(format!("upload {} deleted", upload.id))))
}

async fn upload_predictions(
    state: web::Data<AppState>,
    current: CurrentUser,
    path: web::Path<i64>,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse> {
    let upload = load_owned_upload(&state, &current, path.into_inner()).await?;
    let (skip, limit) = page(query.skip, query.limit);
    let predictions = state.db.get_predictions(upload.id, skip, limit).await?;
    let total = state.db.count_predictions(upload.id).await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "upload_id": upload.id,
        "total": total,
        "skip": skip,
        "limit": limit,
        "predictions": predictions,
    })))
}

fn stored_path(state: &AppState, upload: &UploadRecord) -> PathBuf {
    Path::new(&state.config.storage.upload_dir).join(&upload.filename)
}

fn attachment(filename: &str) -> (header::HeaderName, String) {
    let name: String = filename.chars().filter(|c| *c != '"' && !c.is_control()).collect();
    (
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", name),
    )
}

async fn export_predictions(
    state: web::Data<AppState>,
    current: CurrentUser,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let upload = load_owned_upload(&state, &current, path.into_inner()).await?;
    let predictions = state.db.all_predictions(upload.id).await?;
    let body = data::export_predictions(&predictions)?;

    Ok(HttpResponse::Ok()
        .content_type("text/csv; charset=utf-8")
        .insert_header(attachment(&format!("predicciones_{}.csv", upload.id)))
        .body(body))
}

async fn download_original(
    state: web::Data<AppState>,
    current: CurrentUser,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let upload = load_owned_upload(&state, &current, path.into_inner()).await?;
    let body = match tokio::fs::read(stored_path(&state, &upload)).await {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!(
                "the file of upload {} is no longer stored",
                upload.id
            )))
        }
        Err(err) => return Err(err.into()),
    };

    Ok(HttpResponse::Ok()
        .content_type("text/csv")
        .insert_header(attachment(&upload.original_filename))
        .body(body))
}

async fn update_notes(
    state: web::Data<AppState>,
    current: CurrentUser,
    path: web::Path<i64>,
    req: web::Json<NotesRequest>,
) -> Result<HttpResponse> {
    let upload = load_owned_upload(&state, &current, path.into_inner()).await?;
    let notes = req.notes.as_deref().map(str::trim).filter(|n| !n.is_empty());
    state.db.update_upload_notes(upload.id, notes).await?;
    let updated = load_owned_upload(&state, &current, upload.id).await?;
    Ok(HttpResponse::Ok().json(updated))
}

async fn upload_statistics(state: web::Data<AppState>, current: CurrentUser) -> Result<HttpResponse> {
    let filter = UploadFilter {
        user_id: current.owner_filter(),
        limit: -1,
        ..Default::default()
    };
    let uploads = state.db.list_uploads(&filter).await?;
    let stats = RiskAnalyzer::new().upload_statistics(&uploads, Utc::now());
    Ok(HttpResponse::Ok().json(stats))
}

async fn compare_uploads(
    state: web::Data<AppState>,
    current: CurrentUser,
    query: web::Query<CompareQuery>,
) -> Result<HttpResponse> {
    let mut ids = Vec::new();
    for part in query.ids.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let id = part
            .parse::<i64>()
            .map_err(|_| AppError::Validation(format!("'{}' is not a valid upload id", part)))?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    if !(2..=10).contains(&ids.len()) {
        return Err(AppError::Validation(
            "between 2 and 10 uploads are required for a comparison".to_string(),
        ));
    }

    let uploads = state.db.uploads_by_ids(&ids).await?;
    for id in &ids {
        match uploads.iter().find(|u| u.id == *id) {
            None => return Err(AppError::NotFound(format!("upload {} not found", id))),
            Some(upload) if !current.can_access(upload.user_id) => {
                return Err(AppError::Forbidden(
                    "you do not have access to this upload".to_string(),
                ))
            }
            Some(_) => {}
        }
    }

    Ok(HttpResponse::Ok().json(RiskAnalyzer::new().compare_uploads(&uploads)))
}

// --- dashboards ---

/// The batch a dashboard reads: an explicit upload, the caller's cached
/// latest batch, or their most recent upload on record.
async fn resolve_batch(
    state: &AppState,
    current: &CurrentUser,
    upload_id: Option<i64>,
) -> Result<Option<Arc<PredictionBatch>>> {
    let upload_id = match upload_id {
        Some(id) => load_owned_upload(state, current, id).await?.id,
        None => {
            if let Some(batch) = state.latest.get(current.user.id).await {
                return Ok(Some(batch));
            }
            match state.db.latest_upload_id(current.owner_filter()).await? {
                Some(id) => id,
                None => return Ok(None),
            }
        }
    };

    let predictions = state.db.all_predictions(upload_id).await?;
    Ok(Some(Arc::new(PredictionBatch {
        upload_id,
        predictions,
    })))
}

async fn dashboard<T, F>(
    state: web::Data<AppState>,
    current: CurrentUser,
    query: web::Query<DashboardQuery>,
    aggregate: F,
) -> Result<HttpResponse>
where
    T: Serialize,
    F: FnOnce(&RiskAnalyzer, &[crate::database::PredictionRecord]) -> T,
{
    let batch = resolve_batch(&state, &current, query.upload_id).await?;
    let predictions = batch.as_deref().map(|b| b.predictions.as_slice()).unwrap_or(&[]);

    Ok(HttpResponse::Ok().json(DashboardResponse {
        upload_id: batch.as_ref().map(|b| b.upload_id),
        data: aggregate(&RiskAnalyzer::new(), predictions),
    }))
}

async fn students_at_risk(
    state: web::Data<AppState>,
    current: CurrentUser,
    query: web::Query<DashboardQuery>,
) -> Result<HttpResponse> {
    dashboard(state, current, query, |a, p| a.students_at_risk(p)).await
}

async fn risk_distribution(
    state: web::Data<AppState>,
    current: CurrentUser,
    query: web::Query<DashboardQuery>,
) -> Result<HttpResponse> {
    dashboard(state, current, query, |a, p| a.risk_distribution(p)).await
}

async fn risk_summary(
    state: web::Data<AppState>,
    current: CurrentUser,
    query: web::Query<DashboardQuery>,
) -> Result<HttpResponse> {
    dashboard(state, current, query, |a, p| a.monthly_risk_summary(p)).await
}

async fn attendance_heatmap(
    state: web::Data<AppState>,
    current: CurrentUser,
    query: web::Query<DashboardQuery>,
) -> Result<HttpResponse> {
    dashboard(state, current, query, |a, p| a.attendance_heatmap(p)).await
}

async fn behavior_distribution(
    state: web::Data<AppState>,
    current: CurrentUser,
    query: web::Query<DashboardQuery>,
) -> Result<HttpResponse> {
    dashboard(state, current, query, |a, p| a.behavior_distribution(p)).await
}

async fn grades_summary(
    state: web::Data<AppState>,
    current: CurrentUser,
    query: web::Query<DashboardQuery>,
) -> Result<HttpResponse> {
    dashboard(state, current, query, |a, p| a.grades_summary(p)).await
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/model/info", web::get().to(get_model_info))
        .route("/predict", web::post().to(predict))
        .service(
            web::scope("/auth")
                .route("/login", web::post().to(login))
                .route("/register", web::post().to(register))
                .route("/me", web::get().to(me))
                .route("/change-password", web::post().to(change_password))
                .route("/logout", web::post().to(logout)),
        )
        .service(
            web::scope("/admin")
                .route("/login", web::post().to(admin_login))
                .route("/users", web::get().to(list_users))
                .route("/users", web::post().to(create_user))
                .route("/users/{id}", web::get().to(get_user))
                .route("/users/{id}", web::put().to(update_user))
                .route("/users/{id}", web::delete().to(delete_user))
                .route("/users/{id}/change-password", web::post().to(set_user_password)),
        )
        .service(
            web::scope("/uploads")
                .route("", web::post().to(upload_sheet))
                .route("/history", web::get().to(upload_history))
                .route("/history/{id}", web::get().to(upload_detail))
                .route("/history/{id}", web::delete().to(delete_upload))
                .route("/history/{id}/predictions", web::get().to(upload_predictions))
                .route("/history/{id}/notes", web::put().to(update_notes))
                .route("/history/{id}/export", web::get().to(export_predictions))
                .route("/history/{id}/download", web::get().to(download_original))
                .route("/statistics", web::get().to(upload_statistics))
                .route("/compare", web::get().to(compare_uploads)),
        )
        .service(
            web::scope("/dashboard")
                .route("/students_at_risk", web::get().to(students_at_risk))
                .route("/risk_distribution", web::get().to(risk_distribution))
                .route("/risk_summary", web::get().to(risk_summary))
                .route("/attendance_heatmap", web::get().to(attendance_heatmap))
                .route("/behavior_distribution", web::get().to(behavior_distribution))
                .route("/grades_summary", web::get().to(grades_summary)),
        );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_is_clamped() {
        assert_eq!(page(None, None), (0, DEFAULT_PAGE_SIZE));
        assert_eq!(page(Some(-3), Some(0)), (0, 1));
        assert_eq!(page(Some(10), Some(10_000)), (10, MAX_PAGE_SIZE));
    }

    #[test]
    fn student_ranges_are_checked() {
        let mut input = StudentInput {
            final_grade: 14.0,
            attendance: 90.0,
            absence: 10.0,
            behavior: "neutral".to_string(),
        };
        assert!(validate_student(&input).is_ok());
        input.final_grade = 21.0;
        assert!(validate_student(&input).is_err());
        input.final_grade = 14.0;
        input.absence = -1.0;
        assert!(validate_student(&input).is_err());
    }
}
