use actix_web::http::{header, StatusCode};
use actix_web::{test, web, App};
use serde_json::{json, Value};
use uuid::Uuid;

use dropout_risk::api::{self, AppState};
use dropout_risk::config::AppConfig;
use dropout_risk::database::Database;
use dropout_risk::model::RiskClassifier;

const ADMIN_PASSWORD: &str = "admin-pass-1";

const SHEET: &str = "estudiante_id,nombre,fecha,nota_final,asistencia,inasistencia,conducta\n\
                     1,Ana Torres,2025-03-03,18,95,5,positivo\n\
                     2,Luis Rojas,2025-03-04,5,40,60,agresivo\n\
                     3,Carla Diaz,2025-04-07,14,85,15,neutral\n\
                     4,Pedro Ruiz,2025-04-08,doce,80,20,neutral\n";

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.auth.bcrypt_cost = 4;
    config.auth.superadmin_password = Some(ADMIN_PASSWORD.to_string());
    config.storage.upload_dir = std::env::temp_dir()
        .join(format!("dropout_risk_uploads_{}", Uuid::new_v4().simple()))
        .to_string_lossy()
        .into_owned();
    config
}

async fn state_with(config: AppConfig) -> web::Data<AppState> {
    let db = Database::in_memory().await.unwrap();
    let classifier = RiskClassifier::from_path(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/models/dropout_model.json"
    ))
    .unwrap();

    let state = AppState::new(config, db, classifier);
    state.users.ensure_superadmin().await.unwrap();
    web::Data::new(state)
}

async fn test_state() -> web::Data<AppState> {
    state_with(test_config()).await
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data($state.clone())
                .app_data(api::json_config())
                .configure(api::configure),
        )
        .await
    };
}

macro_rules! send {
    ($app:expr, $req:expr) => {{
        let res = test::call_service(&$app, $req.to_request()).await;
        let status = res.status();
        let body = test::read_body(res).await;
        let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }};
}

macro_rules! login {
    ($app:expr, $username:expr, $password:expr) => {{
        let (status, body) = send!(
            $app,
            test::TestRequest::post()
                .uri("/auth/login")
                .set_json(json!({ "username": $username, "password": $password }))
        );
        assert_eq!(status, StatusCode::OK, "login failed: {}", body);
        body["access_token"].as_str().unwrap().to_string()
    }};
}

macro_rules! register {
    ($app:expr, $username:expr) => {{
        let (status, body) = send!(
            $app,
            test::TestRequest::post().uri("/auth/register").set_json(json!({
                "username": $username,
                "email": format!("{}@colegio.edu.pe", $username),
                "password": "docente123"
            }))
        );
        assert_eq!(status, StatusCode::CREATED, "register failed: {}", body);
        body
    }};
}

fn bearer(token: &str) -> (header::HeaderName, String) {
    (header::AUTHORIZATION, format!("Bearer {}", token))
}

#[actix_web::test]
async fn test_health_and_model_info() {
    let state = test_state().await;
    let app = app!(state);

    let (status, body) = send!(app, test::TestRequest::get().uri("/health"));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model_loaded"], true);
    assert_eq!(body["database"], true);

    let (status, body) = send!(app, test::TestRequest::get().uri("/model/info"));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["classifier"], "random_forest");
    assert_eq!(body["feature_columns"].as_array().unwrap().len(), 7);
}

#[actix_web::test]
async fn test_predict_bands_examples() {
    let state = test_state().await;
    let app = app!(state);

    let (status, body) = send!(
        app,
        test::TestRequest::post().uri("/predict").set_json(json!({
            "final_grade": 18.0, "attendance": 95.0, "absence": 5.0, "behavior": "positivo"
        }))
    );
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["risk_band"], "Bajo");
    assert!(body["probability"].as_f64().unwrap() < 0.4);
    assert_eq!(body["outcome"], "No deserta");

    let (_, body) = send!(
        app,
        test::TestRequest::post().uri("/predict").set_json(json!({
            "final_grade": 5.0, "attendance": 40.0, "absence": 60.0, "behavior": "agresivo"
        }))
    );
    assert_eq!(body["risk_band"], "Alto");
    assert!(body["probability"].as_f64().unwrap() >= 0.7);
    assert_eq!(body["risk_factors"], json!(["low_grade", "low_attendance", "behavior_issues"]));

    let (status, _) = send!(
        app,
        test::TestRequest::post().uri("/predict").set_json(json!({
            "final_grade": 25.0, "attendance": 95.0
        }))
    );
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[actix_web::test]
async fn test_auth_flow() {
    let state = test_state().await;
    let app = app!(state);

    let user = register!(app, "mflores");
    assert_eq!(user["role"], "docente");
    assert!(user.get("password_hash").is_none());

    let (status, body) = send!(
        app,
        test::TestRequest::post().uri("/auth/register").set_json(json!({
            "username": "mflores", "email": "otro@colegio.edu.pe", "password": "docente123"
        }))
    );
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("username"));

    let (status, _) = send!(
        app,
        test::TestRequest::post()
            .uri("/auth/login")
            .set_json(json!({ "username": "mflores", "password": "incorrecta" }))
    );
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let token = login!(app, "mflores", "docente123");
    let (status, body) = send!(
        app,
        test::TestRequest::get().uri("/auth/me").insert_header(bearer(&token))
    );
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "mflores");

    let (status, _) = send!(
        app,
        test::TestRequest::post()
            .uri("/auth/change-password")
            .insert_header(bearer(&token))
            .set_json(json!({ "old_password": "docente123", "new_password": "nueva-clave" }))
    );
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send!(
        app,
        test::TestRequest::post().uri("/auth/logout").insert_header(bearer(&token))
    );
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send!(
        app,
        test::TestRequest::get().uri("/auth/me").insert_header(bearer(&token))
    );
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    login!(app, "mflores", "nueva-clave");
}

#[actix_web::test]
async fn test_upload_history_and_dashboards() {
    let state = test_state().await;
    let app = app!(state);
    register!(app, "mflores");
    let token = login!(app, "mflores", "docente123");

    let (status, report) = send!(
        app,
        test::TestRequest::post()
            .uri("/uploads?filename=notas_marzo.csv")
            .insert_header(bearer(&token))
            .set_payload(SHEET)
    );
    assert_eq!(status, StatusCode::OK, "{}", report);
    let upload = &report["upload"];
    let upload_id = upload["id"].as_i64().unwrap();
    assert_eq!(upload["status"], "partial");
    assert_eq!(upload["total_students"], 4);
    assert_eq!(upload["processed_students"], 3);
    assert_eq!(upload["failed_students"], 1);
    assert_eq!(upload["high_risk_count"], 1);
    assert_eq!(upload["low_risk_count"], 2);
    assert_eq!(upload["high_risk_percentage"], 33.33);
    assert_eq!(report["failures"][0]["row"], 4);

    let (_, body) = send!(
        app,
        test::TestRequest::get()
            .uri("/dashboard/risk_distribution")
            .insert_header(bearer(&token))
    );
    assert_eq!(body["upload_id"], upload_id);
    assert_eq!(body["data"]["total_students"], 3);
    assert_eq!(body["data"]["bands"][0]["risk_band"], "Alto");
    assert_eq!(body["data"]["bands"][0]["count"], 1);

    let (_, body) = send!(
        app,
        test::TestRequest::get()
            .uri(&format!("/dashboard/risk_summary?upload_id={}", upload_id))
            .insert_header(bearer(&token))
    );
    assert_eq!(body["data"][2]["month"], "Mar");
    assert_eq!(body["data"][2]["percentage"], 50.0);
    assert_eq!(body["data"][3]["total"], 1);

    let (_, body) = send!(
        app,
        test::TestRequest::get()
            .uri("/dashboard/attendance_heatmap")
            .insert_header(bearer(&token))
    );
    assert_eq!(body["data"]["series"][0]["label"], "Mar 2025");
    assert_eq!(body["data"]["series"][1]["label"], "Apr 2025");
    assert_eq!(body["data"]["series"][1]["values"][0], 85.0);

    let (_, body) = send!(
        app,
        test::TestRequest::get()
            .uri("/dashboard/students_at_risk")
            .insert_header(bearer(&token))
    );
    assert_eq!(body["data"][0]["name"], "Luis Rojas");

    let (_, body) = send!(
        app,
        test::TestRequest::get()
            .uri("/uploads/history?search=marzo")
            .insert_header(bearer(&token))
    );
    assert_eq!(body["total"], 1);
    assert_eq!(body["uploads"][0]["username"], "mflores");

    let (_, body) = send!(
        app,
        test::TestRequest::get()
            .uri(&format!("/uploads/history/{}/predictions?limit=2", upload_id))
            .insert_header(bearer(&token))
    );
    assert_eq!(body["total"], 3);
    assert_eq!(body["predictions"].as_array().unwrap().len(), 2);

    let (status, body) = send!(
        app,
        test::TestRequest::put()
            .uri(&format!("/uploads/history/{}/notes", upload_id))
            .insert_header(bearer(&token))
            .set_json(json!({ "notes": "revisar a Luis" }))
    );
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["notes"], "revisar a Luis");

    let (_, body) = send!(
        app,
        test::TestRequest::get()
            .uri("/uploads/statistics")
            .insert_header(bearer(&token))
    );
    assert_eq!(body["total_uploads"], 1);
    assert_eq!(body["total_students_processed"], 3);
    assert_eq!(body["uploads_last_30_days"], 1);

    let (status, _) = send!(
        app,
        test::TestRequest::delete()
            .uri(&format!("/uploads/history/{}", upload_id))
            .insert_header(bearer(&token))
    );
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send!(
        app,
        test::TestRequest::get()
            .uri(&format!("/uploads/history/{}", upload_id))
            .insert_header(bearer(&token))
    );
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send!(
        app,
        test::TestRequest::get()
            .uri("/dashboard/grades_summary")
            .insert_header(bearer(&token))
    );
    assert_eq!(body["upload_id"], Value::Null);
    assert_eq!(body["data"]["total_students"], 0);
}

#[actix_web::test]
async fn test_upload_missing_columns_is_rejected_and_recorded() {
    let state = test_state().await;
    let app = app!(state);
    register!(app, "mflores");
    let token = login!(app, "mflores", "docente123");

    let (status, body) = send!(
        app,
        test::TestRequest::post()
            .uri("/uploads?filename=incompleto.csv")
            .insert_header(bearer(&token))
            .set_payload("nombre,nota_final\nAna,12\n")
    );
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.contains("asistencia"));
    assert!(detail.contains("conducta"));

    let (_, body) = send!(
        app,
        test::TestRequest::get()
            .uri("/uploads/history")
            .insert_header(bearer(&token))
    );
    assert_eq!(body["uploads"][0]["status"], "error");
    assert!(body["uploads"][0]["error_message"]
        .as_str()
        .unwrap()
        .contains("inasistencia"));

    let (status, _) = send!(
        app,
        test::TestRequest::post()
            .uri("/uploads?filename=notas.xlsx")
            .insert_header(bearer(&token))
            .set_payload(SHEET)
    );
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[actix_web::test]
async fn test_uploads_are_private_to_their_owner() {
    let state = test_state().await;
    let app = app!(state);
    register!(app, "ana");
    register!(app, "luis");
    let ana = login!(app, "ana", "docente123");
    let luis = login!(app, "luis", "docente123");

    let (_, report) = send!(
        app,
        test::TestRequest::post()
            .uri("/uploads?filename=ana.csv")
            .insert_header(bearer(&ana))
            .set_payload(SHEET)
    );
    let upload_id = report["upload"]["id"].as_i64().unwrap();

    let (status, _) = send!(
        app,
        test::TestRequest::get()
            .uri(&format!("/uploads/history/{}", upload_id))
            .insert_header(bearer(&luis))
    );
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, body) = send!(
        app,
        test::TestRequest::get()
            .uri("/uploads/history")
            .insert_header(bearer(&luis))
    );
    assert_eq!(body["total"], 0);

    let (_, body) = send!(
        app,
        test::TestRequest::get()
            .uri("/dashboard/risk_distribution")
            .insert_header(bearer(&luis))
    );
    assert_eq!(body["upload_id"], Value::Null);

    // administrators see every upload
    let admin = login!(app, "administrador", ADMIN_PASSWORD);
    let (status, _) = send!(
        app,
        test::TestRequest::get()
            .uri(&format!("/uploads/history/{}", upload_id))
            .insert_header(bearer(&admin))
    );
    assert_eq!(status, StatusCode::OK);
}

#[actix_web::test]
async fn test_compare_uploads() {
    let state = test_state().await;
    let app = app!(state);
    register!(app, "mflores");
    let token = login!(app, "mflores", "docente123");

    let mut ids = Vec::new();
    for name in ["marzo.csv", "abril.csv"] {
        let (_, report) = send!(
            app,
            test::TestRequest::post()
                .uri(&format!("/uploads?filename={}", name))
                .insert_header(bearer(&token))
                .set_payload(SHEET)
        );
        ids.push(report["upload"]["id"].as_i64().unwrap());
    }

    let (status, body) = send!(
        app,
        test::TestRequest::get()
            .uri(&format!("/uploads/compare?ids={},{}", ids[0], ids[1]))
            .insert_header(bearer(&token))
    );
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uploads"].as_array().unwrap().len(), 2);
    assert_eq!(body["high_risk_change"], 0.0);

    let (status, _) = send!(
        app,
        test::TestRequest::get()
            .uri(&format!("/uploads/compare?ids={}", ids[0]))
            .insert_header(bearer(&token))
    );
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send!(
        app,
        test::TestRequest::get()
            .uri(&format!("/uploads/compare?ids={},999", ids[0]))
            .insert_header(bearer(&token))
    );
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_admin_panel_user_management() {
    let state = test_state().await;
    let app = app!(state);

    let (status, _) = send!(
        app,
        test::TestRequest::post().uri("/admin/login").set_json(json!({
            "username": "administrador", "password": ADMIN_PASSWORD, "access_code": "WRONG"
        }))
    );
    assert_eq!(status, StatusCode::FORBIDDEN);

    let standard = login!(app, "administrador", ADMIN_PASSWORD);
    let (status, _) = send!(
        app,
        test::TestRequest::get().uri("/admin/users").insert_header(bearer(&standard))
    );
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send!(
        app,
        test::TestRequest::post().uri("/admin/login").set_json(json!({
            "username": "administrador", "password": ADMIN_PASSWORD, "access_code": "EDUFORGE2025"
        }))
    );
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scope"], "admin_panel");
    let admin_token = body["access_token"].as_str().unwrap().to_string();
    let superadmin_id = body["user"]["id"].as_i64().unwrap();

    let (status, created) = send!(
        app,
        test::TestRequest::post()
            .uri("/admin/users")
            .insert_header(bearer(&admin_token))
            .set_json(json!({
                "username": "rquispe",
                "email": "rquispe@colegio.edu.pe",
                "password": "docente123",
                "first_name": "Rosa"
            }))
    );
    assert_eq!(status, StatusCode::CREATED);
    let user_id = created["id"].as_i64().unwrap();

    let (status, _) = send!(
        app,
        test::TestRequest::post()
            .uri("/admin/users")
            .insert_header(bearer(&admin_token))
            .set_json(json!({
                "username": "x",
                "email": "x@colegio.edu.pe",
                "password": "docente123"
            }))
    );
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (_, body) = send!(
        app,
        test::TestRequest::get().uri("/admin/users").insert_header(bearer(&admin_token))
    );
    let users = body.as_array().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["username"], "rquispe");

    let (status, body) = send!(
        app,
        test::TestRequest::put()
            .uri(&format!("/admin/users/{}", user_id))
            .insert_header(bearer(&admin_token))
            .set_json(json!({ "role": "administrador" }))
    );
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "administrador");

    let (status, _) = send!(
        app,
        test::TestRequest::post()
            .uri(&format!("/admin/users/{}/change-password", user_id))
            .insert_header(bearer(&admin_token))
            .set_json(json!({ "new_password": "otra-clave" }))
    );
    assert_eq!(status, StatusCode::OK);
    login!(app, "rquispe", "otra-clave");

    let (status, _) = send!(
        app,
        test::TestRequest::delete()
            .uri(&format!("/admin/users/{}", superadmin_id))
            .insert_header(bearer(&admin_token))
    );
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send!(
        app,
        test::TestRequest::delete()
            .uri(&format!("/admin/users/{}", user_id))
            .insert_header(bearer(&admin_token))
    );
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send!(
        app,
        test::TestRequest::get()
            .uri(&format!("/admin/users/{}", user_id))
            .insert_header(bearer(&admin_token))
    );
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_registration_can_be_disabled() {
    let mut config = test_config();
    config.auth.allow_registration = false;
    let state = state_with(config).await;
    let app = app!(state);

    let (status, body) = send!(
        app,
        test::TestRequest::post().uri("/auth/register").set_json(json!({
            "username": "mflores",
            "email": "mflores@colegio.edu.pe",
            "password": "docente123"
        }))
    );
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["detail"], "registration is disabled");
}

#[actix_web::test]
async fn test_latin1_sheet_is_accepted() {
    let state = test_state().await;
    let app = app!(state);
    register!(app, "mflores");
    let token = login!(app, "mflores", "docente123");

    let mut sheet = b"nombre,nota_final,asistencia,inasistencia,conducta,a\xf1o\n".to_vec();
    sheet.extend_from_slice(b"Pe\xf1a,14,85,15,neutral,2025\n");
    let (status, report) = send!(
        app,
        test::TestRequest::post()
            .uri("/uploads?filename=latin1.csv")
            .insert_header(bearer(&token))
            .set_payload(sheet)
    );
    assert_eq!(status, StatusCode::OK, "{}", report);
    assert_eq!(report["upload"]["status"], "success");
    assert_eq!(report["predictions"][0]["name"], "Peña");
}

#[actix_web::test]
async fn test_export_and_download_upload() {
    let state = test_state().await;
    let app = app!(state);
    register!(app, "ana");
    register!(app, "luis");
    let ana = login!(app, "ana", "docente123");
    let luis = login!(app, "luis", "docente123");

    let (_, report) = send!(
        app,
        test::TestRequest::post()
            .uri("/uploads?filename=notas_marzo.csv")
            .insert_header(bearer(&ana))
            .set_payload(SHEET)
    );
    let upload_id = report["upload"]["id"].as_i64().unwrap();

    let res = test::call_service(
        &app,
        test::TestRequest::get()
            .uri(&format!("/uploads/history/{}/export", upload_id))
            .insert_header(bearer(&ana))
            .to_request(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().get(header::CONTENT_DISPOSITION).unwrap()
        .to_str()
        .unwrap()
        .contains(&format!("predicciones_{}.csv", upload_id)));
    let body = test::read_body(res).await;
    let text = String::from_utf8(body.to_vec()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("estudiante_id,nombre,fecha,nota_final"));
    assert!(lines[0].ends_with("prediccion,nivel_riesgo,probabilidad"));
    assert!(lines[2].starts_with("2,Luis Rojas,2025-03-04,"));
    assert!(lines[2].contains("Sí deserta,Alto,"));

    let res = test::call_service(
        &app,
        test::TestRequest::get()
            .uri(&format!("/uploads/history/{}/download", upload_id))
            .insert_header(bearer(&ana))
            .to_request(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().get(header::CONTENT_DISPOSITION).unwrap()
        .to_str()
        .unwrap()
        .contains("notas_marzo.csv"));
    let body = test::read_body(res).await;
    assert_eq!(&body[..], SHEET.as_bytes());

    for route in ["export", "download"] {
        let (status, _) = send!(
            app,
            test::TestRequest::get()
                .uri(&format!("/uploads/history/{}/{}", upload_id, route))
                .insert_header(bearer(&luis))
        );
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    let (status, _) = send!(
        app,
        test::TestRequest::delete()
            .uri(&format!("/uploads/history/{}", upload_id))
            .insert_header(bearer(&ana))
    );
    assert_eq!(status, StatusCode::OK);
    let stored = std::path::Path::new(&state.config.storage.upload_dir)
        .join(report["upload"]["filename"].as_str().unwrap());
    assert!(!stored.exists());
}
