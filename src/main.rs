use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use tracing::info;

use dropout_risk::api::{self, AppState};
use dropout_risk::config::AppConfig;
use dropout_risk::database::Database;
use dropout_risk::logger;
use dropout_risk::model::RiskClassifier;

async fn start_api(state: AppState) -> std::io::Result<()> {
    let (host, port) = state.config.bind_address();
    let workers = state.config.server.workers;
    let upload_limit = state.config.server.max_upload_bytes;
    let state = web::Data::new(state);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(upload_limit))
            .app_data(api::json_config())
            .configure(api::configure)
    });
    let server = match workers {
        Some(workers) => server.workers(workers),
        None => server,
    };

    server.bind((host.as_str(), port))?.run().await
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;
    logger::init_logger(&config.logging);

    let classifier = RiskClassifier::from_path(&config.model.path)
        .with_context(|| format!("failed to load model artifact from {}", config.model.path))?;
    let info = classifier.info();
    info!(
        version = %info.version,
        classifier = %info.classifier,
        estimators = info.estimators,
        "model loaded"
    );

    let db = Database::connect(&config.database.url, config.database.max_connections)
        .await
        .with_context(|| format!("failed to open database {}", config.database.url))?;
    info!(url = %config.database.url, "database ready");

    let state = AppState::new(config, db, classifier);
    if let Some(admin) = state
        .users
        .ensure_superadmin()
        .await
        .context("failed to bootstrap superadmin")?
    {
        info!(username = %admin.username, "superadmin available");
    }

    let (host, port) = state.config.bind_address();
    info!("starting dropout risk API on http://{}:{}", host, port);

    start_api(state).await?;
    Ok(())
}
