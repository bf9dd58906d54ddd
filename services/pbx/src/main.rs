//! Entry point for the ARI call-control worker (spec.md §4.5, §6).
//!
//! Boot sequence mirrors `app/main.py`'s top-level sequencing: load and
//! validate configuration, start the ARI REST client, stand up the database
//! pool and run migrations, construct the call service, then run the event
//! loop until a shutdown signal arrives.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pbx::ari::AriClient;
use pbx::call_service::CallService;
use pbx::config;
use pbx::recorder::CallRecorder;
use pbx::worker;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = match config::load_settings() {
        Ok(settings) => settings,
        Err(err) => {
            tracing::error!(error = %err, "fatal configuration error");
            std::process::exit(1);
        }
    };

    let ari = Arc::new(AriClient::new(
        settings.ari_base(),
        settings.ari_app.clone(),
        settings.ari_user.clone(),
        settings.ari_pass.clone(),
    ));
    ari.start().await.expect("failed to start ari client");

    // Small connection pool is enough at expected call rates (spec.md §9:
    // <10^3 concurrent calls); the recorder only ever holds it for the
    // duration of one short transaction.
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .expect("failed to connect db");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");

    let recorder = Arc::new(CallRecorder::new(pool));
    let service = CallService::new(ari.clone(), recorder);

    let ws_url = settings.ws_url();
    tracing::info!(ws_url, "pbx call-control worker starting");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    worker::run(&ws_url, &service, shutdown).await;

    ari.close().await;
    tracing::info!("pbx call-control worker stopped");
}
