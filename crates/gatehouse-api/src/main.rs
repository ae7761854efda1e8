//! Gatehouse API Server
//!
//! Token lifecycle and invitation redemption service.
//!
//! Author: hephaex@gmail.com

use gatehouse_api::{
    create_router,
    state::{AppState, Backends},
};
use gatehouse_core::{schema, AppConfig, LoggingConfig, PgStore, StaticSecrets, SystemClock};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &logging.level;
        format!("gatehouse_api={level},gatehouse_core={level},audit=info,tower_http=info").into()
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(logging.include_location)
        .with_line_number(logging.include_location);

    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config() -> anyhow::Result<AppConfig> {
    let config = match std::env::var("GATEHOUSE_CONFIG") {
        Ok(path) => AppConfig::from_file(path)?.with_env_override()?,
        Err(_) => AppConfig::from_env()?,
    };
    config.require_secrets()?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_tracing(&config.logging);

    let store = PgStore::connect(&config.database).await?;
    if config.database.auto_repair {
        let report = schema::repair(store.pool(), &config.database.table_prefix).await?;
        if report.is_noop() {
            tracing::info!("Schema up to date");
        } else {
            tracing::info!(?report, "Schema repaired");
        }
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let secrets = Arc::new(StaticSecrets::from_config(&config.auth));
    let state = Arc::new(AppState::new(
        config,
        Backends::postgres(store),
        secrets,
        Arc::new(SystemClock),
    ));

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Gatehouse API starting on http://{}", addr);
    tracing::info!("Swagger UI available at http://{}/swagger-ui/", addr);
    tracing::info!("OpenAPI document at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
