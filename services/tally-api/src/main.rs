use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use tally_api::{config::AppConfig, handlers};
use tally_core::Ledger;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let mut config = AppConfig::from_env().context("Failed to load configuration")?;
    if std::env::args().any(|arg| arg == "--in-memory") {
        config.server.in_memory = true;
    }

    init_tracing(&config.server.log_format);
    config.validate().map_err(anyhow::Error::msg)?;

    let ledger = if config.server.in_memory {
        warn!("Serving from process memory, nothing will be persisted");
        Ledger::in_memory(&config.ledger.engine)?
    } else {
        Ledger::connect(&config.ledger)
            .await
            .context("Failed to connect to database")?
    };

    info!(
        "Starting {} on {}:{}",
        config.ledger.service_name, config.server.host, config.server.port
    );

    let ledger = web::Data::new(ledger);

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(ledger.clone())
            .configure(handlers::configure_routes)
    })
    .workers(config.server.workers)
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    Ok(())
}
