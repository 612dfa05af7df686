use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fms_bridge::api::{create_router, AppState};
use fms_bridge::config::Config;
use fms_bridge::manager::{Manager, Vo2Params};
use fms_bridge::model::Kind;
use fms_bridge::source::Source;
use fms_bridge::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "fms_bridge=info,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting FMS bridge");

    let config = Config::load("config.toml");
    if !std::path::Path::new("config.toml").exists() {
        config.save("config.toml")?;
        info!("created default config.toml");
    }
    info!(
        "configuration loaded: database={}, port={}, device_filter={}",
        config.database.path, config.server.port, config.bluetooth.device_name_filter
    );

    let database_url = format!("sqlite://{}", config.database.path);
    let store = Arc::new(Store::new(&database_url).await?);
    info!("database initialized at {}", config.database.path);

    let (source, mut sample_rx, _source_events) = match config.bluetooth.simulate.as_str() {
        "bike" => {
            info!("running against the deterministic bike simulator");
            let (source, sample_rx, events) = Source::new_simulated(Kind::Bike);
            (source, sample_rx, events)
        }
        "rower" => {
            info!("running against the deterministic rower simulator");
            let (source, sample_rx, events) = Source::new_simulated(Kind::Rower);
            (source, sample_rx, events)
        }
        _ => {
            let (source, sample_rx, events) =
                Source::new_live(config.bluetooth.device_name_filter.clone(), config.bluetooth.scan_timeout_secs).await?;
            (source, sample_rx, events)
        }
    };
    let source = Arc::new(source);

    let vo2_params = Vo2Params { weight_kg: config.athlete.weight_kg, age: config.athlete.age, ..Default::default() };
    let (manager, _manager_events) = Manager::new(Arc::clone(&store), Arc::clone(&source), vo2_params);
    let manager = Arc::new(manager);

    let ingest_handle = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            loop {
                match sample_rx.recv().await {
                    Ok(sample) => {
                        if let Err(e) = manager.record_sample(sample).await {
                            if !matches!(e, fms_bridge::error::BridgeError::NotActive) {
                                error!("failed to record sample: {e}");
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        error!("sample ingest lane dropped {n} samples under backpressure");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    let app = create_router(AppState { store: Arc::clone(&store), source: Arc::clone(&source), manager: Arc::clone(&manager) });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("starting HTTP server on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
            error!("server error: {e}");
        }
    });

    info!("FMS bridge is running; API at http://{addr}");

    tokio::select! {
        _ = ingest_handle => info!("sample ingest task completed"),
        _ = server_handle => info!("server task completed"),
        _ = signal::ctrl_c() => info!("received Ctrl+C, shutting down"),
    }

    info!("FMS bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
}
