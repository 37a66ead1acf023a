mod backup;
mod config;
mod error;
mod ingest;
mod layout;
mod mqtt;
mod router;
mod storage;
mod telemetry;

use crate::backup::{BackupLog, CsvBackupLog, DisabledBackupLog};
use crate::config::Config;
use crate::ingest::{IngestLoop, IngestStats, PersistenceCoordinator};
use crate::storage::{build_pool, PgRecordStore, RecordStore};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,ward_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "ward-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error=%err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error=%err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let stats = Arc::new(IngestStats::new());
    let pool = build_pool(
        &config.database_url,
        config.db_pool_size,
        config.persist_timeout(),
    )?;
    let store: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(pool.clone()));
    let backup: Arc<dyn BackupLog> = if config.backup_enabled {
        Arc::new(CsvBackupLog::new(&config.backup_dir))
    } else {
        Arc::new(DisabledBackupLog)
    };
    let coordinator =
        PersistenceCoordinator::new(store, backup, config.persist_timeout(), stats.clone());
    let mut ingest = IngestLoop::new(config.layout.clone(), coordinator, stats.clone());
    let topics = ingest.topics();

    tracing::info!(
        broker = %format!("{}:{}", config.mqtt_host, config.mqtt_port),
        client_id = %config.mqtt_client_id,
        profile = ?config.profile,
        layout_source = if config.layout_from_setup { "setup_config" } else { "profile" },
        ward_id = config.ward_id,
        patient_id = config.patient_id,
        topics = ?topics,
        backup_dir = %config.backup_dir.display(),
        backup_enabled = config.backup_enabled,
        "ward-ingest starting"
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        signal_cancel.cancel();
    });

    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let transport = tokio::spawn(mqtt::run_transport(
        config.clone(),
        topics,
        stats.clone(),
        tx,
        cancel.clone(),
    ));

    let result = ingest.run(rx, cancel.clone()).await;
    cancel.cancel();
    // Transport failures already reached the loop as events.
    if let Err(err) = transport.await {
        tracing::warn!(error=%err, "MQTT task failed");
    }

    ingest.log_summary();
    pool.close().await;
    opentelemetry::global::shutdown_tracer_provider();

    result?;
    Ok(())
}
