use crate::config::Config;
use crate::fetcher::HttpImageFetcher;
use crate::inference::InferenceAdapter;
use crate::orchestrator::{BatchAnalysis, BatchAnalyzer};
use crate::ort_service::OrtVisionLanguageModel;
use crate::queue::QueueBridge;
use crate::registry::{resolve_instance_host, EurekaClient, InstanceInfo};
use crate::server::{HttpServer, SharedState};
use crate::telemetry::Metrics;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let metrics = Arc::new(Metrics::new()?);

    let model = match OrtVisionLanguageModel::load(&config.model) {
        Ok(model) => model,
        Err(e) => {
            tracing::error!("Failed to load vision-language model: {:?}", e);
            return Err(Box::new(e));
        }
    };
    let adapter = InferenceAdapter::new(
        model,
        config.model.num_instances,
        config.model.inference_timeout(),
    );

    let fetcher = HttpImageFetcher::new(&config.fetcher)?;
    let analyzer = BatchAnalyzer::new(fetcher, adapter.clone()).with_metrics(metrics.clone());
    let analyzer: Arc<dyn BatchAnalysis> = Arc::new(analyzer);

    let state = SharedState {
        analyzer: analyzer.clone(),
        metrics: metrics.clone(),
        app_name: config.application.name.clone(),
    };
    let server = HttpServer::new(state, &config.server.get_address()).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut background = Vec::new();

    if config.queue.enabled {
        let bridge = QueueBridge::new(&config.queue, analyzer.clone(), metrics.clone())?;
        background.push(tokio::spawn(bridge.run(shutdown_tx.subscribe())));
    } else {
        tracing::info!("Queue consumer disabled");
    }

    if config.registry.enabled {
        let host = resolve_instance_host(&config.registry).await;
        let instance = InstanceInfo::new(
            &config.application.name,
            &host,
            config.server.port,
            config.registry.heartbeat_interval(),
        );
        let registry = EurekaClient::new(&config.registry, instance)?;
        background.push(tokio::spawn(registry.run(shutdown_tx.subscribe())));
    }

    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    adapter.shutdown();

    for handle in background {
        if let Err(e) = handle.await {
            tracing::error!("Background task failed during shutdown: {}", e);
        }
    }
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("HTTP server stopped with error: {}", e),
        Err(e) => tracing::error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
