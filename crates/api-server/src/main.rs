use entity_index_api_server::{start_server, ApiState};
use entity_index_broker::InProcessBroker;
use entity_index_core::{DataLayout, PipelineConfig};
use entity_index_pipeline::{
    capabilities, FfmpegFrameSource, JobService, PipelineContext, ProcessingHarness, Worker,
};
use entity_index_search::SearchIndex;
use entity_index_store::JobStore;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Single-node deployment: the facade and an in-process worker share one
/// bounded queue.
#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "entity_index=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PipelineConfig::default();
    let layout = DataLayout::new(config.data_dir.clone());
    if let Err(e) = layout.ensure_root_dirs() {
        tracing::error!("Could not create data directories: {e}");
        std::process::exit(1);
    }

    let store = match JobStore::connect(&config.state_db_url).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("State store unavailable: {e}");
            std::process::exit(1);
        }
    };

    let search = Arc::new(SearchIndex::new(capabilities::build_embedder(&config)));
    match store.list_completed().await {
        Ok(jobs) => search.rebuild(&jobs),
        Err(e) => tracing::warn!("Search index rebuild skipped: {e}"),
    }

    let (broker, source) = InProcessBroker::channel(config.queue_capacity);
    let broker = Arc::new(broker);

    let detectors = Arc::new(capabilities::build_detector_set(&config));
    let transcriber = capabilities::build_transcriber(&config);
    let harness = Arc::new(ProcessingHarness::new(
        &config,
        Arc::new(FfmpegFrameSource),
        detectors,
        transcriber,
    ));

    let ctx = PipelineContext::new(config, store, search);
    let service = Arc::new(JobService::new(ctx.clone(), broker.clone()));

    let worker = Worker::new(ctx, harness, Arc::new(source), broker);
    tokio::spawn(async move { worker.start().await });

    let addr = std::env::var("ENTITY_INDEX_BIND").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    if let Err(e) = start_server(&addr, ApiState::new(service)).await {
        tracing::error!("Server failed: {e}");
        std::process::exit(1);
    }
}
