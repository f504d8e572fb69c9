//! Ingestion pipeline: stage driver, worker loop, and the job service
//!
//! The stage driver walks one job through the ordered stage list, publishing
//! monotonic progress through the state store. The worker loop pulls tasks
//! from the broker, bounds concurrency, and recovers jobs abandoned by a
//! crashed worker at startup. [`service::JobService`] is the operation
//! surface the facade consumes; it never touches pipeline internals beyond
//! enqueueing work and reading committed state.

pub mod capabilities;
pub mod cancel;
pub mod harness;
pub mod service;
pub mod stages;
pub mod worker;

pub use cancel::CancellationRegistry;
pub use harness::{FfmpegFrameSource, FrameSource, ProcessingHarness};
pub use service::{CreateJob, FramesPage, JobService, NearestFrame, StatusView};
pub use stages::StageDriver;
pub use worker::Worker;

use entity_index_core::{DataLayout, PipelineConfig};
use entity_index_search::SearchIndex;
use entity_index_store::JobStore;
use std::sync::Arc;

/// Shared pipeline state: configuration, layout, store, search index,
/// cancellation registry
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub layout: DataLayout,
    pub store: JobStore,
    pub search: Arc<SearchIndex>,
    pub cancellations: CancellationRegistry,
}

impl PipelineContext {
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        store: JobStore,
        search: Arc<SearchIndex>,
    ) -> Arc<Self> {
        let layout = DataLayout::new(config.data_dir.clone());
        Arc::new(Self {
            config,
            layout,
            store,
            search,
            cancellations: CancellationRegistry::new(),
        })
    }
}
