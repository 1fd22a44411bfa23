//! Execution export pipeline.
//!
//! Users request an export of their execution history; the request is stored
//! as a QUEUED job and picked up by whichever node claims it first. Export
//! nodes page through matching executions, enrich each page through a chain
//! of processors, write one folder per execution into a zip archive, upload
//! it and notify the requester. A second iterator purges archives once their
//! TTL has passed.
//!
//! # Usage
//!
//! ```rust,ignore
//! use execport::{ExportConfig, ExportHandler, Scheduler};
//!
//! let handler = Arc::new(ExportHandler::new(store.clone(), collaborators.clone(), config.clone()));
//! let scheduler = Scheduler::new(store, collaborators.accounts.clone(), handler, &config.node_id, config.export.clone());
//! tokio::spawn(scheduler.run(shutdown_rx));
//! ```

pub mod archive;
pub mod cleanup;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod handler;
pub mod local;
pub mod metrics;
pub mod model;
pub mod notifier;
pub mod processors;
pub mod scheduler;

pub use archive::{ArchiveContext, ArchiveSummary, ArchiveWriter};
pub use cleanup::CleanupHandler;
pub use collaborators::Collaborators;
pub use config::{ExportConfig, IteratorConfig};
pub use error::{ExportError, Result, NO_EXECUTIONS_MESSAGE};
pub use fetcher::BatchFetcher;
pub use handler::ExportHandler;
pub use metrics::METRICS;
pub use model::{Batch, ExecutionRecord};
pub use notifier::Notifier;
pub use scheduler::{JobHandler, Scheduler};
