//! Segmented-media download orchestration.

pub mod config;
pub mod error;
pub mod events;
pub mod input;
pub mod pool;
pub mod registry;
pub mod service;
pub mod supervisor;
pub mod task;

pub use config::{ServiceConfig, WorkerConfig};
pub use error::{Error, Result};
pub use events::{DownloadEvent, EventBus};
pub use input::{BatchItem, parse_batch_input};
pub use service::{DownloadOptions, DownloadService, DownloadServiceBuilder, ServiceStats};
pub use task::{DownloadTask, TaskStatus};

pub use playlist::{PlaylistError, PlaylistResolver, PlaylistSummary};
