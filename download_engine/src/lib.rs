pub mod config;
pub mod errors;
pub mod integrity;
pub mod manager;
pub mod registry;
pub mod task;
pub mod transfer;
pub mod utils;

pub use config::EngineConfig;
pub use manager::{DownloadManager, DownloadManagerHandle, Notice};
pub use task::{DownloadRequest, DownloadTask, TaskId, TaskState, TransferEvent};
