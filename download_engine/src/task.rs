use std::ffi::OsString;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::TransferError;
use crate::utils::file_name_from_url;

/// Extension of the per-file metadata record written next to each download.
pub const SIDECAR_EXTENSION: &str = "riptide";

/// Stable identifier for a task, derived from its URL so that re-adding the
/// same link always maps onto the same entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn from_url(url: &str) -> Self {
        TaskId(Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes()))
    }

    /// Identity for a file adopted from disk with no recorded URL.
    pub fn from_orphan_file(file_name: &str) -> Self {
        TaskId(Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("file:///{}", file_name).as_bytes(),
        ))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// What a caller hands to the manager to start a download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    /// Destination directory; the configured download dir when `None`.
    pub file_dir: Option<PathBuf>,
    /// Destination file name; derived from the URL when `None`.
    pub file_name: Option<String>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file_dir: None,
            file_name: None,
            referrer: None,
            user_agent: None,
        }
    }
}

/// Lifecycle state of a download task. Only the registry mutates this;
/// everything else observes snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Accepted, waiting for a free download slot.
    Pending,
    /// Executor bound, first response not interpreted yet.
    Preparing,
    Downloading,
    Paused,
    Completed,
    /// Terminal failure; the payload is the rendered `TransferError`.
    Failed(String),
    Cancelled,
    /// Found on disk at startup with fewer bytes than a complete file
    /// should have; waits for the caller to re-enqueue or remove it.
    IncompleteDownloadDetected,
}

impl TaskState {
    /// Terminal states never change again without an explicit re-enqueue
    /// or restart.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed(_) | TaskState::Cancelled
        )
    }

    /// States with a live executor bound to the task.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Preparing | TaskState::Downloading)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Preparing => "preparing",
            TaskState::Downloading => "downloading",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed(_) => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::IncompleteDownloadDetected => "incomplete",
        }
    }
}

#[derive(Clone, Debug)]
pub struct DownloadTask {
    /// Unique identifier for the download, stable per URL.
    pub id: TaskId,
    /// URL of the download. Empty for files adopted from disk without a
    /// sidecar record.
    pub url: String,
    /// Destination file name.
    pub file_name: String,
    /// Full destination path.
    pub file_path: PathBuf,
    /// Expected size; `None` until discovered from response headers.
    pub total_bytes: Option<u64>,
    /// Bytes persisted to disk so far.
    pub downloaded_bytes: u64,
    /// Whole percents 0-100, derived; keeps its last value while the total
    /// is unknown.
    pub progress: u8,
    /// Bytes per second over the most recent measurement window.
    pub speed: u64,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Referrer URL sent with the request.
    pub referrer: Option<String>,
    /// User-Agent override for this task.
    pub user_agent: Option<String>,
    /// Raw Content-Disposition header of the last response.
    pub content_disposition: Option<String>,
    /// Content-Type of the last response.
    pub mime_type: Option<String>,
    /// Raw Content-Length of the last response; `total_bytes` is the
    /// authoritative expected size.
    pub content_length: Option<u64>,
    /// When the task was first enqueued.
    pub date_added: DateTime<Utc>,
    /// When the task last reached a terminal state.
    pub date_finished: Option<DateTime<Utc>>,
    /// Incremented each time an executor is dispatched; events tagged with
    /// an older attempt are dropped.
    pub attempt: u64,
}

impl DownloadTask {
    pub fn new(request: DownloadRequest, default_dir: &Path) -> Self {
        let id = TaskId::from_url(&request.url);
        let file_name = request
            .file_name
            .or_else(|| file_name_from_url(&request.url))
            .unwrap_or_else(|| format!("riptide-download-{}.bin", id));
        let dir = request
            .file_dir
            .unwrap_or_else(|| default_dir.to_path_buf());

        Self {
            id,
            url: request.url,
            file_path: dir.join(&file_name),
            file_name,
            total_bytes: None,
            downloaded_bytes: 0,
            progress: 0,
            speed: 0,
            state: TaskState::Pending,
            referrer: request.referrer,
            user_agent: request.user_agent,
            content_disposition: None,
            mime_type: None,
            content_length: None,
            date_added: Utc::now(),
            date_finished: None,
            attempt: 0,
        }
    }
}

/// Derive whole-percent progress from byte counts, clamped to 0-100.
/// `None` while the total is unknown; a known zero-byte total counts as
/// already complete.
pub fn progress_percent(downloaded_bytes: u64, total_bytes: Option<u64>) -> Option<u8> {
    let total = total_bytes?;
    if total == 0 {
        return Some(100);
    }
    let percent = (downloaded_bytes as f64 / total as f64) * 100.0;
    Some(percent.clamp(0.0, 100.0) as u8)
}

/// Response metadata an executor discovers once per attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub total_bytes: Option<u64>,
    pub content_length: Option<u64>,
    pub mime_type: Option<String>,
    pub content_disposition: Option<String>,
}

/// Progress feed from one executor attempt.
///
/// The sequence is ordered and finite: zero or more non-terminal events
/// followed by exactly one attempt-ending event (`Paused`, `Completed`,
/// `Failed` or `Cancelled`).
#[derive(Clone, Debug)]
pub enum TransferEvent {
    /// Attempt dispatched, response not interpreted yet.
    Preparing,
    /// Response headers interpreted; data-only update, at most once per
    /// attempt.
    Metadata(ResponseMetadata),
    Downloading {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        /// Derived percentage; `None` while the total is unknown.
        progress: Option<u8>,
        /// Bytes per second since the previous emission.
        speed: u64,
    },
    /// Cooperative stop with the partial file kept for a later attempt.
    Paused {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
    },
    Completed {
        file_path: PathBuf,
        downloaded_bytes: u64,
    },
    Failed(TransferError),
    Cancelled,
}

impl TransferEvent {
    /// Whether this event ends the attempt that produced it.
    pub fn ends_attempt(&self) -> bool {
        matches!(
            self,
            TransferEvent::Paused { .. }
                | TransferEvent::Completed { .. }
                | TransferEvent::Failed(_)
                | TransferEvent::Cancelled
        )
    }
}

/// Per-file metadata record surviving process restarts, stored as JSON next
/// to the payload at `<file_path>.riptide`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskSidecar {
    pub url: String,
    pub file_name: String,
    pub total_bytes: Option<u64>,
}

impl TaskSidecar {
    pub async fn load(path: &Path) -> std::io::Result<Self> {
        let raw = tokio::fs::read(path).await?;
        serde_json::from_slice(&raw).map_err(std::io::Error::other)
    }

    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        let raw = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        tokio::fs::write(path, raw).await
    }
}

/// `<file>.riptide` next to the payload file.
pub fn sidecar_path(file_path: &Path) -> PathBuf {
    let mut name = OsString::from(file_path.as_os_str());
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

/// Whether a directory entry is one of our sidecar records.
pub fn is_sidecar(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext == SIDECAR_EXTENSION)
        .unwrap_or(false)
}
