use std::path::Path;

use chrono::Utc;
use tracing::{debug, warn};

use crate::task::{DownloadTask, TaskId, TaskState, TransferEvent, progress_percent};

/// Result of an idempotent enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First time this URL was seen.
    Created,
    /// A terminal or incomplete entry was reset to `Pending` for a fresh
    /// attempt reusing its on-disk partial file.
    Reactivated,
    /// The task is already live; the duplicate request changes nothing.
    AlreadyTracked,
}

/// Authoritative table of download tasks, insertion order preserved.
///
/// All mutation goes through the manager actor, so the registry itself
/// needs no locking; executors only report events and never touch it.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<DownloadTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: TaskId) -> Option<&DownloadTask> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn tasks(&self) -> &[DownloadTask] {
        &self.tasks
    }

    /// Whether any entry other than `id` writes to `path`. Destination
    /// files are owned one task at a time, state regardless: even a
    /// completed entry's payload must not be overwritten by a newcomer.
    pub fn path_owned_by_other(&self, id: TaskId, path: &Path) -> bool {
        self.tasks
            .iter()
            .any(|task| task.id != id && task.file_path == path)
    }

    /// Ordered snapshot for observers.
    pub fn list(&self) -> Vec<DownloadTask> {
        self.tasks.clone()
    }

    /// Idempotent enqueue: one entry per URL, duplicates never spawn a
    /// second transfer, finished entries become eligible again.
    pub fn upsert(&mut self, task: DownloadTask) -> UpsertOutcome {
        let Some(existing) = self.tasks.iter_mut().find(|t| t.id == task.id) else {
            self.tasks.push(task);
            return UpsertOutcome::Created;
        };

        if existing.state.is_terminal()
            || existing.state == TaskState::IncompleteDownloadDetected
        {
            existing.state = TaskState::Pending;
            existing.date_finished = None;
            existing.speed = 0;
            // Keep downloaded/total byte counts: the next attempt resumes
            // from whatever is on disk.
            UpsertOutcome::Reactivated
        } else {
            UpsertOutcome::AlreadyTracked
        }
    }

    /// Adopt a task built by startup reconciliation; never overwrites a
    /// live entry.
    pub fn insert_reconciled(&mut self, task: DownloadTask) -> bool {
        if self.tasks.iter().any(|t| t.id == task.id) {
            return false;
        }
        self.tasks.push(task);
        true
    }

    /// Bump the attempt counter before dispatching an executor, so events
    /// from any earlier attempt become stale.
    pub fn begin_attempt(&mut self, id: TaskId) -> Option<u64> {
        let task = self.tasks.iter_mut().find(|t| t.id == id)?;
        task.attempt += 1;
        Some(task.attempt)
    }

    /// Map an executor event onto a state transition.
    ///
    /// Events from a superseded attempt and transitions outside the
    /// allowed graph are rejected and logged, never applied.
    pub fn apply_event(&mut self, id: TaskId, attempt: u64, event: &TransferEvent) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            warn!(%id, "event for unknown task dropped");
            return false;
        };
        if task.attempt != attempt {
            debug!(
                %id,
                event_attempt = attempt,
                current_attempt = task.attempt,
                "stale event dropped"
            );
            return false;
        }

        let state = task.state.clone();
        match (state, event) {
            (TaskState::Pending | TaskState::Paused, TransferEvent::Preparing) => {
                task.state = TaskState::Preparing;
                task.speed = 0;
            }
            (TaskState::Preparing, TransferEvent::Metadata(meta)) => {
                if meta.total_bytes.is_some() {
                    task.total_bytes = meta.total_bytes;
                }
                if meta.content_length.is_some() {
                    task.content_length = meta.content_length;
                }
                if meta.mime_type.is_some() {
                    task.mime_type = meta.mime_type.clone();
                }
                if meta.content_disposition.is_some() {
                    task.content_disposition = meta.content_disposition.clone();
                }
                task.progress = progress_percent(task.downloaded_bytes, task.total_bytes)
                    .unwrap_or(task.progress);
            }
            (
                TaskState::Preparing | TaskState::Downloading,
                TransferEvent::Downloading {
                    downloaded_bytes,
                    total_bytes,
                    speed,
                    ..
                },
            ) => {
                task.state = TaskState::Downloading;
                task.downloaded_bytes = *downloaded_bytes;
                if total_bytes.is_some() {
                    task.total_bytes = *total_bytes;
                }
                task.speed = *speed;
                task.progress = progress_percent(task.downloaded_bytes, task.total_bytes)
                    .unwrap_or(task.progress);
            }
            (
                TaskState::Downloading,
                TransferEvent::Paused {
                    downloaded_bytes,
                    total_bytes,
                },
            ) => {
                task.state = TaskState::Paused;
                task.downloaded_bytes = *downloaded_bytes;
                if total_bytes.is_some() {
                    task.total_bytes = *total_bytes;
                }
                task.speed = 0;
                task.progress = progress_percent(task.downloaded_bytes, task.total_bytes)
                    .unwrap_or(task.progress);
            }
            (
                TaskState::Preparing | TaskState::Downloading,
                TransferEvent::Completed {
                    downloaded_bytes, ..
                },
            ) => {
                task.state = TaskState::Completed;
                task.downloaded_bytes = *downloaded_bytes;
                if task.total_bytes.is_none() {
                    task.total_bytes = Some(*downloaded_bytes);
                }
                task.progress = 100;
                task.speed = 0;
                task.date_finished = Some(Utc::now());
            }
            (TaskState::Preparing | TaskState::Downloading, TransferEvent::Failed(err)) => {
                task.state = TaskState::Failed(err.to_string());
                task.speed = 0;
                task.date_finished = Some(Utc::now());
            }
            (TaskState::Preparing | TaskState::Downloading, TransferEvent::Cancelled) => {
                task.state = TaskState::Cancelled;
                task.speed = 0;
                task.date_finished = Some(Utc::now());
            }
            (state, event) => {
                warn!(
                    %id,
                    state = state.as_str(),
                    ?event,
                    "transition rejected"
                );
                return false;
            }
        }
        true
    }

    /// Cancel a task that has no executor bound (still queued or paused).
    pub fn mark_cancelled(&mut self, id: TaskId) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        match task.state {
            TaskState::Pending | TaskState::Paused => {
                task.state = TaskState::Cancelled;
                task.speed = 0;
                task.date_finished = Some(Utc::now());
                true
            }
            _ => {
                debug!(%id, state = task.state.as_str(), "cancel ignored");
                false
            }
        }
    }

    /// Reset a task for a from-scratch restart: back to `Pending` with all
    /// byte progress forgotten. The attempt counter keeps counting up so
    /// events from the superseded executor stay stale.
    pub fn reset_for_restart(&mut self, id: TaskId) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        task.state = TaskState::Pending;
        task.downloaded_bytes = 0;
        task.progress = 0;
        task.speed = 0;
        task.date_finished = None;
        true
    }

    pub fn remove(&mut self, id: TaskId) -> Option<DownloadTask> {
        let index = self.tasks.iter().position(|t| t.id == id)?;
        Some(self.tasks.remove(index))
    }

    /// Drop every `Completed` entry, returning them for cleanup.
    pub fn clear_completed(&mut self) -> Vec<DownloadTask> {
        let (completed, kept): (Vec<_>, Vec<_>) = self
            .tasks
            .drain(..)
            .partition(|task| task.state == TaskState::Completed);
        self.tasks = kept;
        completed
    }
}
