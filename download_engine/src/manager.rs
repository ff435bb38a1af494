use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tokio::{
    fs,
    io::AsyncReadExt,
    sync::{broadcast, mpsc, oneshot, watch},
};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::integrity::{FileCheck, check_file};
use crate::registry::{TaskRegistry, UpsertOutcome};
use crate::task::{
    DownloadRequest, DownloadTask, TaskId, TaskSidecar, TaskState, TransferEvent, is_sidecar,
    progress_percent, sidecar_path,
};
use crate::transfer::{
    AttemptEvent, EventSink, StopSignal, TransferContext, TransferOptions, transfer,
};
use crate::utils::numbered_file_name;

pub enum ManagerCommand {
    Enqueue {
        request: DownloadRequest,
        respond_to: oneshot::Sender<DownloadTask>,
    },
    Pause {
        reference: String,
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },
    Resume {
        reference: String,
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },
    Cancel {
        reference: String,
        delete_partial: bool,
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },
    Restart {
        reference: String,
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },
    Remove {
        reference: String,
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },
    CancelAll {
        respond_to: oneshot::Sender<usize>,
    },
    ClearCompleted {
        respond_to: oneshot::Sender<usize>,
    },
    List {
        respond_to: oneshot::Sender<Vec<DownloadTask>>,
    },
    LoadCachedTasks {
        respond_to: oneshot::Sender<Result<usize, EngineError>>,
    },
}

/// One-shot human-readable status message, published next to the task
/// list for surfacing to the user.
#[derive(Clone, Debug)]
pub struct Notice {
    pub id: TaskId,
    pub file_name: String,
    pub message: String,
}

/// Command queued against a running executor, applied once its terminal
/// event arrives.
enum PendingAction {
    Cancel { delete_partial: bool },
    Restart,
    Remove,
}

struct AttemptBinding {
    attempt: u64,
    stop: StopSignal,
}

pub struct DownloadManager {
    config: EngineConfig,
    client: Client,
    options: TransferOptions,
    registry: TaskRegistry,
    /// One entry per live executor, keyed by task.
    attempts: HashMap<TaskId, AttemptBinding>,
    /// Paused tasks waiting for a slot, ahead of the pending queue.
    resume_queue: VecDeque<TaskId>,
    pending_actions: HashMap<TaskId, PendingAction>,
    events_tx: mpsc::Sender<AttemptEvent>,
    tasks_tx: watch::Sender<Vec<DownloadTask>>,
    notices_tx: broadcast::Sender<Notice>,
}

impl DownloadManager {
    pub fn new(config: EngineConfig) -> DownloadManagerHandle {
        let (command_sender, command_receiver) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (tasks_tx, tasks_rx) = watch::channel(Vec::new());
        let (notices_tx, _) = broadcast::channel(32);

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_in_secs))
            .build()
            .unwrap_or_else(|err| {
                warn!(error = %err, "falling back to default http client");
                Client::new()
            });
        let options = TransferOptions::from_config(&config);

        let handle = DownloadManagerHandle {
            command_sender,
            tasks: tasks_rx,
            notices: notices_tx.clone(),
        };

        // Create and start the manager on its own task
        let manager = Self {
            config,
            client,
            options,
            registry: TaskRegistry::new(),
            attempts: HashMap::new(),
            resume_queue: VecDeque::new(),
            pending_actions: HashMap::new(),
            events_tx,
            tasks_tx,
            notices_tx,
        };
        tokio::spawn(manager.run(command_receiver, events_rx));

        handle
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ManagerCommand>,
        mut events: mpsc::Receiver<AttemptEvent>,
    ) {
        let mut commands_open = true;
        loop {
            if !commands_open && self.attempts.is_empty() {
                break;
            }
            // Biased selection: executor feedback drains before new commands
            tokio::select! {
                biased;
                Some(event) = events.recv() => {
                    self.handle_attempt_event(event).await;
                }
                cmd = commands.recv(), if commands_open => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        // all handles are dropped; finish live attempts
                        None => commands_open = false,
                    }
                }
            }
        }
        debug!("download manager stopped");
    }

    async fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Enqueue {
                request,
                respond_to,
            } => {
                let mut task = DownloadTask::new(request, &self.config.download_dir);
                self.assign_unique_path(&mut task);
                let id = task.id;
                match self.registry.upsert(task) {
                    UpsertOutcome::Created => debug!(%id, "download queued"),
                    UpsertOutcome::Reactivated => debug!(%id, "download queued again"),
                    UpsertOutcome::AlreadyTracked => debug!(%id, "download already tracked"),
                }
                self.admit_next();
                if let Some(task) = self.registry.get(id) {
                    let _ = respond_to.send(task.clone());
                }
            }
            ManagerCommand::Pause {
                reference,
                respond_to,
            } => {
                let _ = respond_to.send(self.pause(&reference));
            }
            ManagerCommand::Resume {
                reference,
                respond_to,
            } => {
                let _ = respond_to.send(self.resume(&reference));
            }
            ManagerCommand::Cancel {
                reference,
                delete_partial,
                respond_to,
            } => {
                let _ = respond_to.send(self.cancel(&reference, delete_partial).await);
            }
            ManagerCommand::Restart {
                reference,
                respond_to,
            } => {
                let _ = respond_to.send(self.restart(&reference).await);
            }
            ManagerCommand::Remove {
                reference,
                respond_to,
            } => {
                let _ = respond_to.send(self.remove(&reference).await);
            }
            ManagerCommand::CancelAll { respond_to } => {
                let _ = respond_to.send(self.cancel_all().await);
            }
            ManagerCommand::ClearCompleted { respond_to } => {
                let cleared = self.registry.clear_completed();
                for task in &cleared {
                    let _ = fs::remove_file(sidecar_path(&task.file_path)).await;
                }
                let _ = respond_to.send(cleared.len());
            }
            ManagerCommand::List { respond_to } => {
                let _ = respond_to.send(self.registry.list());
            }
            ManagerCommand::LoadCachedTasks { respond_to } => {
                let _ = respond_to.send(self.load_cached_tasks().await);
            }
        }
        self.publish();
    }

    async fn handle_attempt_event(&mut self, delivery: AttemptEvent) {
        let AttemptEvent { id, attempt, event } = delivery;
        let bound = self
            .attempts
            .get(&id)
            .map(|binding| binding.attempt == attempt)
            .unwrap_or(false);
        if !bound {
            debug!(%id, attempt, "event from unbound attempt dropped");
            return;
        }

        if event.ends_attempt() {
            self.attempts.remove(&id);
            match self.pending_actions.remove(&id) {
                Some(action) => self.finish_pending(id, attempt, action, event).await,
                None => {
                    if self.registry.apply_event(id, attempt, &event) {
                        self.persist_metadata(id, &event).await;
                        if let Some(message) = notice_for(&event) {
                            self.notify(id, message);
                        }
                    }
                }
            }
            self.admit_next();
        } else if self.registry.apply_event(id, attempt, &event) {
            self.persist_metadata(id, &event).await;
        }
        self.publish();
    }

    /// Apply a command that raced against the attempt's own ending.
    async fn finish_pending(
        &mut self,
        id: TaskId,
        attempt: u64,
        action: PendingAction,
        event: TransferEvent,
    ) {
        match action {
            PendingAction::Cancel { delete_partial } => {
                if matches!(event, TransferEvent::Completed { .. }) {
                    // The download finished before the stop was seen; keep it.
                    if self.registry.apply_event(id, attempt, &event) {
                        self.persist_metadata(id, &event).await;
                        self.notify(id, "download complete");
                    }
                    return;
                }
                let executor_deleted =
                    delete_partial && matches!(event, TransferEvent::Cancelled);
                if self
                    .registry
                    .apply_event(id, attempt, &TransferEvent::Cancelled)
                {
                    self.notify(id, "cancelled");
                }
                if delete_partial {
                    if let Some(task) = self.registry.get(id) {
                        if !executor_deleted {
                            let _ = fs::remove_file(&task.file_path).await;
                        }
                        let _ = fs::remove_file(sidecar_path(&task.file_path)).await;
                    }
                }
            }
            PendingAction::Restart => {
                self.delete_task_files(id).await;
                self.registry.reset_for_restart(id);
            }
            PendingAction::Remove => {
                if let Some(task) = self.registry.remove(id) {
                    if matches!(event, TransferEvent::Completed { .. }) {
                        // Finished data stays on disk, only the entry goes.
                        let _ = fs::remove_file(sidecar_path(&task.file_path)).await;
                    } else {
                        let _ = fs::remove_file(&task.file_path).await;
                        let _ = fs::remove_file(sidecar_path(&task.file_path)).await;
                    }
                }
            }
        }
    }

    fn pause(&mut self, reference: &str) -> Result<(), EngineError> {
        let id = self.required(reference)?;
        match self.attempts.get(&id) {
            Some(binding) => binding.stop.request_pause(),
            None => debug!(%id, "pause ignored, no active attempt"),
        }
        Ok(())
    }

    fn resume(&mut self, reference: &str) -> Result<(), EngineError> {
        let id = self.required(reference)?;
        let paused = self
            .registry
            .get(id)
            .map(|task| task.state == TaskState::Paused)
            .unwrap_or(false);
        if paused && !self.attempts.contains_key(&id) {
            if !self.resume_queue.contains(&id) {
                self.resume_queue.push_back(id);
            }
            self.admit_next();
        } else {
            debug!(%id, "resume ignored");
        }
        Ok(())
    }

    async fn cancel(&mut self, reference: &str, delete_partial: bool) -> Result<(), EngineError> {
        let id = self.required(reference)?;
        if let Some(binding) = self.attempts.get(&id) {
            self.pending_actions
                .insert(id, PendingAction::Cancel { delete_partial });
            binding.stop.request_cancel(delete_partial);
            return Ok(());
        }
        self.resume_queue.retain(|queued| *queued != id);
        if self.registry.mark_cancelled(id) {
            self.notify(id, "cancelled");
            if delete_partial {
                self.delete_task_files(id).await;
            }
        }
        Ok(())
    }

    /// Throw away all progress and download again from the first byte.
    async fn restart(&mut self, reference: &str) -> Result<(), EngineError> {
        let id = self.required(reference)?;
        let has_url = self
            .registry
            .get(id)
            .map(|task| !task.url.is_empty())
            .unwrap_or(false);
        if !has_url {
            debug!(%id, "restart ignored, no recorded url");
            return Ok(());
        }
        if let Some(binding) = self.attempts.get(&id) {
            self.pending_actions.insert(id, PendingAction::Restart);
            binding.stop.request_cancel(false);
            return Ok(());
        }
        self.resume_queue.retain(|queued| *queued != id);
        self.delete_task_files(id).await;
        self.registry.reset_for_restart(id);
        self.admit_next();
        Ok(())
    }

    async fn remove(&mut self, reference: &str) -> Result<(), EngineError> {
        let id = self.required(reference)?;
        if let Some(binding) = self.attempts.get(&id) {
            self.pending_actions.insert(id, PendingAction::Remove);
            binding.stop.request_cancel(true);
            return Ok(());
        }
        self.resume_queue.retain(|queued| *queued != id);
        if let Some(task) = self.registry.remove(id) {
            if task.state == TaskState::Completed {
                let _ = fs::remove_file(sidecar_path(&task.file_path)).await;
            } else {
                let _ = fs::remove_file(&task.file_path).await;
                let _ = fs::remove_file(sidecar_path(&task.file_path)).await;
            }
        }
        Ok(())
    }

    async fn cancel_all(&mut self) -> usize {
        let delete = self.config.remove_file_on_cancel;
        let ids: Vec<TaskId> = self
            .registry
            .tasks()
            .iter()
            .filter(|task| {
                !task.state.is_terminal() && task.state != TaskState::IncompleteDownloadDetected
            })
            .map(|task| task.id)
            .collect();
        self.resume_queue.clear();

        let mut stopped = 0;
        for id in ids {
            if let Some(binding) = self.attempts.get(&id) {
                self.pending_actions
                    .insert(id, PendingAction::Cancel { delete_partial: delete });
                binding.stop.request_cancel(delete);
                stopped += 1;
            } else if self.registry.mark_cancelled(id) {
                self.notify(id, "cancelled");
                if delete {
                    self.delete_task_files(id).await;
                }
                stopped += 1;
            }
        }
        stopped
    }

    /// Adopt finished and half-finished files already sitting in the
    /// download directory.
    async fn load_cached_tasks(&mut self) -> Result<usize, EngineError> {
        let dir = self.config.download_dir.clone();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(EngineError::Io(err)),
        };

        let mut adopted = 0;
        while let Some(entry) = entries.next_entry().await.map_err(EngineError::Io)? {
            let path = entry.path();
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() || is_sidecar(&path) {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let file_name = file_name.to_string();

            let sidecar = TaskSidecar::load(&sidecar_path(&path)).await.ok();
            let (id, url) = match &sidecar {
                Some(record) if !record.url.is_empty() => {
                    (TaskId::from_url(&record.url), record.url.clone())
                }
                _ => (TaskId::from_orphan_file(&file_name), String::new()),
            };
            if self.registry.get(id).is_some() {
                continue;
            }
            let expected = sidecar.as_ref().and_then(|record| record.total_bytes);

            let head = read_head(&path).await;
            let actual = meta.len();
            let mtime: DateTime<Utc> = meta
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());

            let mut task = DownloadTask {
                id,
                url,
                file_name: file_name.clone(),
                file_path: path.clone(),
                total_bytes: expected,
                downloaded_bytes: actual,
                progress: 0,
                speed: 0,
                state: TaskState::IncompleteDownloadDetected,
                referrer: None,
                user_agent: None,
                content_disposition: None,
                mime_type: None,
                content_length: None,
                date_added: mtime,
                date_finished: None,
                attempt: 0,
            };
            match check_file(actual, expected, &file_name, &head) {
                FileCheck::Complete => {
                    task.state = TaskState::Completed;
                    task.total_bytes = expected.or(Some(actual));
                    // A file inside the tolerance band can hold slightly
                    // more bytes than the recorded total; published counts
                    // never exceed it.
                    if let Some(total) = task.total_bytes {
                        task.downloaded_bytes = task.downloaded_bytes.min(total);
                    }
                    task.progress = 100;
                    task.date_finished = Some(mtime);
                }
                FileCheck::Partial | FileCheck::Corrupt => {
                    task.progress = progress_percent(actual, expected).unwrap_or(0);
                }
            }
            debug!(file = %file_name, state = task.state.as_str(), "adopted cached file");
            if self.registry.insert_reconciled(task) {
                adopted += 1;
            }
        }
        Ok(adopted)
    }

    /// Different URLs can derive the same file name; hand the newcomer a
    /// numbered variant so no two tasks ever share a destination file.
    fn assign_unique_path(&self, task: &mut DownloadTask) {
        if !self.registry.path_owned_by_other(task.id, &task.file_path) {
            return;
        }
        let dir = task
            .file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let base = task.file_name.clone();
        for n in 1.. {
            let candidate = numbered_file_name(&base, n);
            let path = dir.join(&candidate);
            if !self.registry.path_owned_by_other(task.id, &path) {
                debug!(from = %base, to = %candidate, "renamed to avoid a destination clash");
                task.file_name = candidate;
                task.file_path = path;
                return;
            }
        }
    }

    /// Fill free download slots, resumed tasks ahead of the pending queue.
    fn admit_next(&mut self) {
        while self.attempts.len() < self.config.max_concurrent_downloads {
            let Some(id) = self.next_waiter() else {
                break;
            };
            self.dispatch(id);
        }
    }

    fn next_waiter(&mut self) -> Option<TaskId> {
        while let Some(id) = self.resume_queue.pop_front() {
            if self.attempts.contains_key(&id) {
                continue;
            }
            match self.registry.get(id) {
                Some(task) if task.state == TaskState::Paused => return Some(id),
                _ => continue,
            }
        }
        self.registry
            .tasks()
            .iter()
            .find(|task| task.state == TaskState::Pending && !self.attempts.contains_key(&task.id))
            .map(|task| task.id)
    }

    fn dispatch(&mut self, id: TaskId) {
        let Some(attempt) = self.registry.begin_attempt(id) else {
            return;
        };
        let Some(task) = self.registry.get(id) else {
            return;
        };
        let ctx = TransferContext {
            url: task.url.clone(),
            file_path: task.file_path.clone(),
            user_agent: task
                .user_agent
                .clone()
                .or_else(|| self.config.user_agent.clone()),
            referrer: task.referrer.clone(),
            expected_total: task.total_bytes,
        };
        debug!(%id, attempt, url = %ctx.url, "dispatching download");

        let stop = StopSignal::new();
        let sink = EventSink::new(id, attempt, self.events_tx.clone());
        self.attempts.insert(
            id,
            AttemptBinding {
                attempt,
                stop: stop.clone(),
            },
        );
        tokio::spawn(transfer(
            self.client.clone(),
            ctx,
            self.options.clone(),
            stop,
            sink,
        ));
    }

    /// Keep the on-disk record in step with what the response told us.
    async fn persist_metadata(&self, id: TaskId, event: &TransferEvent) {
        if !matches!(
            event,
            TransferEvent::Metadata(_) | TransferEvent::Completed { .. }
        ) {
            return;
        }
        let Some(task) = self.registry.get(id) else {
            return;
        };
        let record = TaskSidecar {
            url: task.url.clone(),
            file_name: task.file_name.clone(),
            total_bytes: task.total_bytes,
        };
        let path = sidecar_path(&task.file_path);
        if let Err(err) = record.save(&path).await {
            warn!(file = %path.display(), error = %err, "failed to write sidecar");
        }
    }

    async fn delete_task_files(&self, id: TaskId) {
        if let Some(task) = self.registry.get(id) {
            let _ = fs::remove_file(&task.file_path).await;
            let _ = fs::remove_file(sidecar_path(&task.file_path)).await;
        }
    }

    /// Look a task up by its URL, falling back to the file name so entries
    /// adopted from disk without a record stay addressable.
    fn find_task(&self, reference: &str) -> Option<TaskId> {
        let id = TaskId::from_url(reference);
        if self.registry.get(id).is_some() {
            return Some(id);
        }
        self.registry
            .tasks()
            .iter()
            .find(|task| task.file_name == reference)
            .map(|task| task.id)
    }

    fn required(&self, reference: &str) -> Result<TaskId, EngineError> {
        self.find_task(reference)
            .ok_or_else(|| EngineError::TaskNotFound(reference.to_string()))
    }

    fn notify(&self, id: TaskId, message: impl Into<String>) {
        if let Some(task) = self.registry.get(id) {
            // Err just means nobody is subscribed right now.
            let _ = self.notices_tx.send(Notice {
                id,
                file_name: task.file_name.clone(),
                message: message.into(),
            });
        }
    }

    fn publish(&self) {
        self.tasks_tx.send_replace(self.registry.list());
    }
}

fn notice_for(event: &TransferEvent) -> Option<String> {
    match event {
        TransferEvent::Paused { .. } => Some("paused".to_string()),
        TransferEvent::Completed { .. } => Some("download complete".to_string()),
        TransferEvent::Failed(err) => Some(format!("download failed: {}", err)),
        TransferEvent::Cancelled => Some("cancelled".to_string()),
        _ => None,
    }
}

async fn read_head(path: &Path) -> Vec<u8> {
    let mut head = [0u8; 4];
    match fs::File::open(path).await {
        Ok(mut file) => match file.read(&mut head).await {
            Ok(read) => head[..read].to_vec(),
            Err(_) => Vec::new(),
        },
        Err(_) => Vec::new(),
    }
}

/// Cloneable front door to the manager task.
#[derive(Clone)]
pub struct DownloadManagerHandle {
    command_sender: mpsc::Sender<ManagerCommand>,
    tasks: watch::Receiver<Vec<DownloadTask>>,
    notices: broadcast::Sender<Notice>,
}

impl DownloadManagerHandle {
    /// Queue a download; re-adding a URL that is already tracked returns
    /// the existing entry instead of starting a second transfer.
    pub async fn enqueue(&self, request: DownloadRequest) -> Result<DownloadTask, EngineError> {
        self.send(|respond_to| ManagerCommand::Enqueue {
            request,
            respond_to,
        })
        .await
    }

    /// Stop an active download at the next chunk, keeping its bytes.
    pub async fn pause(&self, reference: &str) -> Result<(), EngineError> {
        self.send(|respond_to| ManagerCommand::Pause {
            reference: reference.to_string(),
            respond_to,
        })
        .await?
    }

    /// Give a paused download a slot again.
    pub async fn resume(&self, reference: &str) -> Result<(), EngineError> {
        self.send(|respond_to| ManagerCommand::Resume {
            reference: reference.to_string(),
            respond_to,
        })
        .await?
    }

    pub async fn cancel(&self, reference: &str, delete_partial: bool) -> Result<(), EngineError> {
        self.send(|respond_to| ManagerCommand::Cancel {
            reference: reference.to_string(),
            delete_partial,
            respond_to,
        })
        .await?
    }

    /// Delete any partial data and download again from scratch.
    pub async fn restart(&self, reference: &str) -> Result<(), EngineError> {
        self.send(|respond_to| ManagerCommand::Restart {
            reference: reference.to_string(),
            respond_to,
        })
        .await?
    }

    /// Forget a task. Active downloads are cancelled and their partial
    /// data deleted; a completed file stays on disk.
    pub async fn remove(&self, reference: &str) -> Result<(), EngineError> {
        self.send(|respond_to| ManagerCommand::Remove {
            reference: reference.to_string(),
            respond_to,
        })
        .await?
    }

    /// Cancel every queued, paused and running download. Returns how many
    /// tasks were affected.
    pub async fn cancel_all(&self) -> Result<usize, EngineError> {
        self.send(|respond_to| ManagerCommand::CancelAll { respond_to })
            .await
    }

    /// Drop completed entries from the list, keeping their files.
    pub async fn clear_completed(&self) -> Result<usize, EngineError> {
        self.send(|respond_to| ManagerCommand::ClearCompleted { respond_to })
            .await
    }

    pub async fn list(&self) -> Result<Vec<DownloadTask>, EngineError> {
        self.send(|respond_to| ManagerCommand::List { respond_to })
            .await
    }

    /// Scan the download directory and adopt files left by earlier runs.
    /// Returns how many entries were added.
    pub async fn load_cached_tasks(&self) -> Result<usize, EngineError> {
        self.send(|respond_to| ManagerCommand::LoadCachedTasks { respond_to })
            .await?
    }

    /// Live snapshots of every tracked task, refreshed on each change.
    pub fn tasks(&self) -> watch::Receiver<Vec<DownloadTask>> {
        self.tasks.clone()
    }

    /// Subscribe to one-shot status messages like "paused" or
    /// "cancelled". A slow subscriber can lag and miss some.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
    ) -> Result<T, EngineError> {
        let (respond_to, response) = oneshot::channel();
        self.command_sender
            .send(build(respond_to))
            .await
            .map_err(|_| EngineError::ManagerClosed)?;
        response.await.map_err(|_| EngineError::ManagerClosed)
    }
}
