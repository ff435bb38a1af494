use std::future::Future;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode, header};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt, BufWriter},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::errors::TransferError;
use crate::task::{ResponseMetadata, TaskId, TransferEvent, progress_percent};

/// What to download and where to put it.
#[derive(Clone, Debug)]
pub struct TransferContext {
    pub url: String,
    pub file_path: PathBuf,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    /// Total size known from an earlier attempt, if any.
    pub expected_total: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct TransferOptions {
    pub buffer_size: usize,
    /// Minimum gap between two `Downloading` events.
    pub progress_interval: Duration,
    /// Overall deadline for the whole attempt.
    pub attempt_timeout: Option<Duration>,
    pub verify_size: bool,
}

impl TransferOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            buffer_size: config.buffer_size(),
            progress_interval: config.progress_interval(),
            attempt_timeout: config.attempt_timeout(),
            verify_size: config.verify_size,
        }
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            progress_interval: Duration::from_millis(500),
            attempt_timeout: None,
            verify_size: true,
        }
    }
}

/// Cooperative stop controls for one executor attempt.
///
/// Cancel fires through a token so it can interrupt a pending network
/// wait; pause is only observed at chunk boundaries.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    pause: CancellationToken,
    cancel: CancellationToken,
    delete_partial: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop after the current chunk and keep the partial file.
    pub fn request_pause(&self) {
        self.pause.cancel();
    }

    /// Stop as soon as possible; the partial file is deleted when
    /// `delete_partial` is set.
    pub fn request_cancel(&self, delete_partial: bool) {
        if delete_partial {
            self.delete_partial.store(true, Ordering::Relaxed);
        }
        self.cancel.cancel();
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.is_cancelled()
    }

    pub fn delete_partial(&self) -> bool {
        self.delete_partial.load(Ordering::Relaxed)
    }

    fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// An executor event tagged with the task and attempt that produced it.
#[derive(Debug)]
pub struct AttemptEvent {
    pub id: TaskId,
    pub attempt: u64,
    pub event: TransferEvent,
}

/// Event channel of one attempt; the tags let the manager drop deliveries
/// from a superseded attempt.
#[derive(Clone, Debug)]
pub struct EventSink {
    id: TaskId,
    attempt: u64,
    sender: mpsc::Sender<AttemptEvent>,
}

impl EventSink {
    pub fn new(id: TaskId, attempt: u64, sender: mpsc::Sender<AttemptEvent>) -> Self {
        Self {
            id,
            attempt,
            sender,
        }
    }

    /// False once the receiving side is gone.
    async fn emit(&self, event: TransferEvent) -> bool {
        self.sender
            .send(AttemptEvent {
                id: self.id,
                attempt: self.attempt,
                event,
            })
            .await
            .is_ok()
    }
}

enum Outcome {
    Completed {
        downloaded_bytes: u64,
    },
    Paused {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
    },
    Cancelled,
}

/// Run one resumable download attempt.
///
/// Emits `Preparing`, then at most one `Metadata`, then throttled
/// `Downloading` events, and always ends the sequence with exactly one of
/// `Paused`, `Completed`, `Failed` or `Cancelled`.
pub async fn transfer(
    client: Client,
    ctx: TransferContext,
    options: TransferOptions,
    stop: StopSignal,
    sink: EventSink,
) {
    let _ = sink.emit(TransferEvent::Preparing).await;

    let deadline = options
        .attempt_timeout
        .map(|limit| tokio::time::Instant::now() + limit);

    match run_attempt(&client, &ctx, &options, &stop, &sink, deadline).await {
        Ok(Outcome::Completed { downloaded_bytes }) => {
            debug!(file = %ctx.file_path.display(), downloaded_bytes, "transfer complete");
            let _ = sink
                .emit(TransferEvent::Completed {
                    file_path: ctx.file_path.clone(),
                    downloaded_bytes,
                })
                .await;
        }
        Ok(Outcome::Paused {
            downloaded_bytes,
            total_bytes,
        }) => {
            let _ = sink
                .emit(TransferEvent::Paused {
                    downloaded_bytes,
                    total_bytes,
                })
                .await;
        }
        Ok(Outcome::Cancelled) => {
            if stop.delete_partial() {
                let _ = fs::remove_file(&ctx.file_path).await;
            }
            let _ = sink.emit(TransferEvent::Cancelled).await;
        }
        Err(err) => {
            warn!(url = %ctx.url, error = %err, "transfer failed");
            let _ = sink.emit(TransferEvent::Failed(err)).await;
        }
    }
}

async fn run_attempt(
    client: &Client,
    ctx: &TransferContext,
    options: &TransferOptions,
    stop: &StopSignal,
    sink: &EventSink,
    deadline: Option<tokio::time::Instant>,
) -> Result<Outcome, TransferError> {
    let mut offset = match fs::metadata(&ctx.file_path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => 0,
    };
    let mut range_fallback_used = false;

    // One request per iteration; the loop repeats only for the single
    // no-Range fallback after a 416.
    loop {
        let mut request = client.get(&ctx.url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }
        if let Some(agent) = &ctx.user_agent {
            request = request.header(header::USER_AGENT, agent.as_str());
        }
        if let Some(referrer) = &ctx.referrer {
            request = request.header(header::REFERER, referrer.as_str());
        }

        let response = match race(request.send(), stop, deadline).await {
            Raced::Value(Ok(response)) => response,
            Raced::Value(Err(err)) => return Err(TransferError::from_http_error(err)),
            Raced::Cancelled => return Ok(Outcome::Cancelled),
            Raced::TimedOut => return Err(attempt_timed_out(options)),
        };
        let status = response.status();
        debug!(url = %ctx.url, status = %status, offset, "response received");

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            let (_, declared_total) = parse_content_range(content_range_header(&response));
            if declared_total == Some(offset) {
                // The partial file already holds every byte the server has.
                let _ = sink
                    .emit(TransferEvent::Metadata(ResponseMetadata {
                        total_bytes: declared_total,
                        content_length: response.content_length(),
                        mime_type: header_string(&response, header::CONTENT_TYPE),
                        content_disposition: header_string(&response, header::CONTENT_DISPOSITION),
                    }))
                    .await;
                return Ok(Outcome::Completed {
                    downloaded_bytes: offset,
                });
            }
            if offset > 0 && !range_fallback_used {
                range_fallback_used = true;
                debug!(url = %ctx.url, offset, "resume offset rejected, restarting from zero");
                offset = 0;
                continue;
            }
            return Err(TransferError::InvalidRangeResponse(format!(
                "range not satisfiable at offset {}",
                offset
            )));
        }

        if !status.is_success() {
            return Err(TransferError::HttpStatus(status.as_u16()));
        }

        let content_length = response.content_length();
        let mime_type = header_string(&response, header::CONTENT_TYPE);
        let content_disposition = header_string(&response, header::CONTENT_DISPOSITION);

        let (write_offset, total_bytes) = if status == StatusCode::PARTIAL_CONTENT {
            let (start, declared_total) = parse_content_range(content_range_header(&response));
            if let Some(start) = start {
                if start != offset {
                    return Err(TransferError::InvalidRangeResponse(format!(
                        "requested offset {} but server answered from {}",
                        offset, start
                    )));
                }
            }
            let total = declared_total
                .or(content_length.map(|remaining| offset + remaining))
                .or(ctx.expected_total);
            (offset, total)
        } else {
            // Server sent the whole file. If everything is already on disk,
            // verify and short-circuit instead of re-reading the body.
            if offset > 0 {
                if let Some(full) = content_length {
                    if full <= offset {
                        let _ = sink
                            .emit(TransferEvent::Metadata(ResponseMetadata {
                                total_bytes: Some(full),
                                content_length,
                                mime_type,
                                content_disposition,
                            }))
                            .await;
                        drop(response);
                        if options.verify_size && offset != full {
                            return Err(TransferError::SizeMismatch {
                                expected: full,
                                actual: offset,
                            });
                        }
                        return Ok(Outcome::Completed {
                            downloaded_bytes: offset,
                        });
                    }
                }
            }
            (0, content_length.or(ctx.expected_total))
        };

        if !sink
            .emit(TransferEvent::Metadata(ResponseMetadata {
                total_bytes,
                content_length,
                mime_type,
                content_disposition,
            }))
            .await
        {
            // Nobody is listening anymore; stop writing on their behalf.
            return Ok(Outcome::Cancelled);
        }

        if let Some(parent) = ctx.file_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(TransferError::from_io_error)?;
        }
        let mut open_options = OpenOptions::new();
        open_options.write(true).create(true);
        if write_offset == 0 {
            // Fresh start, or the server ignored the range: discard what we had.
            open_options.truncate(true);
        }
        let mut file = open_options
            .open(&ctx.file_path)
            .await
            .map_err(TransferError::from_io_error)?;
        if write_offset > 0 {
            file.seek(SeekFrom::Start(write_offset))
                .await
                .map_err(TransferError::from_io_error)?;
        }
        let mut writer = BufWriter::with_capacity(options.buffer_size, file);

        let mut stream = response.bytes_stream();
        let mut downloaded_bytes = write_offset;
        let mut bytes_since_emit: u64 = 0;
        let mut last_emit: Option<Instant> = None;

        loop {
            let item = match race(stream.next(), stop, deadline).await {
                Raced::Value(item) => item,
                Raced::Cancelled => {
                    let _ = writer.flush().await;
                    return Ok(Outcome::Cancelled);
                }
                Raced::TimedOut => {
                    let _ = writer.flush().await;
                    return Err(attempt_timed_out(options));
                }
            };
            let chunk = match item {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    // Keep what already arrived so the next attempt resumes.
                    let _ = writer.flush().await;
                    return Err(TransferError::from_http_error(err));
                }
                None => break,
            };

            writer
                .write_all(&chunk)
                .await
                .map_err(TransferError::from_io_error)?;
            downloaded_bytes += chunk.len() as u64;
            bytes_since_emit += chunk.len() as u64;

            let due = match last_emit {
                Some(at) => at.elapsed() >= options.progress_interval,
                None => true,
            };
            if due {
                let speed = sample_speed(last_emit, bytes_since_emit);
                if !sink
                    .emit(TransferEvent::Downloading {
                        downloaded_bytes,
                        total_bytes,
                        progress: progress_percent(downloaded_bytes, total_bytes),
                        speed,
                    })
                    .await
                {
                    return Ok(Outcome::Cancelled);
                }
                last_emit = Some(Instant::now());
                bytes_since_emit = 0;
            }

            if stop.pause_requested() {
                writer.flush().await.map_err(TransferError::from_io_error)?;
                return Ok(Outcome::Paused {
                    downloaded_bytes,
                    total_bytes,
                });
            }
        }

        writer.flush().await.map_err(TransferError::from_io_error)?;

        if bytes_since_emit > 0 {
            let speed = sample_speed(last_emit, bytes_since_emit);
            let _ = sink
                .emit(TransferEvent::Downloading {
                    downloaded_bytes,
                    total_bytes,
                    progress: progress_percent(downloaded_bytes, total_bytes),
                    speed,
                })
                .await;
        }

        if options.verify_size {
            if let Some(expected) = total_bytes {
                if downloaded_bytes != expected {
                    return Err(TransferError::SizeMismatch {
                        expected,
                        actual: downloaded_bytes,
                    });
                }
            }
        }

        return Ok(Outcome::Completed { downloaded_bytes });
    }
}

enum Raced<T> {
    Value(T),
    Cancelled,
    TimedOut,
}

/// Await `work` while staying responsive to cancellation and the attempt
/// deadline.
async fn race<F>(
    work: F,
    stop: &StopSignal,
    deadline: Option<tokio::time::Instant>,
) -> Raced<F::Output>
where
    F: Future,
{
    match deadline {
        Some(at) => tokio::select! {
            biased;
            _ = stop.cancel_token().cancelled() => Raced::Cancelled,
            _ = tokio::time::sleep_until(at) => Raced::TimedOut,
            value = work => Raced::Value(value),
        },
        None => tokio::select! {
            biased;
            _ = stop.cancel_token().cancelled() => Raced::Cancelled,
            value = work => Raced::Value(value),
        },
    }
}

fn sample_speed(last_emit: Option<Instant>, bytes_since_emit: u64) -> u64 {
    match last_emit {
        Some(at) => {
            let millis = at.elapsed().as_millis() as u64;
            if millis == 0 {
                bytes_since_emit * 1000
            } else {
                bytes_since_emit * 1000 / millis
            }
        }
        // First chunk of the attempt: no window to measure yet.
        None => 0,
    }
}

fn attempt_timed_out(options: &TransferOptions) -> TransferError {
    let limit = options
        .attempt_timeout
        .map(|limit| limit.as_secs())
        .unwrap_or_default();
    TransferError::Timeout(format!("attempt exceeded {}s", limit))
}

fn content_range_header(response: &Response) -> Option<String> {
    header_string(response, header::CONTENT_RANGE)
}

fn header_string(response: &Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)?
        .to_str()
        .ok()
        .map(String::from)
}

/// Parse `bytes S-E/TOTAL` (or `bytes */TOTAL`) into its start byte and
/// declared total; either side is `None` when absent or `*`.
fn parse_content_range(raw: Option<String>) -> (Option<u64>, Option<u64>) {
    let Some(raw) = raw else {
        return (None, None);
    };
    let Some(rest) = raw.trim().strip_prefix("bytes ") else {
        return (None, None);
    };
    let Some((range, total)) = rest.split_once('/') else {
        return (None, None);
    };
    let start = range
        .split_once('-')
        .and_then(|(start, _)| start.trim().parse::<u64>().ok());
    let total = total.trim().parse::<u64>().ok();
    (start, total)
}
