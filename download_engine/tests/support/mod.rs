#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use download_engine::EngineConfig;
use wiremock::{Request, Respond, ResponseTemplate};

/// Deterministic, non-repeating test payload.
pub fn body_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Engine settings pointed at a scratch directory, with progress reporting
/// sped up so tests observe intermediate states quickly.
pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        download_dir: dir.to_path_buf(),
        progress_interval_in_ms: 25,
        connect_timeout_in_secs: 5,
        ..EngineConfig::default()
    }
}

/// Poll `condition` until it holds or a generous deadline passes.
pub async fn wait_for<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// First byte of a request's `bytes=N-` header, if any.
pub fn range_offset(request: &Request) -> Option<u64> {
    request
        .headers
        .get("range")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("bytes="))
        .and_then(|range| range.split_once('-'))
        .and_then(|(start, _)| start.parse().ok())
}

fn serve_range(body: &[u8], request: &Request) -> ResponseTemplate {
    let total = body.len() as u64;
    match range_offset(request) {
        Some(start) if start < total => ResponseTemplate::new(206)
            .insert_header(
                "content-range",
                format!("bytes {}-{}/{}", start, total - 1, total).as_str(),
            )
            .set_body_bytes(&body[start as usize..]),
        Some(_) => ResponseTemplate::new(416)
            .insert_header("content-range", format!("bytes */{}", total).as_str()),
        None => ResponseTemplate::new(200).set_body_bytes(body.to_vec()),
    }
}

/// Serves a fixed body, honoring `bytes=N-` resume requests.
pub struct RangeFile {
    body: Vec<u8>,
    delay: Option<Duration>,
}

impl RangeFile {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body, delay: None }
    }

    /// Hold every response back, leaving a window to pause or cancel the
    /// transfer while the request is in flight.
    pub fn with_delay(body: Vec<u8>, delay: Duration) -> Self {
        Self {
            body,
            delay: Some(delay),
        }
    }
}

impl Respond for RangeFile {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let template = serve_range(&self.body, request);
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

/// Pretends byte ranges are unsupported: ranged requests get 416, plain
/// requests get the whole body.
pub struct RejectsRanges {
    body: Vec<u8>,
}

impl RejectsRanges {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }
}

impl Respond for RejectsRanges {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as u64;
        if range_offset(request).is_some() {
            ResponseTemplate::new(416)
                .insert_header("content-range", format!("bytes */{}", total).as_str())
        } else {
            ResponseTemplate::new(200).set_body_bytes(self.body.clone())
        }
    }
}

/// Replies 416 to every request, ranged or not.
pub struct Always416 {
    pub total: u64,
}

impl Respond for Always416 {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        ResponseTemplate::new(416)
            .insert_header("content-range", format!("bytes */{}", self.total).as_str())
    }
}

/// Ignores resume requests and replays the whole file from the start.
pub struct IgnoresRange {
    body: Vec<u8>,
}

impl IgnoresRange {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }
}

impl Respond for IgnoresRange {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_bytes(self.body.clone())
    }
}

/// Answers resume requests from the wrong starting byte.
pub struct ShiftedRange {
    body: Vec<u8>,
}

impl ShiftedRange {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }
}

impl Respond for ShiftedRange {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as u64;
        match range_offset(request) {
            Some(start) => {
                let shifted = start + 7;
                ResponseTemplate::new(206)
                    .insert_header(
                        "content-range",
                        format!("bytes {}-{}/{}", shifted, total - 1, total).as_str(),
                    )
                    .set_body_bytes(&self.body[shifted as usize..])
            }
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

/// Declares more bytes than it delivers, ending the body cleanly short.
pub struct ShortTotal {
    body: Vec<u8>,
    claimed: u64,
}

impl ShortTotal {
    pub fn new(body: Vec<u8>, claimed: u64) -> Self {
        Self { body, claimed }
    }
}

impl Respond for ShortTotal {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let offset = range_offset(request).unwrap_or(0);
        ResponseTemplate::new(206)
            .insert_header(
                "content-range",
                format!("bytes {}-{}/{}", offset, self.claimed - 1, self.claimed).as_str(),
            )
            .set_body_bytes(self.body.clone())
    }
}

/// Breaks the first download part way through, then serves normally so a
/// later attempt can resume.
pub struct FlakyFile {
    body: Vec<u8>,
    cut_at: usize,
    failures: AtomicUsize,
}

impl FlakyFile {
    pub fn new(body: Vec<u8>, cut_at: usize) -> Self {
        Self {
            body,
            cut_at,
            failures: AtomicUsize::new(1),
        }
    }
}

impl Respond for FlakyFile {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok();
        if failing {
            let total = self.body.len() as u64;
            // Promise the full file but stop short; the size check fails
            // and the received prefix stays on disk.
            ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!("bytes 0-{}/{}", total - 1, total).as_str(),
                )
                .set_body_bytes(&self.body[..self.cut_at])
        } else {
            serve_range(&self.body, request)
        }
    }
}
