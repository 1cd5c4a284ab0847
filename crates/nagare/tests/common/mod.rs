use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use nagare::{
    sink::SinkEvent, ChannelSink, DemuxConfig, Downloader, Manifest, NagareError, NagareResult,
};
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

pub const BASE: &str = "https://cdn.example.com/content/";

pub fn url(path: &str) -> Url {
    Url::parse(BASE).unwrap().join(path).unwrap()
}

pub fn manifest(fixture: &str, path: &str) -> Manifest {
    Manifest::parse(fixture.as_bytes(), &url(path)).unwrap()
}

/// Payload of `size` bytes tagged with the path it was served for.
pub fn payload(path: &str, size: usize) -> Bytes {
    let mut data = path.as_bytes().to_vec();
    data.resize(size.max(path.len()), 0);
    Bytes::from(data)
}

/// In-memory [Downloader] serving registered paths relative to [BASE].
#[derive(Default)]
pub struct MockDownloader {
    resources: Mutex<HashMap<String, Bytes>>,
    /// Remaining failures before a path is served.
    failures: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<String>>,
}

impl MockDownloader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, path: &str, data: impl Into<Bytes>) {
        self.resources
            .lock()
            .unwrap()
            .insert(url(path).to_string(), data.into());
    }

    /// Serve the initialization segment and `count` numbered fragments below `prefix`.
    pub fn serve_fragments(&self, prefix: &str, first: u64, count: u64, size: usize) {
        let init = format!("{prefix}/init.mp4");
        self.serve(&init, payload(&init, 32));
        for number in first..first + count {
            let path = format!("{prefix}/{number}.m4s");
            self.serve(&path, payload(&path, size));
        }
    }

    pub fn fail(&self, path: &str, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(url(path).to_string(), times);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, path: &str) -> usize {
        let target = url(path).to_string();
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| **r == target)
            .count()
    }
}

impl Downloader for MockDownloader {
    async fn fetch(&self, uri: &Url) -> NagareResult<Bytes> {
        let key = uri.to_string();
        self.requests.lock().unwrap().push(key.clone());
        if let Some(remaining) = self.failures.lock().unwrap().get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(NagareError::HttpError(reqwest::StatusCode::NOT_FOUND));
            }
        }

        self.resources
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(NagareError::HttpError(reqwest::StatusCode::NOT_FOUND))
    }

    fn abort_in_flight(&self) {}

    fn reset(&self) {}
}

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("nagare=debug")
        .with_test_writer()
        .try_init();
}

pub fn config() -> DemuxConfig {
    init_test_tracing();
    DemuxConfig::default()
}

pub fn channel() -> (ChannelSink, UnboundedReceiver<SinkEvent>) {
    ChannelSink::new()
}

pub fn drain(receiver: &mut UnboundedReceiver<SinkEvent>) -> Vec<SinkEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

/// Sequence numbers of the data pushed for `stream`.
pub fn sequences(events: &[SinkEvent], stream: usize) -> Vec<u64> {
    events
        .iter()
        .filter_map(|event| match event {
            SinkEvent::Data {
                stream: id,
                sequence,
                ..
            } if *id == stream => Some(*sequence),
            _ => None,
        })
        .collect()
}

pub fn formats(events: &[SinkEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, SinkEvent::Format { .. }))
        .count()
}
