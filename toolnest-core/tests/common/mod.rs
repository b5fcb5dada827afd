//! Shared fixtures for the installer integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use toolnest_core::installer::{
    event_channel, Downloader, EventReceiver, InstallEvent, InstallOrchestrator, MemoryPathStore,
    PathRegistrar, RetryPolicy, TransferBody, Transport, TransportError,
};

/// Serves in-memory bodies by URL; unknown URLs answer 404.
#[derive(Default)]
pub struct FakeTransport {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    calls: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, url: &str) -> Result<TransferBody, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = self.bodies.lock().unwrap().get(url).cloned();
        let Some(body) = body else {
            return Err(TransportError::Status {
                code: 404,
                reason: "Not Found".to_string(),
            });
        };

        let chunks: Vec<Result<Bytes, TransportError>> = body
            .chunks(1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(TransferBody {
            content_length: Some(body.len() as u64),
            chunks: Box::pin(stream::iter(chunks)),
        })
    }
}

/// Builds a zip archive in memory.
pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, zip_bytes(files)).unwrap();
}

/// Orchestrator with a single download attempt and an in-memory search path.
pub fn orchestrator(
    transport: Arc<dyn Transport>,
    store: Arc<MemoryPathStore>,
) -> (InstallOrchestrator, EventReceiver) {
    let (tx, rx) = event_channel();
    let retry = RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::from_millis(1),
    };
    let orchestrator =
        InstallOrchestrator::new(Downloader::new(transport, retry), PathRegistrar::new(store, true), tx);
    (orchestrator, rx)
}

/// Receives events up to and including `AllDone`.
pub async fn collect_until_done(rx: &mut EventReceiver) -> Vec<InstallEvent> {
    let mut events = Vec::new();
    let collect = async {
        while let Some(event) = rx.recv().await {
            let done = matches!(event, InstallEvent::AllDone(_));
            events.push(event);
            if done {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), collect)
        .await
        .expect("run did not finish");
    events
}

/// Events about `tool`, in order.
pub fn events_for<'a>(events: &'a [InstallEvent], tool: &str) -> Vec<&'a InstallEvent> {
    events.iter().filter(|e| e.tool() == Some(tool)).collect()
}
