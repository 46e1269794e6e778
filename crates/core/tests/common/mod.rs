//! Shared helpers for the stream integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use agent_trail_core::types::{NormalizedEntry, PatchOp, StreamFrame};
use agent_trail_core::{ActiveSessionRegistry, EntryStream, SessionSources, SourceRoots, StreamConfig};
use futures_util::StreamExt;

/// Short poll and debounce so live tests settle quickly.
pub fn fast_config() -> StreamConfig {
    StreamConfig {
        poll_interval: Duration::from_millis(50),
        debounce: Duration::from_millis(10),
        ..StreamConfig::default()
    }
}

pub fn sources(home: &Path, registry: ActiveSessionRegistry, config: StreamConfig) -> SessionSources {
    SessionSources::new(&SourceRoots::under(home), registry, config)
}

/// Drain a stream that is expected to finish on its own.
pub async fn collect(stream: EntryStream) -> Vec<StreamFrame> {
    tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .expect("stream did not finish")
}

/// Next frame, failing the test if none arrives in time.
pub async fn next_frame(stream: &mut EntryStream) -> StreamFrame {
    tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended early")
}

/// Pull frames until the materialized log holds `count` entries.
pub async fn until_entries(stream: &mut EntryStream, log: &mut Vec<NormalizedEntry>, count: usize) {
    while log.len() < count {
        let frame = next_frame(stream).await;
        apply(log, &frame);
    }
}

/// Apply one frame's operations to a materialized entry log.
pub fn apply(log: &mut Vec<NormalizedEntry>, frame: &StreamFrame) {
    let StreamFrame::JsonPatch(ops) = frame else {
        return;
    };
    for op in ops {
        let index = op.index().expect("numeric entry path");
        match op.op {
            PatchOp::Add => {
                assert_eq!(index, log.len(), "adds must append");
                log.push(op.entry().expect("add carries a value").clone());
            }
            PatchOp::Replace => {
                log[index] = op.entry().expect("replace carries a value").clone();
            }
            PatchOp::Remove => {
                log.remove(index);
            }
        }
    }
}

pub fn materialize(frames: &[StreamFrame]) -> Vec<NormalizedEntry> {
    let mut log = Vec::new();
    for frame in frames {
        apply(&mut log, frame);
    }
    log
}

pub fn finished_status(frames: &[StreamFrame]) -> Option<&str> {
    match frames.last() {
        Some(StreamFrame::Finished(status)) => Some(status),
        _ => None,
    }
}

/// Append raw bytes to a file.
pub fn append(path: &Path, bytes: &[u8]) {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
}
