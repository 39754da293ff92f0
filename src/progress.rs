//! Ingestion progress reporting.
//!
//! Long-running work publishes [`ProgressEvent`]s to a [`ProgressSink`].
//! Inside a server the sink is an [`EventBus`] that subscribers listen to
//! on the `knowledge:progress` topic; the CLI writes the same events to
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Topic name carried by every progress event.
pub const KNOWLEDGE_PROGRESS_TOPIC: &str = "knowledge:progress";

/// Share of the total progress taken by uploading the batch.
pub const UPLOAD_SHARE: f64 = 5.0;

/// One progress notification. `value` is a percentage in `0..=100`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub value: f64,
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_to_history: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_history: Option<bool>,
}

impl ProgressEvent {
    pub fn new(title: impl Into<String>, value: f64) -> Self {
        Self {
            id: None,
            value: round4(value.clamp(0.0, 100.0)),
            title: title.into(),
            subtitle: String::new(),
            content: String::new(),
            add_to_history: None,
            clear_history: None,
        }
    }

    pub fn subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = subtitle.into();
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn add_to_history(mut self, add: bool) -> Self {
        self.add_to_history = Some(add);
        self
    }

    pub fn clear_history(mut self) -> Self {
        self.clear_history = Some(true);
        self
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Receives progress events. Publishing is fire-and-forget.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// In-process publish/subscribe channel for progress events.
///
/// Slow subscribers miss events rather than blocking the publisher.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn topic(&self) -> &'static str {
        KNOWLEDGE_PROGRESS_TOPIC
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProgressSink for EventBus {
    fn publish(&self, event: ProgressEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

/// Human-friendly progress on stderr: `[ 42.5%] 🦾 Filter Agent  file 2/3`.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn publish(&self, event: ProgressEvent) {
        let mut line = format!("[{:>5.1}%] {}", event.value, event.title);
        if !event.subtitle.is_empty() {
            line.push_str("  ");
            line.push_str(&event.subtitle);
        }
        line.push('\n');
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressSink for JsonProgress {
    fn publish(&self, event: ProgressEvent) {
        let obj = serde_json::json!({
            "event": KNOWLEDGE_PROGRESS_TOPIC,
            "payload": event,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op sink when progress is disabled.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn publish(&self, _event: ProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn sink(&self) -> Box<dyn ProgressSink> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// Weighted progress over an ingestion batch.
///
/// Uploading fills the first [`UPLOAD_SHARE`] percent. The rest is split
/// evenly across files and, within a file, across its chunks.
#[derive(Clone, Copy, Debug)]
pub struct ProgressTracker {
    total_files: usize,
}

impl ProgressTracker {
    pub fn new(total_files: usize) -> Self {
        Self { total_files }
    }

    /// After `uploaded` of the batch's files are uploaded.
    pub fn upload(&self, uploaded: usize) -> f64 {
        if self.total_files == 0 {
            return UPLOAD_SHARE;
        }
        UPLOAD_SHARE * uploaded.min(self.total_files) as f64 / self.total_files as f64
    }

    /// After `done` of `chunks` chunks of file `file_index` (0-based).
    pub fn file(&self, file_index: usize, done: usize, chunks: usize) -> f64 {
        if self.total_files == 0 {
            return 100.0;
        }
        let within = if chunks == 0 {
            0.0
        } else {
            done.min(chunks) as f64 / chunks as f64
        };
        let files_done = file_index.min(self.total_files) as f64 + within;
        let value = UPLOAD_SHARE + (100.0 - UPLOAD_SHARE) * files_done / self.total_files as f64;
        value.min(100.0)
    }

    /// Once file `file_index` is finished.
    pub fn file_done(&self, file_index: usize) -> f64 {
        self.file(file_index + 1, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_weights_upload_and_files() {
        let t = ProgressTracker::new(4);
        assert_eq!(t.upload(0), 0.0);
        assert_eq!(t.upload(2), 2.5);
        assert_eq!(t.upload(4), 5.0);

        assert_eq!(t.file(0, 0, 10), 5.0);
        assert!((t.file(0, 5, 10) - 16.875).abs() < 1e-9);
        assert!((t.file_done(0) - 28.75).abs() < 1e-9);
        assert_eq!(t.file_done(3), 100.0);
    }

    #[test]
    fn event_serializes_camel_case_and_skips_unset() {
        let ev = ProgressEvent::new("📤 Uploading", 12.345678)
            .subtitle("file 1/2")
            .add_to_history(false);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["value"], 12.3457);
        assert_eq!(json["addToHistory"], false);
        assert!(json.get("clearHistory").is_none());
        assert!(json.get("id").is_none());
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::default();
        bus.publish(ProgressEvent::new("nobody listening", 1.0));

        let mut rx = bus.subscribe();
        bus.publish(ProgressEvent::new("done", 100.0).clear_history());
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.title, "done");
        assert_eq!(ev.clear_history, Some(true));
        assert_eq!(bus.topic(), "knowledge:progress");
    }
}
