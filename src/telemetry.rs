//! Append-only JSONL activity log for fetches, lookups and photo imports.
//!
//! Events are queued in memory and written once a batch fills, on the periodic
//! flush task, or at shutdown. The live buffer file is rotated aside once it
//! would grow past the configured size, and only the newest `max_files - 1`
//! rotations are kept.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;

const BUFFER_FILE: &str = "activity-log.jsonl";

/// Things worth keeping a durable trail of. Each maps to a stable event name.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    FetchCompleted {
        trigger: &'static str,
        added: usize,
        skipped: usize,
        failed: usize,
        photos_attached: usize,
    },
    FetchFailed {
        trigger: &'static str,
        kind: &'static str,
        message: String,
    },
    PhotoImportFailed {
        review_id: i64,
        message: String,
    },
    PlaceLookup {
        place_id: String,
        resolved: bool,
    },
    SettingsSaved {
        api_key_changed: bool,
    },
}

impl ActivityEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ActivityEvent::FetchCompleted { .. } => "fetch_completed",
            ActivityEvent::FetchFailed { .. } => "fetch_failed",
            ActivityEvent::PhotoImportFailed { .. } => "photo_import_failed",
            ActivityEvent::PlaceLookup { .. } => "place_lookup",
            ActivityEvent::SettingsSaved { .. } => "settings_saved",
        }
    }

    fn payload(&self) -> Value {
        match self {
            ActivityEvent::FetchCompleted {
                trigger,
                added,
                skipped,
                failed,
                photos_attached,
            } => json!({
                "trigger": trigger,
                "added": added,
                "skipped": skipped,
                "failed": failed,
                "photos_attached": photos_attached,
            }),
            ActivityEvent::FetchFailed {
                trigger,
                kind,
                message,
            } => json!({ "trigger": trigger, "kind": kind, "message": message }),
            ActivityEvent::PhotoImportFailed { review_id, message } => {
                json!({ "review_id": review_id, "message": message })
            }
            ActivityEvent::PlaceLookup { place_id, resolved } => {
                json!({ "place_id": place_id, "resolved": resolved })
            }
            ActivityEvent::SettingsSaved { api_key_changed } => {
                json!({ "api_key_changed": api_key_changed })
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct LoggedEvent {
    name: &'static str,
    timestamp: DateTime<Utc>,
    payload: Value,
}

#[derive(Clone)]
pub struct TelemetryClient {
    enabled: Arc<AtomicBool>,
    queue: Arc<Mutex<Vec<LoggedEvent>>>,
    buffer_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

impl TelemetryClient {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let buffer_path = data_dir.join(BUFFER_FILE);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&buffer_path)?;

        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.telemetry_enabled_by_default)),
            queue: Arc::new(Mutex::new(Vec::new())),
            buffer_path,
            batch_size: config.telemetry_batch_size.max(1),
            max_file_bytes: config.telemetry_buffer_max_bytes,
            max_file_count: config.telemetry_buffer_max_files,
        })
    }

    pub fn record(&self, event: ActivityEvent) -> AppResult<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut queue = self.queue.lock();
        queue.push(LoggedEvent {
            name: event.name(),
            timestamp: Utc::now(),
            payload: event.payload(),
        });
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    /// Queues an event, logging instead of failing. The activity log must
    /// never turn a successful operation into an error.
    pub fn note(&self, event: ActivityEvent) {
        let name = event.name();
        if let Err(err) = self.record(event) {
            warn!(target: "telemetry", event = name, error = %err, "failed to write activity event");
        }
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Writes whatever is queued every `every`, so a quiet service still gets
    /// its events on disk without waiting for a full batch.
    pub fn spawn_flusher(&self, every: Duration) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let pending = client.queue_depth();
                if pending == 0 {
                    continue;
                }
                match client.flush() {
                    Ok(()) => debug!(target: "telemetry", pending, "flushed activity queue"),
                    Err(err) => warn!(target: "telemetry", error = %err, "periodic activity flush failed"),
                }
            }
        })
    }

    fn persist_locked(&self, queue: &mut Vec<LoggedEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }
        let mut lines = Vec::new();
        for event in queue.iter() {
            serde_json::to_writer(&mut lines, event)?;
            lines.push(b'\n');
        }

        self.rotate_if_needed(lines.len() as u64)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.buffer_path)?;
        file.write_all(&lines)?;
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current = fs::metadata(&self.buffer_path)
            .map(|meta| meta.len())
            .unwrap_or(0);
        if current == 0 || current + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count > 1 {
            let rotated = self.parent_dir().join(format!(
                "{}-{}.jsonl",
                self.buffer_stem(),
                Utc::now().format("%Y%m%d%H%M%S%f")
            ));
            fs::rename(&self.buffer_path, rotated)?;
            self.prune_rotations()?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.buffer_path)?;
        Ok(())
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let prefix = format!("{}-", self.buffer_stem());
        // Rotation names embed a sortable timestamp, so name order is age order.
        let mut rotations: Vec<PathBuf> = fs::read_dir(self.parent_dir())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy())
                    .map(|name| name.starts_with(&prefix) && name.ends_with(".jsonl"))
                    .unwrap_or(false)
            })
            .collect();
        rotations.sort();

        let allowed = self.max_file_count.saturating_sub(1);
        let excess = rotations.len().saturating_sub(allowed);
        for path in rotations.into_iter().take(excess) {
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    fn parent_dir(&self) -> &Path {
        self.buffer_path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn buffer_stem(&self) -> String {
        self.buffer_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "activity-log".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(batch: usize, max_bytes: u64, max_files: usize) -> AppConfig {
        AppConfig {
            telemetry_enabled_by_default: true,
            telemetry_flush_interval_secs: 30,
            telemetry_batch_size: batch,
            telemetry_buffer_max_bytes: max_bytes,
            telemetry_buffer_max_files: max_files,
            ..AppConfig::default()
        }
    }

    fn lookup(place_id: &str) -> ActivityEvent {
        ActivityEvent::PlaceLookup {
            place_id: place_id.into(),
            resolved: true,
        }
    }

    #[test]
    fn batches_until_threshold() {
        let dir = tempdir().unwrap();
        let client = TelemetryClient::new(dir.path(), &config(2, 1024, 3)).unwrap();
        client.record(lookup("a")).unwrap();
        assert_eq!(client.queue_depth(), 1);
        assert!(fs::read_to_string(client.buffer_path()).unwrap().is_empty());

        client.record(lookup("b")).unwrap();
        assert_eq!(client.queue_depth(), 0);
        let buffer = fs::read_to_string(client.buffer_path()).unwrap();
        assert_eq!(buffer.lines().count(), 2);
        assert!(buffer.contains("\"place_lookup\""));
    }

    #[test]
    fn note_queues_until_flushed_and_survives_restart() {
        let dir = tempdir().unwrap();
        let cfg = config(10, 1024, 3);
        let first = TelemetryClient::new(dir.path(), &cfg).unwrap();
        first.note(ActivityEvent::PhotoImportFailed {
            review_id: 4,
            message: "download failed".into(),
        });
        assert_eq!(first.queue_depth(), 1);
        assert!(fs::read_to_string(first.buffer_path()).unwrap().is_empty());
        first.flush().unwrap();

        let client = TelemetryClient::new(dir.path(), &cfg).unwrap();
        client.note(ActivityEvent::SettingsSaved {
            api_key_changed: false,
        });
        client.flush().unwrap();
        let buffer = fs::read_to_string(client.buffer_path()).unwrap();
        assert!(buffer.contains("photo_import_failed"));
        assert!(buffer.contains("settings_saved"));
    }

    #[tokio::test]
    async fn flusher_writes_partial_batches() {
        let dir = tempdir().unwrap();
        let client = TelemetryClient::new(dir.path(), &config(10, 1024, 3)).unwrap();
        let flusher = client.spawn_flusher(Duration::from_millis(20));
        client.note(lookup("quiet"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        flusher.abort();

        assert_eq!(client.queue_depth(), 0);
        let buffer = fs::read_to_string(client.buffer_path()).unwrap();
        assert!(buffer.contains("quiet"));
    }

    #[test]
    fn disabled_client_drops_events() {
        let dir = tempdir().unwrap();
        let cfg = AppConfig {
            telemetry_enabled_by_default: false,
            ..config(1, 1024, 3)
        };
        let client = TelemetryClient::new(dir.path(), &cfg).unwrap();
        client.note(lookup("a"));
        assert_eq!(client.queue_depth(), 0);
        assert!(!client.is_enabled());
        assert!(fs::read_to_string(client.buffer_path()).unwrap().is_empty());
    }

    #[test]
    fn rotates_and_prunes_old_buffers() {
        let dir = tempdir().unwrap();
        let client = TelemetryClient::new(dir.path(), &config(1, 64, 2)).unwrap();
        for idx in 0..5 {
            client.record(lookup(&format!("place-{idx}-0123456789abcdef"))).unwrap();
        }
        let rotated = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("activity-log-"))
            .count();
        assert_eq!(rotated, 1);
        let live = fs::read_to_string(client.buffer_path()).unwrap();
        assert!(live.contains("place-4"));
    }
}
