use crate::events::{Event, EventLog, EventType};
use crate::types::RunId;
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

/// Buffered events per run are flushed once they reach this size
const FLUSH_THRESHOLD: usize = 100;

/// Event log implementation using gzip-compressed JSONL files, one per run
pub struct JsonlEventLog {
    base_path: PathBuf,
    // Events not yet written to disk, per run
    buffer: RwLock<HashMap<RunId, Vec<Event>>>,
    // Held from draining the buffer until the rewritten file is in place
    files: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: RwLock::new(HashMap::new()),
            files: Mutex::new(()),
        })
    }

    /// Format: <base>/runs/<run_id>.jsonl.gz
    fn event_log_path(&self, run_id: &RunId) -> PathBuf {
        self.base_path
            .join("runs")
            .join(format!("{}.jsonl.gz", run_id))
    }

    /// Flush buffered events of a run to disk
    pub async fn flush(&self, run_id: &RunId) -> Result<()> {
        let _files = self.files.lock().await;
        self.flush_locked(run_id).await
    }

    /// Caller holds `files`
    async fn flush_locked(&self, run_id: &RunId) -> Result<()> {
        let events = {
            let mut buffer = self.buffer.write().await;
            match buffer.remove(run_id) {
                Some(events) if !events.is_empty() => events,
                _ => return Ok(()),
            }
        };

        let path = self.event_log_path(run_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create event log directory")?;
        }

        // gzip members can't be appended to in place, so rewrite the file
        let mut all_events = if path.exists() {
            read_jsonl_gz(&path)?
        } else {
            Vec::new()
        };
        all_events.extend(events);

        let compressed = encode_jsonl_gz(&all_events)?;
        tokio::fs::write(&path, compressed)
            .await
            .context("Failed to write event log file")?;

        Ok(())
    }
}

/// Read a JSONL.GZ file
fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    use flate2::read::GzDecoder;
    use std::io::BufRead;

    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
        events.push(event);
    }

    Ok(events)
}

fn encode_jsonl_gz(events: &[Event]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    encoder.finish().context("Failed to finish compression")
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let run_id = event.run_id;
        let finished = matches!(
            event.event_type,
            EventType::RunFinished { .. } | EventType::RunCancelled
        );

        let pending = {
            let mut buffer = self.buffer.write().await;
            let events = buffer.entry(run_id).or_default();
            events.push(event);
            events.len()
        };

        if finished || pending >= FLUSH_THRESHOLD {
            self.flush(&run_id).await?;
        }

        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        let _files = self.files.lock().await;
        self.flush_locked(&run_id).await?;

        let path = self.event_log_path(&run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut events = read_jsonl_gz(&path)?;
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

/// In-memory event log, used by tests and dry runs
#[derive(Default)]
pub struct MemoryEventLog {
    events: RwLock<Vec<Event>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }
}
