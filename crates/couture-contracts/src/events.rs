use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only structured log for a studio workspace (`events.jsonl`).
///
/// - default fields are `type`, `workspace_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
/// - a disabled writer builds the event but never touches the filesystem
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: Option<PathBuf>,
    workspace_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, workspace_id: impl Into<String>) -> Self {
        Self::build(Some(path.into()), workspace_id.into())
    }

    pub fn disabled(workspace_id: impl Into<String>) -> Self {
        Self::build(None, workspace_id.into())
    }

    fn build(path: Option<PathBuf>, workspace_id: String) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path,
                workspace_id,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn workspace_id(&self) -> &str {
        &self.inner.workspace_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "workspace_id".to_string(),
            Value::String(self.inner.workspace_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let Some(path) = self.inner.path.as_ref() else {
            return Ok(Value::Object(event));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    /// Emits an event from a code path that must not fail because logging did.
    pub fn record(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.emit(event_type, payload) {
            eprintln!("couture: failed writing {event_type} event: {err:#}");
        }
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "ws-123");

        let mut payload = EventPayload::new();
        payload.insert("image_url".to_string(), Value::String("/tmp/a.png".to_string()));
        let emitted = writer.emit("image_loaded", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("image_loaded".to_string()));
        assert_eq!(parsed["workspace_id"], Value::String("ws-123".to_string()));
        assert_eq!(parsed["image_url"], Value::String("/tmp/a.png".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let writer = EventWriter::disabled("ws-123");

        let mut payload = EventPayload::new();
        payload.insert("type".to_string(), Value::String("override".to_string()));
        let emitted = writer.emit("image_loaded", payload)?;

        assert_eq!(emitted["type"], Value::String("override".to_string()));
        assert_eq!(emitted["workspace_id"], Value::String("ws-123".to_string()));
        Ok(())
    }

    #[test]
    fn disabled_writer_touches_no_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::disabled("ws-123");
        writer.emit("one", EventPayload::new())?;
        assert!(writer.path().is_none());
        assert_eq!(fs::read_dir(temp.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn emit_appends_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "ws-123");

        writer.emit("one", EventPayload::new())?;
        writer.record("two", EventPayload::new());

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(second["type"], Value::String("two".to_string()));
        Ok(())
    }
}
