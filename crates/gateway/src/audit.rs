//! Per-task JSONL audit log: one line per step event, appended and flushed
//! as the task runs. Single writer per task.

use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl AuditLog {
    pub fn for_task(data_dir: &std::path::Path, task_id: &Uuid) -> Self {
        let dir = data_dir.join("audit");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(error = %e, "audit dir unavailable");
        }
        Self {
            path: dir.join(format!("{task_id}.jsonl")),
            writer: Mutex::new(()),
        }
    }

    /// Append one event line. Failures are logged, never raised — losing an
    /// audit line must not fail a task.
    pub fn append(&self, mut event: Value) {
        if let Some(obj) = event.as_object_mut() {
            obj.insert("ts".into(), serde_json::json!(chrono::Utc::now()));
        }
        let _guard = self.writer.lock();
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| {
                writeln!(file, "{event}")?;
                file.flush()
            });
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "audit append failed");
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let task_id = Uuid::new_v4();
        let log = AuditLog::for_task(dir.path(), &task_id);

        log.append(serde_json::json!({"event": "step_start", "step": 1}));
        log.append(serde_json::json!({"event": "step_complete", "step": 1, "success": true}));

        let raw = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: Value = serde_json::from_str(line).unwrap();
            assert!(value.get("ts").is_some());
            assert!(value.get("event").is_some());
        }
    }
}
