//! Hybrid task store: running tasks live in memory, terminal tasks are
//! flushed to SQLite and evicted. Reads consult memory first, then a small
//! read-after-write snapshot cache, then the database.
//!
//! Also owns the `devices` mirror table and the append-only `model_calls`
//! accounting table.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use fg_devices::registry::Device;
use fg_domain::{Error, Result, TokenUsage};

use crate::tasks::{Task, TaskStatus};

/// Terminal snapshots kept around for immediate read-after-write.
const SNAPSHOT_CACHE_SIZE: usize = 64;

pub struct TaskStore {
    running: RwLock<HashMap<Uuid, Task>>,
    snapshots: RwLock<HashMap<Uuid, Task>>,
    db: Mutex<Connection>,
}

impl TaskStore {
    pub fn open(db_path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Storage(format!("open {}: {e}", db_path.display())))?;
        let store = Self {
            running: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            db: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        let store = Self {
            running: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            db: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.db
            .lock()
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    device_id TEXT,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    prompt_tokens INTEGER NOT NULL DEFAULT 0,
                    completion_tokens INTEGER NOT NULL DEFAULT 0,
                    total_tokens INTEGER NOT NULL DEFAULT 0,
                    record TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS devices (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    frp_port INTEGER NOT NULL,
                    total_tasks INTEGER NOT NULL DEFAULT 0,
                    success_tasks INTEGER NOT NULL DEFAULT 0,
                    failed_tasks INTEGER NOT NULL DEFAULT 0,
                    last_heartbeat TEXT,
                    specs TEXT
                );

                CREATE TABLE IF NOT EXISTS model_calls (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id TEXT NOT NULL,
                    step INTEGER NOT NULL,
                    model TEXT,
                    prompt_tokens INTEGER NOT NULL,
                    completion_tokens INTEGER NOT NULL,
                    total_tokens INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_status_created
                    ON tasks(status, created_at DESC);
                CREATE INDEX IF NOT EXISTS idx_tasks_device ON tasks(device_id);
                CREATE INDEX IF NOT EXISTS idx_model_calls_task ON model_calls(task_id);
                "#,
            )
            .map_err(|e| Error::Storage(format!("init schema: {e}")))
    }

    // ── Running set ──────────────────────────────────────────────────

    pub fn insert_running(&self, task: Task) {
        self.running.write().insert(task.id, task);
    }

    /// Mutate a running task in place. Returns false if it is not in the
    /// running set.
    pub fn with_running_mut<F>(&self, task_id: &Uuid, f: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        let mut running = self.running.write();
        match running.get_mut(task_id) {
            Some(task) => {
                f(task);
                true
            }
            None => false,
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.read().len()
    }

    pub fn is_running(&self, task_id: &Uuid) -> bool {
        self.running.read().contains_key(task_id)
    }

    /// Evict a terminal task from memory into the snapshot cache.
    pub fn evict(&self, task_id: &Uuid) {
        let Some(task) = self.running.write().remove(task_id) else {
            return;
        };
        let mut snapshots = self.snapshots.write();
        if snapshots.len() >= SNAPSHOT_CACHE_SIZE {
            // Drop the oldest snapshot.
            if let Some(oldest) = snapshots
                .values()
                .min_by_key(|t| t.completed_at.unwrap_or(t.created_at))
                .map(|t| t.id)
            {
                snapshots.remove(&oldest);
            }
        }
        snapshots.insert(*task_id, task);
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Memory first, then the snapshot cache, then the database.
    pub fn get(&self, task_id: &Uuid) -> Option<Task> {
        if let Some(task) = self.running.read().get(task_id) {
            return Some(task.clone());
        }
        if let Some(task) = self.snapshots.read().get(task_id) {
            return Some(task.clone());
        }
        self.get_from_db(task_id)
    }

    fn get_from_db(&self, task_id: &Uuid) -> Option<Task> {
        let db = self.db.lock();
        let record: Option<String> = db
            .query_row(
                "SELECT record FROM tasks WHERE id = ?1",
                params![task_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .ok()
            .flatten();
        record.and_then(|raw| serde_json::from_str(&raw).ok())
    }

    /// Newest-first listing across memory and the database.
    pub fn list(
        &self,
        status: Option<TaskStatus>,
        device_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Vec<Task> {
        let mut tasks: Vec<Task> = {
            let running = self.running.read();
            running
                .values()
                .filter(|t| status.map_or(true, |s| t.status == s))
                .filter(|t| device_id.map_or(true, |d| t.device_id.as_deref() == Some(d)))
                .cloned()
                .collect()
        };
        let in_memory: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        tasks.extend(
            self.list_from_db(status, device_id, limit + offset)
                .into_iter()
                .filter(|t| !in_memory.contains(&t.id)),
        );
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.into_iter().skip(offset).take(limit).collect()
    }

    fn list_from_db(
        &self,
        status: Option<TaskStatus>,
        device_id: Option<&str>,
        limit: usize,
    ) -> Vec<Task> {
        let db = self.db.lock();
        let mut sql = String::from("SELECT record FROM tasks WHERE 1=1");
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = status {
            sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(status.as_str().to_owned());
        }
        if let Some(device_id) = device_id {
            sql.push_str(&format!(" AND device_id = ?{}", args.len() + 1));
            args.push(device_id.to_owned());
        }
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT {limit}"));

        let Ok(mut stmt) = db.prepare(&sql) else {
            return Vec::new();
        };
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            row.get::<_, String>(0)
        });
        match rows {
            Ok(rows) => rows
                .flatten()
                .filter_map(|raw| serde_json::from_str(&raw).ok())
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "task list query failed");
                Vec::new()
            }
        }
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Upsert the full task record.
    pub fn persist(&self, task: &Task) -> Result<()> {
        let record = serde_json::to_string(task)?;
        self.db
            .lock()
            .execute(
                r#"
                INSERT INTO tasks
                    (id, device_id, status, created_at,
                     prompt_tokens, completion_tokens, total_tokens, record)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(id) DO UPDATE SET
                    device_id = ?2,
                    status = ?3,
                    prompt_tokens = ?5,
                    completion_tokens = ?6,
                    total_tokens = ?7,
                    record = ?8
                "#,
                params![
                    task.id.to_string(),
                    task.device_id,
                    task.status.as_str(),
                    task.created_at.to_rfc3339(),
                    task.usage.prompt_tokens as i64,
                    task.usage.completion_tokens as i64,
                    task.usage.total_tokens as i64,
                    record,
                ],
            )
            .map_err(|e| Error::Storage(format!("persist task {}: {e}", task.id)))?;
        Ok(())
    }

    /// Append one LLM call to the accounting table.
    pub fn record_model_call(
        &self,
        task_id: &Uuid,
        step: u32,
        model: Option<&str>,
        usage: TokenUsage,
    ) {
        let result = self.db.lock().execute(
            r#"
            INSERT INTO model_calls
                (task_id, step, model, prompt_tokens, completion_tokens, total_tokens, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                task_id.to_string(),
                step,
                model,
                usage.prompt_tokens as i64,
                usage.completion_tokens as i64,
                usage.total_tokens as i64,
                Utc::now().to_rfc3339(),
            ],
        );
        if let Err(e) = result {
            tracing::warn!(task_id = %task_id, error = %e, "model call not recorded");
        }
    }

    pub fn model_call_count(&self, task_id: &Uuid) -> u64 {
        self.db
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM model_calls WHERE task_id = ?1",
                params![task_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .unwrap_or(0) as u64
    }

    /// Mirror a registry device into the durable `devices` table.
    pub fn upsert_device(&self, device: &Device) {
        let specs = serde_json::json!({
            "model": device.model,
            "os_version": device.os_version,
            "screen_resolution": device.screen_resolution,
            "battery": device.battery,
            "memory_total": device.memory_total,
            "storage_total": device.storage_total,
        });
        let heartbeat: Option<String> = device.last_heartbeat.map(|t| t.to_rfc3339());
        let result = self.db.lock().execute(
            r#"
            INSERT INTO devices
                (id, name, kind, frp_port, total_tasks, success_tasks, failed_tasks,
                 last_heartbeat, specs)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                name = ?2, kind = ?3, frp_port = ?4, total_tasks = ?5,
                success_tasks = ?6, failed_tasks = ?7, last_heartbeat = ?8, specs = ?9
            "#,
            params![
                device.id,
                device.name,
                device.kind.to_string(),
                device.frp_port,
                device.total_tasks as i64,
                device.success_tasks as i64,
                device.failed_tasks as i64,
                heartbeat,
                specs.to_string(),
            ],
        );
        if let Err(e) = result {
            tracing::warn!(device_id = %device.id, error = %e, "device mirror not updated");
        }
    }

    /// Recover device counters persisted by a previous run.
    pub fn device_counters(&self, device_id: &str) -> Option<(u64, u64, u64)> {
        self.db
            .lock()
            .query_row(
                "SELECT total_tasks, success_tasks, failed_tasks FROM devices WHERE id = ?1",
                params![device_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, i64>(2)? as u64,
                    ))
                },
            )
            .optional()
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskSpec;

    fn task(instruction: &str) -> Task {
        Task::new(&TaskSpec {
            instruction: instruction.into(),
            device_id: None,
            kernel_mode: None,
            model: None,
            api_key: None,
            max_steps: None,
        })
    }

    #[test]
    fn memory_first_then_db() {
        let store = TaskStore::open_in_memory().unwrap();
        let t = task("goal");
        let id = t.id;
        store.insert_running(t);
        assert!(store.get(&id).is_some());
        assert!(store.is_running(&id));

        // Terminal: persist + evict. Still readable afterwards.
        store.with_running_mut(&id, |t| {
            t.mark_running();
            t.finish(TaskStatus::Completed, Some("ok".into()), None);
        });
        let snapshot = store.get(&id).unwrap();
        store.persist(&snapshot).unwrap();
        store.evict(&id);

        assert!(!store.is_running(&id));
        let loaded = store.get(&id).unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.result.as_deref(), Some("ok"));
    }

    #[test]
    fn terminal_tasks_are_not_in_running_set() {
        let store = TaskStore::open_in_memory().unwrap();
        for i in 0..5 {
            let mut t = task(&format!("goal {i}"));
            t.mark_running();
            t.finish(TaskStatus::Failed, None, Some("e".into()));
            let id = t.id;
            store.insert_running(t.clone());
            store.persist(&t).unwrap();
            store.evict(&id);
        }
        assert_eq!(store.running_count(), 0);
        let failed = store.list(Some(TaskStatus::Failed), None, 10, 0);
        assert_eq!(failed.len(), 5);
    }

    #[test]
    fn reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetgate.db");
        let id;
        {
            let store = TaskStore::open(&path).unwrap();
            let mut t = task("persisted goal");
            t.mark_running();
            t.finish(TaskStatus::Completed, Some("done".into()), None);
            id = t.id;
            store.persist(&t).unwrap();
        }
        let store = TaskStore::open(&path).unwrap();
        let loaded = store.get(&id).unwrap();
        assert_eq!(loaded.instruction, "persisted goal");
        assert_eq!(loaded.status, TaskStatus::Completed);
    }

    #[test]
    fn list_merges_and_paginates() {
        let store = TaskStore::open_in_memory().unwrap();
        // Two running in memory, three terminal on disk.
        for i in 0..2 {
            let mut t = task(&format!("running {i}"));
            t.mark_running();
            store.insert_running(t);
        }
        for i in 0..3 {
            let mut t = task(&format!("done {i}"));
            t.mark_running();
            t.finish(TaskStatus::Completed, None, None);
            store.persist(&t).unwrap();
        }

        let all = store.list(None, None, 10, 0);
        assert_eq!(all.len(), 5);
        let page = store.list(None, None, 2, 2);
        assert_eq!(page.len(), 2);
        let running_only = store.list(Some(TaskStatus::Running), None, 10, 0);
        assert_eq!(running_only.len(), 2);
    }

    #[test]
    fn list_filters_by_device() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut a = task("a");
        a.device_id = Some("device_6100".into());
        store.insert_running(a);
        let mut b = task("b");
        b.device_id = Some("device_6101".into());
        store.insert_running(b);

        let hits = store.list(None, Some("device_6100"), 10, 0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].instruction, "a");
    }

    #[test]
    fn model_calls_accumulate() {
        let store = TaskStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store.record_model_call(&id, 1, Some("glm-4-flash"), TokenUsage::new(100, 20));
        store.record_model_call(&id, 2, Some("glm-4-flash"), TokenUsage::new(90, 25));
        assert_eq!(store.model_call_count(&id), 2);
    }

    #[test]
    fn device_mirror_roundtrip() {
        use fg_protocol::DeviceKind;

        let store = TaskStore::open_in_memory().unwrap();
        let mut device = fg_devices::Device::new(6100, DeviceKind::Phone, "pixel");
        device.total_tasks = 7;
        device.success_tasks = 5;
        device.failed_tasks = 2;
        store.upsert_device(&device);

        assert_eq!(store.device_counters("device_6100"), Some((7, 5, 2)));
        assert_eq!(store.device_counters("device_9999"), None);
    }

    #[test]
    fn snapshot_cache_serves_read_after_write() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut t = task("goal");
        t.mark_running();
        t.finish(TaskStatus::Cancelled, None, Some("Task cancelled by user".into()));
        let id = t.id;
        store.insert_running(t);
        // Evict without persisting: the snapshot cache must still answer.
        store.evict(&id);
        let loaded = store.get(&id).unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
    }
}
