use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use fg_domain::{Error, Result, TokenUsage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compression ladder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Level {
    name: &'static str,
    width: u32,
    height: u32,
    quality: u8,
}

const LEVELS: [Level; 4] = [
    Level { name: "ai", width: 1280, height: 720, quality: 85 },
    Level { name: "medium", width: 960, height: 540, quality: 80 },
    Level { name: "small", width: 640, height: 360, quality: 75 },
    Level { name: "thumbnail", width: 320, height: 180, quality: 70 },
];

/// Degradation order per requested size: the size itself, then every
/// smaller one, then the original.
fn degradation_chain(requested: &str) -> Vec<&'static str> {
    let names: Vec<&'static str> = LEVELS.iter().map(|l| l.name).collect();
    let mut chain: Vec<&'static str> = match names.iter().position(|&n| n == requested) {
        Some(pos) => names[pos..].to_vec(),
        None => Vec::new(),
    };
    chain.push("original");
    chain
}

fn level_file_name(step: u32, level: &str) -> String {
    match level {
        "original" => format!("step_{step:03}_original.png"),
        "thumbnail" => format!("step_{step:03}_thumb.jpg"),
        other => format!("step_{step:03}_{other}.jpg"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Paths (relative to the store root) of every stored size of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPaths {
    pub original: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub small: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

/// Step fields recorded next to the screenshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepScreenshotMeta {
    pub action: Value,
    pub thinking: String,
    pub observation: String,
    pub success: bool,
    pub kernel_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
}

/// Full per-step record persisted as `step_NNN.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub task_id: String,
    pub device_id: String,
    pub step_number: u32,
    pub timestamp: DateTime<Utc>,
    /// SHA-256 of the original PNG (content dedup key).
    pub file_hash: String,
    pub file_size: u64,
    pub paths: StepPaths,
    #[serde(flatten)]
    pub meta: StepScreenshotMeta,
}

/// Written once, at the task's terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub device_id: String,
    pub instruction: String,
    pub status: String,
    pub total_steps: u32,
    pub tokens: TokenUsage,
    pub completed_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ScreenshotStore {
    base_dir: PathBuf,
    tasks_dir: PathBuf,
    devices_dir: PathBuf,
    cache_dir: PathBuf,
}

impl ScreenshotStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let store = Self {
            tasks_dir: base_dir.join("tasks"),
            devices_dir: base_dir.join("devices"),
            cache_dir: base_dir.join("cache"),
            base_dir,
        };
        for dir in [&store.tasks_dir, &store.devices_dir, &store.cache_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(task_id)
    }

    fn steps_dir(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("steps")
    }

    /// Create the task directory and write `task_info.json`.
    pub fn init_task(
        &self,
        task_id: &str,
        device_id: &str,
        instruction: &str,
        kernel_mode: &str,
    ) -> Result<()> {
        let dir = self.steps_dir(task_id);
        std::fs::create_dir_all(&dir)?;
        let info = serde_json::json!({
            "task_id": task_id,
            "device_id": device_id,
            "instruction": instruction,
            "kernel_mode": kernel_mode,
            "created_at": Utc::now(),
        });
        write_atomic(
            &self.task_dir(task_id).join("task_info.json"),
            info.to_string().as_bytes(),
        )
    }

    /// Store one step: the original PNG, the compression ladder, and the
    /// metadata JSON. Compression runs on the blocking pool; individual
    /// level failures are tolerated and logged.
    pub async fn save_step(
        &self,
        task_id: &str,
        device_id: &str,
        step_number: u32,
        screenshot_png: Vec<u8>,
        meta: StepScreenshotMeta,
    ) -> Result<StepRecord> {
        let steps_dir = self.steps_dir(task_id);
        std::fs::create_dir_all(&steps_dir)?;

        let file_hash = hex_digest(&screenshot_png);
        let file_size = screenshot_png.len() as u64;

        let original_name = level_file_name(step_number, "original");
        write_atomic(&steps_dir.join(&original_name), &screenshot_png)?;

        // Compression ladder, off the async runtime.
        let compress_dir = steps_dir.clone();
        let produced: HashMap<&'static str, String> = tokio::task::spawn_blocking(move || {
            compress_levels(&screenshot_png, &compress_dir, step_number)
        })
        .await
        .map_err(|e| Error::Storage(format!("compression task: {e}")))?;

        let rel = |name: &str| -> String {
            format!("tasks/{task_id}/steps/{name}")
        };
        let rel_level = |level: &'static str| -> Option<String> {
            produced
                .contains_key(level)
                .then(|| rel(&level_file_name(step_number, level)))
        };

        let record = StepRecord {
            task_id: task_id.to_owned(),
            device_id: device_id.to_owned(),
            step_number,
            timestamp: Utc::now(),
            file_hash,
            file_size,
            paths: StepPaths {
                original: rel(&original_name),
                ai: rel_level("ai"),
                medium: rel_level("medium"),
                small: rel_level("small"),
                thumbnail: rel_level("thumbnail"),
            },
            meta,
        };

        let json = serde_json::to_vec_pretty(&record)?;
        write_atomic(
            &steps_dir.join(format!("step_{step_number:03}.json")),
            &json,
        )?;

        self.link_device_task(device_id, task_id)?;
        Ok(record)
    }

    /// Resolve the on-disk image for a step at the requested size,
    /// degrading to smaller sizes and finally to the original.
    pub fn step_image_path(&self, task_id: &str, step_number: u32, size: &str) -> Option<PathBuf> {
        let steps_dir = self.steps_dir(task_id);
        for level in degradation_chain(size) {
            let path = steps_dir.join(level_file_name(step_number, level));
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// All recorded steps of a task, ordered by step number.
    pub fn task_steps(&self, task_id: &str) -> Vec<StepRecord> {
        let steps_dir = self.steps_dir(task_id);
        let Ok(entries) = std::fs::read_dir(&steps_dir) else {
            return Vec::new();
        };
        let mut records: Vec<StepRecord> = entries
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .strip_prefix("step_")
                    .is_some_and(|rest| rest.ends_with(".json"))
            })
            .filter_map(|e| {
                let raw = std::fs::read_to_string(e.path()).ok()?;
                serde_json::from_str(&raw).ok()
            })
            .collect();
        records.sort_by_key(|r| r.step_number);
        records
    }

    pub fn write_summary(&self, summary: &TaskSummary) -> Result<()> {
        let json = serde_json::to_vec_pretty(summary)?;
        write_atomic(&self.task_dir(&summary.task_id).join("summary.json"), &json)
    }

    pub fn summary(&self, task_id: &str) -> Option<TaskSummary> {
        let raw = std::fs::read_to_string(self.task_dir(task_id).join("summary.json")).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Task ids recorded for a device.
    pub fn device_tasks(&self, device_id: &str) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.devices_dir.join(device_id)) else {
            return Vec::new();
        };
        let mut tasks: Vec<String> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        tasks.sort();
        tasks
    }

    /// Pack the whole task directory into a gzip tar archive under
    /// `cache/`, returning the archive path.
    pub fn export_task(&self, task_id: &str) -> Result<PathBuf> {
        let task_dir = self.task_dir(task_id);
        if !task_dir.exists() {
            return Err(Error::Storage(format!("no screenshots for task {task_id}")));
        }
        let archive_path = self.cache_dir.join(format!("{task_id}.tar.gz"));
        let file = std::fs::File::create(&archive_path)?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder
            .append_dir_all(task_id, &task_dir)
            .map_err(|e| Error::Storage(format!("archive {task_id}: {e}")))?;
        builder
            .into_inner()
            .and_then(|gz| gz.finish())
            .map_err(|e| Error::Storage(format!("archive {task_id}: {e}")))?;
        tracing::info!(task_id, path = %archive_path.display(), "task exported");
        Ok(archive_path)
    }

    /// Manifest entry mapping a device to one of its tasks.
    fn link_device_task(&self, device_id: &str, task_id: &str) -> Result<()> {
        let dir = self.devices_dir.join(device_id);
        std::fs::create_dir_all(&dir)?;
        let manifest = dir.join(task_id);
        if !manifest.exists() {
            write_atomic(&manifest, format!("tasks/{task_id}\n").as_bytes())?;
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Generate the JPEG ladder for one original. Returns the levels that
/// actually landed on disk.
fn compress_levels(png: &[u8], steps_dir: &Path, step: u32) -> HashMap<&'static str, String> {
    let mut produced = HashMap::new();
    let img = match image::load_from_memory(png) {
        Ok(img) => img,
        Err(e) => {
            tracing::warn!(step, error = %e, "original is not a decodable image, skipping ladder");
            return produced;
        }
    };

    for level in &LEVELS {
        let resized = img.resize(level.width, level.height, image::imageops::FilterType::Triangle);
        let mut buf = Vec::new();
        let encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, level.quality);
        let encode = image::DynamicImage::ImageRgb8(resized.to_rgb8()).write_with_encoder(encoder);
        if let Err(e) = encode {
            tracing::warn!(step, level = level.name, error = %e, "jpeg encode failed");
            continue;
        }
        let path = steps_dir.join(level_file_name(step, level.name));
        match write_atomic(&path, &buf) {
            Ok(()) => {
                produced.insert(level.name, path.to_string_lossy().into_owned());
            }
            Err(e) => {
                tracing::warn!(step, level = level.name, error = %e, "level write failed");
            }
        }
    }
    produced
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Write-to-tmp + rename so readers never observe a torn file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
