//! Per-task screenshot store.
//!
//! Layout under the store root:
//!
//! ```text
//! tasks/<task_id>/
//!   task_info.json
//!   summary.json                 (written at the terminal transition)
//!   steps/
//!     step_001_original.png
//!     step_001_ai.jpg            1280×720 Q85
//!     step_001_medium.jpg         960×540 Q80
//!     step_001_small.jpg          640×360 Q75
//!     step_001_thumb.jpg          320×180 Q70
//!     step_001.json              (step metadata)
//! devices/<device_id>/<task_id>  (manifest pointing at tasks/<task_id>)
//! cache/                         (export archives)
//! ```
//!
//! Compression runs on the blocking pool; the caller never waits on it for
//! loop throughput. Missing compressed sizes degrade to the next smaller
//! available one, and ultimately to the original.

mod store;

pub use store::{ScreenshotStore, StepPaths, StepRecord, StepScreenshotMeta, TaskSummary};
