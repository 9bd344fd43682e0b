//! Device-side plumbing: the data-channel abstraction over the tunnel port
//! (ADB for phones, JSON HTTP for PCs), the port allocator, the canonical
//! device registry, and the two background sweeps (port scanner, zombie
//! reaper).

pub mod adb;
pub mod channel;
pub mod pc;
pub mod ports;
pub mod reaper;
pub mod registry;
pub mod scanner;

pub use channel::{DeviceChannel, DumpStrategy, RemoteElement, Screen, UiDump};
pub use ports::PortAllocator;
pub use registry::{Device, DeviceRegistry, DeviceStatus, DeviceUpdate};
