//! Orchestrator-side state: pod records, container identities and the
//! pod lifecycle watcher

mod cache;
pub mod pod;
mod watcher;

pub use cache::{ContainerCache, PodCache};
pub use pod::{GpuLimits, GpuResourceNames};
pub use watcher::{PodEvent, PodEventHandler, PodEventTranslator, PodWatcher};
