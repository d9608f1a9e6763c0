//! Pod topology discovery from the cgroup filesystem
//!
//! The scanner maps a pod uid to its containers and their pids; the process
//! tree keeps the set of pods to scan and publishes snapshots of the result.

mod scanner;
mod tree;


pub use scanner::{is_container_id, CgroupScanner, ScanError, Scanner, CGROUP_BASE};
pub use tree::{ProcessTree, ScanState, SweepStats, DEFAULT_SCAN_INTERVAL};
