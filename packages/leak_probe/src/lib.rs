#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Detects heap allocations retained by a single call of an operation.
//!
//! The probe works by comparing snapshots of the live heap allocations of the process:
//!
//! 1. The operation is warmed up, so that one-time initialization (static caches, lazily
//!    created singletons) happens before anything is measured.
//! 2. A snapshot of all live tracked allocations is captured.
//! 3. The operation is called exactly once and its output is released.
//! 4. A second snapshot is captured.
//! 5. Both snapshots are grouped by the code location that requested the memory and every
//!    group whose allocation count grew is reported, unless an [`Exclusion`] suppresses it.
//!
//! The core functionality includes:
//! - [`Allocator`] - A Rust memory allocator wrapper that feeds the tracker
//! - [`TrackerSession`] - An active tracking session, which captures [`Snapshot`]s and runs probes
//! - [`Snapshot::diff()`] - Groups that grew between two snapshots, as a [`Diff`]
//! - [`LeakProbe`] - Warm-up, measurement and exclusions in one call
//!
//! This package is not meant for use in production, serving only as a development tool.
//!
//! # Simple usage
//!
//! ```
//! use std::convert::Infallible;
//!
//! use leak_probe::{Allocator, LeakProbe};
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! fn encode(values: Vec<u32>) -> Result<Vec<u8>, Infallible> {
//!     Ok(values.iter().flat_map(|v| v.to_le_bytes()).collect())
//! }
//!
//! fn main() {
//!     let leaks = LeakProbe::new()
//!         .run(encode, [vec![1], vec![1, 2]], vec![1, 1])
//!         .unwrap();
//!
//!     for leak in &leaks {
//!         println!("{leak}");
//!     }
//! }
//! ```
//!
//! # Step by step
//!
//! ```
//! use std::convert::Infallible;
//! use std::num::NonZero;
//!
//! use leak_probe::{Allocator, GroupBy, enable_tracking, warm_up};
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! fn main() {
//!     let mut operation = |n: usize| Ok::<_, Infallible>(vec![0_u8; n]);
//!
//!     warm_up(&mut operation, [1, 2]).unwrap();
//!
//!     let session = enable_tracking(NonZero::new(10).unwrap()).unwrap();
//!
//!     let before = session.capture_snapshot().unwrap();
//!     drop(operation(3));
//!     let after = session.capture_snapshot().unwrap();
//!
//!     let diff = after.diff(&before, GroupBy::Line);
//!     assert!(diff.report(&[]).is_empty());
//! }
//! ```
//!
//! # Sessions
//!
//! The tracker is process-wide: there can only be one [`TrackerSession`] at a time, and with
//! [`TrackingScope::Process`] it records the allocations of every thread. Concurrent activity
//! on other threads therefore shows up in the measurement. Use [`TrackingScope::Thread`] to
//! record only the thread that enabled tracking.
//!
//! # Overhead
//!
//! While a session is active, every allocation captures a stack trace and takes a global lock.
//! Expect allocation-heavy code to run much slower while it is being tracked. Without an active
//! session the allocator only checks an atomic flag.
//!
//! # Miri compatibility
//!
//! Miri replaces the global allocator with its own logic, so you cannot execute code that uses
//! this package under Miri.

mod allocator;
mod diff;
mod error;
mod exclusion;
mod probe;
mod session;
mod snapshot;
mod traceback;
mod tracker;

pub use allocator::Allocator;
pub use diff::{Diff, DiffEntry, GroupBy, GroupKey};
pub use error::{Error, ProbeError, Result};
pub use exclusion::Exclusion;
pub use probe::{LeakProbe, warm_up};
pub use session::{
    DEFAULT_FRAME_DEPTH, TracedMemory, TrackerBuilder, TrackerSession, enable_tracking,
};
pub use snapshot::{AllocationRecord, Snapshot, Statistic};
pub use traceback::{Frame, MAX_FRAME_DEPTH, Traceback};
pub use tracker::{TrackingScope, is_tracking};

pub(crate) const ERR_POISONED_LOCK: &str =
    "encountered poisoned lock - program validity cannot be guaranteed";
