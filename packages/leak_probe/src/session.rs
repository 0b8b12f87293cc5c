use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZero;
use std::sync::Arc;

use foldhash::HashMap;
use new_zealand::nz;
use tracing::{debug, trace};

use crate::tracker::{self, TraceId, TrackingScope};
use crate::traceback::{self, MAX_FRAME_DEPTH};
use crate::{
    AllocationRecord, Diff, Error, GroupBy, ProbeError, Result, Snapshot, Traceback, allocator,
};

/// Number of frames retained per allocation unless configured otherwise.
pub const DEFAULT_FRAME_DEPTH: NonZero<usize> = nz!(10);

/// Starts process-wide allocation tracking, retaining up to `frame_depth` frames of the
/// call stack of each allocation.
///
/// Shorthand for `TrackerSession::builder().frame_depth(frame_depth).enable()`.
///
/// # Errors
///
/// Fails with [`Error::AlreadyTracking`] if another session is active and with
/// [`Error::AllocatorNotInstalled`] if [`Allocator`](crate::Allocator) is not the global
/// allocator.
pub fn enable_tracking(frame_depth: NonZero<usize>) -> Result<TrackerSession> {
    TrackerSession::builder().frame_depth(frame_depth).enable()
}

/// Configures and starts a [`TrackerSession`].
#[derive(Clone, Debug)]
#[must_use]
pub struct TrackerBuilder {
    frame_depth: NonZero<usize>,
    scope: TrackingScope,
}

impl TrackerBuilder {
    /// Sets how many frames of each allocation's call stack are retained.
    ///
    /// Values above [`MAX_FRAME_DEPTH`] are clamped.
    pub fn frame_depth(mut self, frame_depth: NonZero<usize>) -> Self {
        self.frame_depth = frame_depth;
        self
    }

    /// Sets which threads' allocations are recorded.
    pub fn scope(mut self, scope: TrackingScope) -> Self {
        self.scope = scope;
        self
    }

    /// Starts tracking.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AlreadyTracking`] if another session is active and with
    /// [`Error::AllocatorNotInstalled`] if [`Allocator`](crate::Allocator) is not the global
    /// allocator.
    pub fn enable(self) -> Result<TrackerSession> {
        if !allocator::is_installed() {
            return Err(Error::AllocatorNotInstalled);
        }

        let frame_depth = self.frame_depth.get().min(MAX_FRAME_DEPTH);
        let generation = tracker::start(traceback::raw_depth(frame_depth), self.scope)?;

        debug!(frame_depth, scope = ?self.scope, "allocation tracking started");

        Ok(TrackerSession {
            generation,
            frame_depth,
            scope: self.scope,
            resolved: RefCell::new(HashMap::default()),
            _single_threaded: PhantomData,
        })
    }
}

/// Bytes held by the live allocations recorded in a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TracedMemory {
    current: usize,
    peak: usize,
}

impl TracedMemory {
    /// Bytes held right now.
    #[must_use]
    pub fn current(&self) -> usize {
        self.current
    }

    /// The most bytes held at any point since the session started or was last cleared.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak
    }
}

/// An active allocation tracking session.
///
/// Only one session can be active per process at a time. Tracking stops when the session is
/// dropped or explicitly stopped, whichever comes first, so an early return or a panic in the
/// middle of a measurement still leaves the process untracked afterwards.
///
/// Sessions stay on the thread that created them. With [`TrackingScope::Thread`], that is also
/// the only thread whose allocations are recorded.
///
/// # Examples
///
/// ```
/// use std::convert::Infallible;
///
/// use leak_probe::{Allocator, TrackerSession};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// let session = TrackerSession::builder().enable().unwrap();
///
/// let diff = session
///     .run_probe(
///         |n: usize| {
///             let scratch = vec![0_u64; n];
///             Ok::<_, Infallible>(scratch.len())
///         },
///         16,
///     )
///     .unwrap();
///
/// // The scratch vector was released before the operation returned.
/// assert!(diff.is_empty());
/// ```
pub struct TrackerSession {
    generation: u64,
    frame_depth: usize,
    scope: TrackingScope,

    // Symbolization is slow, so every trace is resolved once per session.
    resolved: RefCell<HashMap<TraceId, Arc<Traceback>>>,

    _single_threaded: PhantomData<*const ()>,
}

impl TrackerSession {
    /// Creates a builder with the default frame depth and process-wide scope.
    pub fn builder() -> TrackerBuilder {
        TrackerBuilder {
            frame_depth: DEFAULT_FRAME_DEPTH,
            scope: TrackingScope::default(),
        }
    }

    /// Number of frames retained per allocation.
    #[must_use]
    pub fn frame_depth(&self) -> usize {
        self.frame_depth
    }

    /// Which threads' allocations are recorded.
    #[must_use]
    pub fn scope(&self) -> TrackingScope {
        self.scope
    }

    /// Whether the session has not been stopped yet.
    #[must_use]
    pub fn is_active(&self) -> bool {
        tracker::is_active(self.generation)
    }

    /// Captures the live tracked allocations.
    ///
    /// Capturing does not itself show up in later snapshots: everything allocated for it is
    /// excluded from tracking.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::TrackingNotEnabled`] once the session has been stopped.
    pub fn capture_snapshot(&self) -> Result<Snapshot> {
        tracker::untracked(|| {
            let mut resolved = self.resolved.borrow_mut();

            let groups =
                tracker::live_groups(self.generation, |trace| resolved.contains_key(&trace))?;

            let records: Vec<_> = groups
                .into_iter()
                .map(|group| {
                    let traceback = resolved.entry(group.trace).or_insert_with(|| {
                        Arc::new(traceback::resolve(
                            group.raw.as_deref().unwrap_or_default(),
                            self.frame_depth,
                        ))
                    });

                    AllocationRecord::new(group.size, group.count, Arc::clone(traceback))
                })
                .collect();

            let snapshot = Snapshot::from_records(records, self.frame_depth);

            trace!(
                records = snapshot.len(),
                bytes = snapshot.total_size(),
                "captured allocation snapshot"
            );

            Ok(snapshot)
        })
    }

    /// Measures what a single call of `operation` leaves behind, grouped by
    /// [`GroupBy::Line`].
    ///
    /// See [`run_probe_grouped_by()`](Self::run_probe_grouped_by).
    ///
    /// # Errors
    ///
    /// Returns the error of the operation unmodified as [`ProbeError::TargetOperation`], or
    /// [`ProbeError::Tracking`] if the session has been stopped.
    pub fn run_probe<I, O, E>(
        &self,
        operation: impl FnOnce(I) -> std::result::Result<O, E>,
        input: I,
    ) -> std::result::Result<Diff, ProbeError<E>> {
        self.run_probe_grouped_by(operation, input, GroupBy::default())
    }

    /// Measures what a single call of `operation` leaves behind.
    ///
    /// Captures a snapshot, calls `operation` exactly once, releases its output, captures a
    /// second snapshot and returns the groups that grew in between. The operation is never
    /// retried; if it fails, its error is returned as is and no second snapshot is taken.
    ///
    /// # Errors
    ///
    /// Returns the error of the operation unmodified as [`ProbeError::TargetOperation`], or
    /// [`ProbeError::Tracking`] if the session has been stopped.
    pub fn run_probe_grouped_by<I, O, E>(
        &self,
        operation: impl FnOnce(I) -> std::result::Result<O, E>,
        input: I,
        group_by: GroupBy,
    ) -> std::result::Result<Diff, ProbeError<E>> {
        let before = self.capture_snapshot()?;

        // Only what the operation retains counts, so its output is gone before measuring.
        drop(operation(input).map_err(ProbeError::TargetOperation)?);

        let after = self.capture_snapshot()?;
        let diff = after.diff(&before, group_by);

        debug!(grown_groups = diff.len(), "probe completed");

        Ok(diff)
    }

    /// Bytes held by the live allocations recorded in this session.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::TrackingNotEnabled`] once the session has been stopped.
    pub fn traced_memory(&self) -> Result<TracedMemory> {
        let (current, peak) = tracker::traced_memory(self.generation)?;
        Ok(TracedMemory { current, peak })
    }

    /// Forgets all allocations recorded so far and resets the peak.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::TrackingNotEnabled`] once the session has been stopped.
    pub fn clear_traces(&self) -> Result<()> {
        tracker::clear(self.generation)
    }

    /// Stops tracking. Does nothing if the session is already stopped.
    pub fn stop(&mut self) {
        if tracker::stop(self.generation) {
            debug!("allocation tracking stopped");
        }
    }
}

impl Drop for TrackerSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TrackerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerSession")
            .field("generation", &self.generation)
            .field("frame_depth", &self.frame_depth)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    static_assertions::assert_not_impl_any!(TrackerSession: Send, Sync);
    static_assertions::assert_impl_all!(TrackerBuilder: Send, Sync);

    #[test]
    fn enabling_without_allocator_fails() {
        let result = enable_tracking(DEFAULT_FRAME_DEPTH);

        assert!(matches!(result, Err(Error::AllocatorNotInstalled)));
    }

    #[test]
    fn builder_defaults() {
        let builder = TrackerSession::builder();

        assert_eq!(builder.frame_depth, DEFAULT_FRAME_DEPTH);
        assert_eq!(builder.scope, TrackingScope::Process);

        let builder = builder.frame_depth(nz!(3)).scope(TrackingScope::Thread);
        assert_eq!(builder.frame_depth.get(), 3);
        assert_eq!(builder.scope, TrackingScope::Thread);
    }
}
