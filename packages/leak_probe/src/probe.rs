//! End-to-end leak probing of an operation.

use std::num::NonZero;
use std::path::PathBuf;

use tracing::{debug, trace};

use crate::{
    DEFAULT_FRAME_DEPTH, DiffEntry, Exclusion, GroupBy, ProbeError, TrackerSession, TrackingScope,
};

/// Calls `operation` once per input and discards the outputs.
///
/// This lets the operation perform its one-time initialization (lookup tables, lazily created
/// statics, interned constants) before anything is measured. Pass at least one input for every
/// code path that initializes something on first use.
///
/// # Errors
///
/// Stops at and returns the first error of the operation.
pub fn warm_up<I, O, E>(
    operation: &mut impl FnMut(I) -> Result<O, E>,
    inputs: impl IntoIterator<Item = I>,
) -> Result<(), E> {
    for (index, input) in inputs.into_iter().enumerate() {
        drop(operation(input)?);
        trace!(index, "warm-up call completed");
    }

    Ok(())
}

/// Checks whether one call of an operation leaves allocations behind.
///
/// A probe warms the operation up, enables tracking, measures exactly one call and reports
/// the groups of allocations that grew, minus the excluded ones. By default the growth of the
/// Rust standard library itself is excluded (see [`LeakProbe::default_exclusions()`]).
///
/// # Examples
///
/// ```
/// use std::convert::Infallible;
/// use std::sync::Mutex;
///
/// use leak_probe::{Allocator, LeakProbe};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// static HISTORY: Mutex<Vec<String>> = Mutex::new(Vec::new());
///
/// fn remember(name: &str) -> Result<(), Infallible> {
///     HISTORY.lock().unwrap().push(name.to_owned());
///     Ok(())
/// }
///
/// let leaks = LeakProbe::new()
///     .run(remember, ["warm-up"], "trial")
///     .unwrap();
///
/// // The copy of "trial" is retained.
/// assert_eq!(leaks.len(), 1);
/// assert_eq!(leaks[0].count_delta(), 1);
/// assert_eq!(leaks[0].size_delta(), 5);
/// ```
#[derive(Clone, Debug)]
#[must_use]
pub struct LeakProbe {
    frame_depth: NonZero<usize>,
    scope: TrackingScope,
    group_by: GroupBy,
    exclusions: Vec<Exclusion>,
}

impl LeakProbe {
    /// Creates a probe with the default frame depth, process-wide tracking, grouping by line
    /// and the default exclusions.
    pub fn new() -> Self {
        Self {
            frame_depth: DEFAULT_FRAME_DEPTH,
            scope: TrackingScope::default(),
            group_by: GroupBy::default(),
            exclusions: Self::default_exclusions(),
        }
    }

    /// Exclusions for growth that originates in the Rust standard library.
    #[must_use]
    pub fn default_exclusions() -> Vec<Exclusion> {
        vec![
            Exclusion::Crate("std".to_owned()),
            Exclusion::Crate("core".to_owned()),
            Exclusion::Crate("alloc".to_owned()),
            Exclusion::PathSegments(PathBuf::from("library/std")),
            Exclusion::PathSegments(PathBuf::from("library/core")),
            Exclusion::PathSegments(PathBuf::from("library/alloc")),
        ]
    }

    /// Sets how many frames of each allocation's call stack are retained.
    pub fn frame_depth(mut self, frame_depth: NonZero<usize>) -> Self {
        self.frame_depth = frame_depth;
        self
    }

    /// Sets which threads' allocations are recorded.
    pub fn scope(mut self, scope: TrackingScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets how allocations are grouped.
    pub fn group_by(mut self, group_by: GroupBy) -> Self {
        self.group_by = group_by;
        self
    }

    /// Adds an exclusion.
    pub fn exclude(mut self, exclusion: Exclusion) -> Self {
        self.exclusions.push(exclusion);
        self
    }

    /// Replaces all exclusions, including the default ones.
    pub fn exclusions(mut self, exclusions: impl IntoIterator<Item = Exclusion>) -> Self {
        self.exclusions = exclusions.into_iter().collect();
        self
    }

    /// Warms `operation` up with `warm_up_inputs`, then reports what one call with
    /// `trial_input` leaves behind.
    ///
    /// Tracking is enabled only after the warm-up and is stopped again before returning.
    ///
    /// # Errors
    ///
    /// Returns the first error of the operation unmodified as [`ProbeError::TargetOperation`]
    /// and fails with [`ProbeError::Tracking`] if tracking cannot be enabled.
    pub fn run<I, O, E>(
        &self,
        mut operation: impl FnMut(I) -> Result<O, E>,
        warm_up_inputs: impl IntoIterator<Item = I>,
        trial_input: I,
    ) -> Result<Vec<DiffEntry>, ProbeError<E>> {
        warm_up(&mut operation, warm_up_inputs).map_err(ProbeError::TargetOperation)?;

        let mut session = TrackerSession::builder()
            .frame_depth(self.frame_depth)
            .scope(self.scope)
            .enable()?;

        let diff = session.run_probe_grouped_by(&mut operation, trial_input, self.group_by)?;
        session.stop();

        let grown = diff.len();
        let leaks = diff.into_report(&self.exclusions);

        debug!(grown, reported = leaks.len(), "leak probe completed");

        Ok(leaks)
    }
}

impl Default for LeakProbe {
    fn default() -> Self {
        Self::new()
    }
}
