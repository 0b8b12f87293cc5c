//! Point-in-time views of the live tracked allocations.

use std::fmt;
use std::sync::Arc;

use foldhash::HashMap;

use crate::diff::{self, Diff, GroupBy, GroupKey};
use crate::{Traceback, tracker};

/// Live allocations that share one traceback.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AllocationRecord {
    size: u64,
    count: u64,
    traceback: Arc<Traceback>,
}

impl AllocationRecord {
    /// Creates a record of `count` live allocations totalling `size` bytes.
    #[must_use]
    pub fn new(size: u64, count: u64, traceback: impl Into<Arc<Traceback>>) -> Self {
        Self {
            size,
            count,
            traceback: traceback.into(),
        }
    }

    /// Total bytes held by the allocations.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of live allocations.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// The call stack that made the allocations.
    #[must_use]
    pub fn traceback(&self) -> &Traceback {
        &self.traceback
    }
}

/// All live tracked allocations at one instant, one record per distinct traceback.
///
/// Snapshots are captured from a [`TrackerSession`](crate::TrackerSession) and compared with
/// [`Snapshot::diff()`]. Records are ordered largest first, then by traceback, so two
/// snapshots of the same state list the same records in the same order.
///
/// # Examples
///
/// ```
/// use leak_probe::{Allocator, GroupBy, TrackerSession};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// let session = TrackerSession::builder().enable().unwrap();
///
/// let before = session.capture_snapshot().unwrap();
/// let retained = vec![0_u8; 1024];
/// let after = session.capture_snapshot().unwrap();
///
/// let diff = after.diff(&before, GroupBy::Line);
/// assert_eq!(diff.len(), 1);
/// # drop(retained);
/// ```
#[derive(Clone, Debug)]
pub struct Snapshot {
    records: Vec<AllocationRecord>,
    frame_depth: usize,
}

impl Snapshot {
    /// Creates a snapshot from existing records, merging records with equal tracebacks.
    ///
    /// Useful to compare allocation data obtained elsewhere; sessions build their snapshots
    /// through this as well.
    #[must_use]
    pub fn from_records(
        records: impl IntoIterator<Item = AllocationRecord>,
        frame_depth: usize,
    ) -> Self {
        let mut merged: HashMap<Arc<Traceback>, (u64, u64)> = HashMap::default();

        for record in records {
            let (size, count) = merged.entry(record.traceback).or_insert((0, 0));
            *size = size.wrapping_add(record.size);
            *count = count.wrapping_add(record.count);
        }

        let mut records: Vec<_> = merged
            .into_iter()
            .map(|(traceback, (size, count))| AllocationRecord {
                size,
                count,
                traceback,
            })
            .collect();

        records.sort_by(|a, b| {
            b.size
                .cmp(&a.size)
                .then(b.count.cmp(&a.count))
                .then_with(|| a.traceback.cmp(&b.traceback))
        });

        Self {
            records,
            frame_depth,
        }
    }

    /// The records, largest first.
    #[must_use]
    pub fn records(&self) -> &[AllocationRecord] {
        &self.records
    }

    /// Number of distinct tracebacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether there were no live tracked allocations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total bytes of all live tracked allocations.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.records
            .iter()
            .fold(0_u64, |total, record| total.wrapping_add(record.size))
    }

    /// Total number of live tracked allocations.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.records
            .iter()
            .fold(0_u64, |total, record| total.wrapping_add(record.count))
    }

    /// The number of frames retained per allocation when this snapshot was captured.
    #[must_use]
    pub fn frame_depth(&self) -> usize {
        self.frame_depth
    }

    /// Live allocations summed up per group, largest first.
    #[must_use]
    pub fn statistics(&self, group_by: GroupBy) -> Vec<Statistic> {
        tracker::untracked(|| {
            let mut statistics: Vec<_> = diff::group(self, group_by)
                .into_iter()
                .map(|(key, (size, count))| Statistic { key, size, count })
                .collect();

            statistics.sort_by(|a, b| {
                b.size
                    .cmp(&a.size)
                    .then(b.count.cmp(&a.count))
                    .then_with(|| a.key.cmp(&b.key))
            });

            statistics
        })
    }

    /// Compares this snapshot against an earlier one, reporting the groups that grew.
    ///
    /// Only groups whose allocation count increased are part of the result. Groups that shrank
    /// or disappeared are churn, not leaks, and are left out.
    #[must_use]
    pub fn diff(&self, relative_to: &Self, group_by: GroupBy) -> Diff {
        diff::compute(self, relative_to, group_by)
    }
}

/// Live allocations of one group in a snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Statistic {
    key: GroupKey,
    size: u64,
    count: u64,
}

impl Statistic {
    /// The group.
    #[must_use]
    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    /// Total bytes held by the group.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of live allocations in the group.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: size={} B, count={}, average={} B",
            self.key,
            self.size,
            self.count,
            self.size.checked_div(self.count).unwrap_or(0)
        )
    }
}
