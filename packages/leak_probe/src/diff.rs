//! Comparison of two snapshots grouped by allocation origin.

use std::fmt;
use std::str::FromStr;

use foldhash::HashMap;

use crate::{Exclusion, Frame, Snapshot, Traceback, tracker};

/// How allocation records are grouped when comparing snapshots.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum GroupBy {
    /// By the frame that requested the memory: function, file and line.
    #[default]
    Line,

    /// By the source file of the frame that requested the memory.
    File,

    /// By the whole traceback.
    Traceback,
}

impl FromStr for GroupBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "line" | "lineno" => Ok(Self::Line),
            "file" | "filename" => Ok(Self::File),
            "traceback" => Ok(Self::Traceback),
            _ => Err(format!(
                "Invalid grouping: '{s}'. Valid options are: line, file, traceback"
            )),
        }
    }
}

/// The frames that identify one group of allocations.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GroupKey {
    frames: Vec<Frame>,
}

impl GroupKey {
    fn of(traceback: &Traceback, group_by: GroupBy) -> Self {
        let frames = match group_by {
            GroupBy::Line => traceback.origin().cloned().into_iter().collect(),
            GroupBy::File => traceback.origin().map(Frame::file_only).into_iter().collect(),
            GroupBy::Traceback => traceback.frames().to_vec(),
        };

        Self { frames }
    }

    /// The frames of the key, innermost first. A single frame unless grouped by traceback.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The frame that requested the memory.
    #[must_use]
    pub fn origin(&self) -> Option<&Frame> {
        self.frames.first()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin() {
            Some(frame) => write!(f, "{frame}"),
            None => write!(f, "<unknown>"),
        }
    }
}

/// Sums up the records of a snapshot per group as `(size, count)`.
pub(crate) fn group(snapshot: &Snapshot, group_by: GroupBy) -> HashMap<GroupKey, (u64, u64)> {
    let mut groups: HashMap<GroupKey, (u64, u64)> = HashMap::default();

    for record in snapshot.records() {
        let (size, count) = groups
            .entry(GroupKey::of(record.traceback(), group_by))
            .or_insert((0, 0));

        *size = size.wrapping_add(record.size());
        *count = count.wrapping_add(record.count());
    }

    groups
}

#[expect(
    clippy::arithmetic_side_effects,
    reason = "the difference of two u64 always fits into i128"
)]
fn signed_delta(after: u64, before: u64) -> i64 {
    (i128::from(after) - i128::from(before))
        .try_into()
        .expect("allocation delta overflows i64 - this indicates an unrealistic scenario")
}

pub(crate) fn compute(after: &Snapshot, before: &Snapshot, group_by: GroupBy) -> Diff {
    tracker::untracked(|| {
        let before_groups = group(before, group_by);

        let mut entries: Vec<DiffEntry> = group(after, group_by)
            .into_iter()
            .filter_map(|(key, (size, count))| {
                let (size_before, count_before) =
                    before_groups.get(&key).copied().unwrap_or((0, 0));

                let count_delta = signed_delta(count, count_before);

                (count_delta > 0).then(|| DiffEntry {
                    key,
                    size,
                    size_delta: signed_delta(size, size_before),
                    count,
                    count_delta,
                })
            })
            .collect();

        entries.sort_by(|a, b| {
            b.significance()
                .cmp(&a.significance())
                .then_with(|| a.key.cmp(&b.key))
        });

        Diff { group_by, entries }
    })
}

/// Growth of one group of allocations between two snapshots.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiffEntry {
    key: GroupKey,
    size: u64,
    size_delta: i64,
    count: u64,
    count_delta: i64,
}

impl DiffEntry {
    /// The group.
    #[must_use]
    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    /// Bytes held by the group in the later snapshot.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Change in bytes held by the group.
    #[must_use]
    pub fn size_delta(&self) -> i64 {
        self.size_delta
    }

    /// Live allocations of the group in the later snapshot.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Change in live allocations of the group. Always positive.
    #[must_use]
    pub fn count_delta(&self) -> i64 {
        self.count_delta
    }

    /// Mean size of a live allocation of the group in the later snapshot.
    #[must_use]
    pub fn average(&self) -> u64 {
        self.size.checked_div(self.count).unwrap_or(0)
    }

    fn significance(&self) -> (u64, u64, u64, u64) {
        (
            self.size_delta.unsigned_abs(),
            self.size,
            self.count_delta.unsigned_abs(),
            self.count,
        )
    }
}

impl fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: size={} B ({:+} B), count={} ({:+}), average={} B",
            self.key,
            self.size,
            self.size_delta,
            self.count,
            self.count_delta,
            self.average()
        )
    }
}

/// Groups of allocations that grew between two snapshots, most significant growth first.
#[derive(Clone, Debug)]
pub struct Diff {
    group_by: GroupBy,
    entries: Vec<DiffEntry>,
}

impl Diff {
    /// How the allocations were grouped.
    #[must_use]
    pub fn group_by(&self) -> GroupBy {
        self.group_by
    }

    /// All groups that grew, most significant growth first.
    #[must_use]
    pub fn entries(&self) -> &[DiffEntry] {
        &self.entries
    }

    /// Number of groups that grew.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no group grew.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The groups that do not match any of the exclusions, in diff order.
    #[must_use]
    pub fn report(&self, exclusions: &[Exclusion]) -> Vec<&DiffEntry> {
        self.entries
            .iter()
            .filter(|entry| !exclusions.iter().any(|exclusion| exclusion.matches(entry)))
            .collect()
    }

    /// Like [`report()`](Self::report) but takes ownership of the entries.
    #[must_use]
    pub fn into_report(self, exclusions: &[Exclusion]) -> Vec<DiffEntry> {
        self.entries
            .into_iter()
            .filter(|entry| !exclusions.iter().any(|exclusion| exclusion.matches(entry)))
            .collect()
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}
