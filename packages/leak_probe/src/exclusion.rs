//! Filters that suppress expected growth from leak reports.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use crate::DiffEntry;

/// Suppresses diff entries whose origin matches.
///
/// The structured variants look at the frame that requested the memory. [`Exclusion::Text`]
/// matches against the rendered entry instead, which depends on how paths happen to be
/// rendered, so prefer the structured variants where possible.
///
/// Exclusions parse from `crate:NAME`, `path:PATH`, `segments:PATH` and `text:SUBSTRING`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Exclusion {
    /// The origin function belongs to the named crate, e.g. `std`.
    ///
    /// Never matches keys without function information, such as when grouping by file.
    Crate(String),

    /// The origin source file is inside this directory (compared component by component).
    PathPrefix(PathBuf),

    /// The origin source file path contains these components next to each other,
    /// e.g. `library/std` matches every file of the standard library wherever it was built.
    PathSegments(PathBuf),

    /// The rendered entry contains this text.
    Text(String),
}

impl Exclusion {
    /// Whether the entry is suppressed by this exclusion.
    #[must_use]
    pub fn matches(&self, entry: &DiffEntry) -> bool {
        let origin = entry.key().origin();

        match self {
            Self::Crate(name) => origin
                .and_then(|frame| frame.crate_name())
                .is_some_and(|crate_name| crate_name == name),
            Self::PathPrefix(prefix) => origin
                .and_then(|frame| frame.file())
                .is_some_and(|file| file.starts_with(prefix)),
            Self::PathSegments(segments) => origin
                .and_then(|frame| frame.file())
                .is_some_and(|file| contains_segments(file, segments)),
            Self::Text(text) => entry.to_string().contains(text.as_str()),
        }
    }
}

fn contains_segments(file: &Path, segments: &Path) -> bool {
    let file: Vec<Component<'_>> = file.components().collect();
    let segments: Vec<Component<'_>> = segments.components().collect();

    !segments.is_empty()
        && file
            .windows(segments.len())
            .any(|window| window == segments.as_slice())
}

impl FromStr for Exclusion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((kind, value)) = s.split_once(':') else {
            return Err(format!(
                "Invalid exclusion: '{s}'. Expected crate:NAME, path:PATH, segments:PATH or text:SUBSTRING"
            ));
        };

        if value.is_empty() {
            return Err(format!("Invalid exclusion: '{s}' has nothing to match"));
        }

        match kind {
            "crate" => Ok(Self::Crate(value.to_owned())),
            "path" => Ok(Self::PathPrefix(PathBuf::from(value))),
            "segments" => Ok(Self::PathSegments(PathBuf::from(value))),
            "text" => Ok(Self::Text(value.to_owned())),
            _ => Err(format!(
                "Invalid exclusion kind: '{kind}'. Valid options are: crate, path, segments, text"
            )),
        }
    }
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crate(name) => write!(f, "crate:{name}"),
            Self::PathPrefix(path) => write!(f, "path:{}", path.display()),
            Self::PathSegments(path) => write!(f, "segments:{}", path.display()),
            Self::Text(text) => write!(f, "text:{text}"),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{AllocationRecord, Frame, GroupBy, LeakProbe, Snapshot, Traceback};

    fn leaked_entry(frame: Frame, group_by: GroupBy) -> DiffEntry {
        let before = Snapshot::from_records([], 10);
        let after = Snapshot::from_records(
            [AllocationRecord::new(
                24,
                1,
                Traceback::new(vec![frame]),
            )],
            10,
        );

        after
            .diff(&before, group_by)
            .into_report(&[])
            .pop()
            .expect("one entry was leaked")
    }

    fn std_entry() -> DiffEntry {
        leaked_entry(
            Frame::new(
                Some("std::thread::spawn".to_owned()),
                Some(PathBuf::from(
                    "/rustc/0123abcd/library/std/src/thread/mod.rs",
                )),
                Some(400),
            ),
            GroupBy::Line,
        )
    }

    fn app_entry() -> DiffEntry {
        leaked_entry(
            Frame::new(
                Some("my_app::cache::remember".to_owned()),
                Some(PathBuf::from("/home/dev/my_app/src/cache.rs")),
                Some(12),
            ),
            GroupBy::Line,
        )
    }

    #[test]
    fn crate_exclusion() {
        let exclusion = Exclusion::Crate("std".to_owned());

        assert!(exclusion.matches(&std_entry()));
        assert!(!exclusion.matches(&app_entry()));
    }

    #[test]
    fn crate_exclusion_needs_function() {
        let by_file = leaked_entry(
            Frame::new(
                Some("std::thread::spawn".to_owned()),
                Some(PathBuf::from("library/std/src/thread/mod.rs")),
                Some(1),
            ),
            GroupBy::File,
        );

        assert!(!Exclusion::Crate("std".to_owned()).matches(&by_file));
        assert!(Exclusion::PathSegments(PathBuf::from("library/std")).matches(&by_file));
    }

    #[test]
    fn crate_exclusion_of_primitive_impl() {
        let entry = leaked_entry(
            Frame::new(
                Some("<u64 as core::fmt::Display>::fmt".to_owned()),
                None,
                None,
            ),
            GroupBy::Line,
        );

        assert!(Exclusion::Crate("core".to_owned()).matches(&entry));
        assert!(!Exclusion::Crate("u64".to_owned()).matches(&entry));
    }

    #[test]
    fn default_exclusions_cover_whole_standard_library() {
        let exclusions = LeakProbe::default_exclusions();
        let is_excluded =
            |entry: &DiffEntry| exclusions.iter().any(|exclusion| exclusion.matches(entry));

        for (function, file) in [
            (
                "<u64 as core::fmt::Display>::fmt",
                "/rustc/0123abcd/library/core/src/fmt/num.rs",
            ),
            (
                "<u8 as <[_]>::to_vec_in::ConvertVec>::to_vec",
                "/rustc/0123abcd/library/alloc/src/slice.rs",
            ),
            (
                "std::path::Path::to_path_buf",
                "/rustc/0123abcd/library/std/src/path.rs",
            ),
        ] {
            let frame = Frame::new(
                Some(function.to_owned()),
                Some(PathBuf::from(file)),
                Some(1),
            );

            assert!(is_excluded(&leaked_entry(frame.clone(), GroupBy::Line)));
            assert!(is_excluded(&leaked_entry(frame, GroupBy::File)));
        }

        assert!(!is_excluded(&app_entry()));
    }

    #[test]
    fn path_prefix_exclusion_compares_components() {
        assert!(Exclusion::PathPrefix(PathBuf::from("/home/dev/my_app")).matches(&app_entry()));
        assert!(!Exclusion::PathPrefix(PathBuf::from("/home/dev/my")).matches(&app_entry()));
        assert!(!Exclusion::PathPrefix(PathBuf::from("/rustc")).matches(&app_entry()));
    }

    #[test]
    fn path_segments_exclusion_matches_anywhere() {
        let exclusion = Exclusion::PathSegments(PathBuf::from("library/std"));

        assert!(exclusion.matches(&std_entry()));
        assert!(!exclusion.matches(&app_entry()));
        assert!(!Exclusion::PathSegments(PathBuf::from("library/st")).matches(&std_entry()));
    }

    #[test]
    fn text_exclusion_matches_rendered_entry() {
        assert!(Exclusion::Text("cache.rs:12".to_owned()).matches(&app_entry()));
        assert!(Exclusion::Text("count=1 (+1)".to_owned()).matches(&app_entry()));
        assert!(!Exclusion::Text("lib/python3".to_owned()).matches(&app_entry()));
    }

    #[test]
    fn parse_and_display_agree() {
        for text in [
            "crate:std",
            "path:/rustc",
            "segments:library/std",
            "text:hello:world",
        ] {
            let exclusion: Exclusion = text.parse().unwrap();
            assert_eq!(exclusion.to_string(), text);
        }

        assert_eq!(
            "text:hello:world".parse::<Exclusion>(),
            Ok(Exclusion::Text("hello:world".to_owned()))
        );
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("std".parse::<Exclusion>().is_err());
        assert!("crate:".parse::<Exclusion>().is_err());
        assert!("module:std".parse::<Exclusion>().is_err());
    }
}
