//! Stack capture and symbolization used to attribute allocations to code locations.

use std::ffi::c_void;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::ptr;

/// The largest number of frames a tracking session retains per allocation.
///
/// Larger requested depths are clamped to this value.
pub const MAX_FRAME_DEPTH: usize = 64;

// The tracker, the unwinder and the allocation plumbing of the standard library sit on top of
// every captured stack. We capture this many frames on top of the requested depth so that
// trimming them still leaves the requested number of frames of the caller.
const PLUMBING_FRAMES: usize = 32;

pub(crate) const MAX_RAW_FRAMES: usize = MAX_FRAME_DEPTH + PLUMBING_FRAMES;

/// Unresolved instruction pointers of one captured stack, innermost first.
///
/// Fixed capacity so that capturing a stack inside the allocator never allocates.
pub(crate) type RawTrace = heapless::Vec<usize, MAX_RAW_FRAMES>;

// Function path prefixes that belong to the machinery between the code that requested memory
// and the point where we observe the allocation, besides the standard library itself.
// Matched after stripping leading `<`.
const PLUMBING_PREFIXES: &[&str] = &[
    "leak_probe::allocator::",
    "leak_probe::tracker::",
    "leak_probe::traceback::",
    "backtrace::",
    "scopeguard::",
    "__rust_",
    "__rdl_",
    "__rg_",
    "__rustc::",
    "_Unwind_",
];

// Crates of the standard library. Every frame of theirs on top of the stack is plumbing.
const STANDARD_CRATES: &[&str] = &["alloc", "core", "std"];

// Types that demangle without a crate path.
const PRIMITIVE_TYPES: &[&str] = &[
    "bool", "char", "str", "u8", "u16", "u32", "u64", "u128", "usize", "i8", "i16", "i32",
    "i64", "i128", "isize", "f32", "f64",
];

fn is_primitive(type_path: &str) -> bool {
    type_path.starts_with(['[', '(', '&', '*'])
        || type_path.starts_with("mut ")
        || type_path.starts_with("fn(")
        || PRIMITIVE_TYPES.contains(&type_path)
}

/// Whether the file is part of the standard library sources, i.e. it lies in
/// `library/{alloc,core,std}/src`, wherever the toolchain was built or installed.
fn is_standard_source(file: &Path) -> bool {
    let components: Vec<Component<'_>> = file.components().collect();

    components.windows(3).any(|window| match window {
        [Component::Normal(library), Component::Normal(krate), Component::Normal(src)] => {
            *library == "library"
                && *src == "src"
                && STANDARD_CRATES.iter().any(|name| *krate == *name)
        }
        _ => false,
    })
}

/// How many raw frames to capture to end up with `depth` frames of the caller.
pub(crate) fn raw_depth(depth: usize) -> usize {
    depth.saturating_add(PLUMBING_FRAMES).min(MAX_RAW_FRAMES)
}

/// Captures the instruction pointers of the current stack, up to `max_frames` of them.
pub(crate) fn capture_raw(max_frames: usize) -> RawTrace {
    let max_frames = max_frames.min(MAX_RAW_FRAMES);
    let mut trace = RawTrace::new();

    backtrace::trace(|frame| trace.push(frame.ip().addr()).is_ok() && trace.len() < max_frames);

    trace
}

/// Symbolizes a raw stack and trims it down to at most `depth` frames of the caller.
pub(crate) fn resolve(raw: &[usize], depth: usize) -> Traceback {
    let mut frames = Vec::with_capacity(raw.len());

    for &ip in raw {
        let mut symbolized = false;

        backtrace::resolve(ptr::without_provenance_mut::<c_void>(ip), |symbol| {
            symbolized = true;

            // The alternate form omits the trailing symbol hash.
            frames.push(Frame {
                function: symbol.name().map(|name| format!("{name:#}")),
                file: symbol.filename().map(Path::to_path_buf),
                line: symbol.lineno(),
                address: None,
            });
        });

        if !symbolized {
            frames.push(Frame::unresolved(ip));
        }
    }

    Traceback::trimmed(frames, depth)
}

/// One frame of the call stack that produced an allocation.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Frame {
    function: Option<String>,
    file: Option<PathBuf>,
    line: Option<u32>,
    address: Option<usize>,
}

impl Frame {
    /// Creates a frame from already symbolized information.
    #[must_use]
    pub fn new(function: Option<String>, file: Option<PathBuf>, line: Option<u32>) -> Self {
        Self {
            function,
            file,
            line,
            address: None,
        }
    }

    fn unresolved(address: usize) -> Self {
        Self {
            function: None,
            file: None,
            line: None,
            address: Some(address),
        }
    }

    /// The demangled function path, without the symbol hash.
    #[must_use]
    pub fn function(&self) -> Option<&str> {
        self.function.as_deref()
    }

    /// The source file, if debug information is available.
    #[must_use]
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// The source line, if debug information is available.
    #[must_use]
    pub fn line(&self) -> Option<u32> {
        self.line
    }

    /// The instruction address, for frames that could not be symbolized.
    #[must_use]
    pub fn address(&self) -> Option<usize> {
        self.address
    }

    /// The name of the crate the function belongs to, as far as it can be told from the
    /// function path.
    ///
    /// For trait implementations this is the crate of the implementing type, e.g. `alloc` for
    /// `<alloc::vec::Vec<T> as core::clone::Clone>::clone`, or the crate of the trait if the
    /// implementing type is primitive, e.g. `core` for `<u64 as core::fmt::Display>::fmt`.
    #[must_use]
    pub fn crate_name(&self) -> Option<&str> {
        let function = self.function.as_deref()?;
        let path = function.trim_start_matches(['<', '&', '*']);

        // Impls for primitive types belong to the crate of the trait.
        let path = match path.split_once(" as ") {
            Some((self_type, trait_path)) if is_primitive(self_type) => {
                trait_path.trim_start_matches(['<', '&', '*'])
            }
            _ => path,
        };

        let end = path.find(|c: char| !(c.is_alphanumeric() || c == '_'))?;
        let (name, rest) = path.split_at(end);

        (!name.is_empty() && rest.starts_with("::")).then_some(name)
    }

    /// The same location reduced to file granularity.
    ///
    /// Frames without a file keep their function so that they stay distinguishable.
    pub(crate) fn file_only(&self) -> Self {
        if self.file.is_some() {
            Self {
                function: None,
                file: self.file.clone(),
                line: None,
                address: None,
            }
        } else {
            Self {
                line: None,
                ..self.clone()
            }
        }
    }

    fn is_plumbing(&self) -> bool {
        if self.file.as_deref().is_some_and(is_standard_source) {
            return true;
        }

        let Some(function) = self.function.as_deref() else {
            return false;
        };

        let path = function.trim_start_matches('<');

        PLUMBING_PREFIXES
            .iter()
            .any(|prefix| path.starts_with(prefix))
            // Helper traits on slices, e.g. `<u8 as <[_]>::to_vec_in::ConvertVec>::to_vec`.
            || path.contains(" as <[_]>::")
            || self
                .crate_name()
                .is_some_and(|name| STANDARD_CRATES.contains(&name))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line, &self.function, self.address) {
            (Some(file), Some(line), _, _) => write!(f, "{}:{line}", file.display()),
            (Some(file), None, _, _) => write!(f, "{}", file.display()),
            (None, _, Some(function), _) => write!(f, "{function}"),
            (None, _, None, Some(address)) => write!(f, "{address:#x}"),
            (None, _, None, None) => write!(f, "<unknown>"),
        }
    }
}

/// The call stack that produced an allocation, innermost frame first.
///
/// Frames belonging to the allocation machinery are not part of the traceback, so the first
/// frame is the code that requested the memory.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Traceback {
    frames: Vec<Frame>,
}

impl Traceback {
    /// Creates a traceback from frames that are already free of allocation machinery.
    #[must_use]
    pub fn new(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    /// Drops the leading run of plumbing frames and keeps at most `depth` of the rest.
    pub(crate) fn trimmed(frames: Vec<Frame>, depth: usize) -> Self {
        let first_caller = frames
            .iter()
            .position(|frame| !frame.is_plumbing())
            .unwrap_or(frames.len());

        Self {
            frames: frames.into_iter().skip(first_caller).take(depth).collect(),
        }
    }

    /// All frames, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The innermost frame, i.e. the code that requested the memory.
    #[must_use]
    pub fn origin(&self) -> Option<&Frame> {
        self.frames.first()
    }

    /// Number of frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frame could be attributed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for Traceback {
    /// Renders the origin frame. The alternate form renders every frame on its own line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            for (index, frame) in self.frames.iter().enumerate() {
                if index != 0 {
                    writeln!(f)?;
                }
                write!(f, "  {frame}")?;
            }
            return Ok(());
        }

        match self.origin() {
            Some(frame) => write!(f, "{frame}"),
            None => write!(f, "<unknown>"),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn function_frame(function: &str) -> Frame {
        Frame::new(Some(function.to_owned()), None, None)
    }

    fn located_frame(function: &str, file: &str, line: u32) -> Frame {
        Frame::new(
            Some(function.to_owned()),
            Some(PathBuf::from(file)),
            Some(line),
        )
    }

    #[test]
    fn trimming_skips_allocation_plumbing() {
        let frames = vec![
            function_frame("backtrace::backtrace::trace"),
            function_frame("leak_probe::traceback::capture_raw"),
            function_frame("leak_probe::tracker::record_allocation"),
            function_frame(
                "<leak_probe::allocator::Allocator<A> as core::alloc::global::GlobalAlloc>::alloc",
            ),
            function_frame("__rustc::__rust_alloc"),
            function_frame("alloc::alloc::exchange_malloc"),
            located_frame("my_app::serialize", "src/serialize.rs", 42),
            function_frame("core::ops::function::FnOnce::call_once"),
            located_frame("my_app::main", "src/main.rs", 7),
        ];

        let traceback = Traceback::trimmed(frames, 10);

        assert_eq!(traceback.len(), 3);
        assert_eq!(
            traceback.origin().and_then(Frame::function),
            Some("my_app::serialize")
        );
        // Plumbing below the origin is part of the caller's stack and is kept.
        assert_eq!(
            traceback.frames()[1].function(),
            Some("core::ops::function::FnOnce::call_once")
        );
    }

    #[test]
    fn trimming_treats_trait_impls_of_alloc_as_plumbing() {
        let frames = vec![
            function_frame("<str as alloc::string::ToString>::to_string"),
            function_frame("<alloc::vec::Vec<T,A> as core::clone::Clone>::clone"),
            located_frame("my_app::copy", "src/copy.rs", 3),
        ];

        let traceback = Traceback::trimmed(frames, 10);

        assert_eq!(
            traceback.origin().and_then(Frame::function),
            Some("my_app::copy")
        );
    }

    #[test]
    fn trimming_skips_standard_library_frames() {
        let frames = vec![
            function_frame("alloc::raw_vec::RawVecInner<A>::try_allocate_in"),
            located_frame(
                "<u8 as <[_]>::to_vec_in::ConvertVec>::to_vec::<alloc::alloc::Global>",
                "/rustc/0123abcd/library/alloc/src/slice.rs",
                448,
            ),
            located_frame(
                "<u64 as core::fmt::Display>::fmt",
                "/rustc/0123abcd/library/core/src/fmt/num.rs",
                143,
            ),
            located_frame(
                "std::path::Path::to_path_buf",
                "/rustc/0123abcd/library/std/src/path.rs",
                2300,
            ),
            located_frame("my_app::paths::remember", "src/paths.rs", 9),
        ];

        let traceback = Traceback::trimmed(frames, 10);

        assert_eq!(traceback.len(), 1);
        assert_eq!(traceback.to_string(), "src/paths.rs:9");
    }

    #[test]
    fn trimming_recognizes_standard_library_without_debug_info() {
        let frames = vec![
            function_frame("<u8 as <[_]>::to_vec_in::ConvertVec>::to_vec"),
            function_frame("<u64 as core::fmt::Display>::fmt"),
            function_frame("std::ffi::os_str::OsStr::to_os_string"),
            function_frame("my_app::paths::remember"),
        ];

        let traceback = Traceback::trimmed(frames, 10);

        assert_eq!(
            traceback.origin().and_then(Frame::function),
            Some("my_app::paths::remember")
        );
    }

    #[test]
    fn trimming_keeps_user_impls_of_standard_traits() {
        let frames = vec![
            function_frame("alloc::fmt::format::format_inner"),
            located_frame("<my_app::Id as core::fmt::Display>::fmt", "src/id.rs", 5),
        ];

        let traceback = Traceback::trimmed(frames, 10);

        assert_eq!(traceback.to_string(), "src/id.rs:5");
    }

    #[test]
    fn standard_sources_are_recognized_wherever_installed() {
        assert!(is_standard_source(Path::new(
            "/rustc/0123abcd/library/core/src/fmt/num.rs"
        )));
        assert!(is_standard_source(Path::new(
            "/home/dev/.rustup/toolchains/stable/lib/rustlib/src/rust/library/std/src/io/mod.rs"
        )));
        assert!(!is_standard_source(Path::new("/home/dev/library/src/lib.rs")));
        assert!(!is_standard_source(Path::new("/home/dev/my_app/src/core/mod.rs")));
    }

    #[test]
    fn trimming_truncates_to_depth() {
        let frames = vec![
            located_frame("a::one", "src/a.rs", 1),
            located_frame("a::two", "src/a.rs", 2),
            located_frame("a::three", "src/a.rs", 3),
        ];

        let traceback = Traceback::trimmed(frames, 2);

        assert_eq!(traceback.len(), 2);
        assert_eq!(traceback.frames()[1].line(), Some(2));
    }

    #[test]
    fn all_plumbing_yields_empty_traceback() {
        let traceback = Traceback::trimmed(vec![function_frame("alloc::alloc::alloc")], 10);

        assert!(traceback.is_empty());
        assert_eq!(traceback.to_string(), "<unknown>");
    }

    #[test]
    fn unresolved_frames_are_kept() {
        let traceback = Traceback::trimmed(vec![Frame::unresolved(0x1234)], 10);

        assert_eq!(traceback.to_string(), "0x1234");
    }

    #[test]
    fn crate_name_of_plain_and_trait_paths() {
        assert_eq!(
            function_frame("std::rt::lang_start").crate_name(),
            Some("std")
        );
        assert_eq!(
            function_frame("<alloc::vec::Vec<T> as core::clone::Clone>::clone").crate_name(),
            Some("alloc")
        );
        assert_eq!(
            function_frame("my_app::run::{{closure}}").crate_name(),
            Some("my_app")
        );
        assert_eq!(
            function_frame("<str as alloc::string::ToString>::to_string").crate_name(),
            Some("alloc")
        );
        assert_eq!(
            function_frame("<u64 as core::fmt::Display>::fmt").crate_name(),
            Some("core")
        );
        assert_eq!(
            function_frame("<[T] as alloc::slice::hack::ConvertVec>::to_vec").crate_name(),
            Some("alloc")
        );
        assert_eq!(
            function_frame("<my_app::Id as core::fmt::Display>::fmt").crate_name(),
            Some("my_app")
        );
        assert_eq!(function_frame("malloc").crate_name(), None);
        assert_eq!(Frame::unresolved(1).crate_name(), None);
    }

    #[test]
    fn display_prefers_location() {
        assert_eq!(
            located_frame("a::b", "src/a.rs", 12).to_string(),
            "src/a.rs:12"
        );
        assert_eq!(function_frame("a::b").to_string(), "a::b");
    }

    #[test]
    fn file_only_drops_line_and_function() {
        let frame = located_frame("a::b", "src/a.rs", 12).file_only();

        assert_eq!(frame.function(), None);
        assert_eq!(frame.line(), None);
        assert_eq!(frame.to_string(), "src/a.rs");

        let no_file = function_frame("a::b").file_only();
        assert_eq!(no_file.function(), Some("a::b"));
    }

    #[test]
    fn alternate_display_lists_all_frames() {
        let traceback = Traceback::new(vec![
            located_frame("a::one", "src/a.rs", 1),
            located_frame("a::two", "src/a.rs", 2),
        ]);

        assert_eq!(format!("{traceback:#}"), "  src/a.rs:1\n  src/a.rs:2");
    }
}
