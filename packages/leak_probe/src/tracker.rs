//! Process-wide record of live tracked allocations.
//!
//! There is at most one active tracking session per process. The allocator reports every
//! allocation and deallocation here; while a session is active we keep a table of the live
//! allocations it recorded, each attributed to an interned raw stack.

use std::cell::Cell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use foldhash::HashMap;
use scopeguard::defer;

use crate::traceback::{self, RawTrace};
use crate::{ERR_POISONED_LOCK, Error, Result};

/// Which allocations a tracking session records.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum TrackingScope {
    /// Allocations made by any thread of the process.
    #[default]
    Process,

    /// Only allocations made by the thread that enabled tracking.
    ///
    /// Deallocations are still honored no matter which thread performs them.
    Thread,
}

// Generation of the active session, zero when tracking is disabled.
static ACTIVE_GENERATION: AtomicU64 = AtomicU64::new(0);
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

static PROCESS_WIDE: AtomicBool = AtomicBool::new(true);
static CAPTURE_DEPTH: AtomicUsize = AtomicUsize::new(0);

static STATE: Mutex<Option<TrackerState>> = Mutex::new(None);

thread_local! {
    // Set while this thread runs tracker bookkeeping. Whatever is allocated meanwhile belongs
    // to the tracker and is never recorded, which also keeps the allocator from re-entering.
    static BOOKKEEPING: Cell<bool> = const { Cell::new(false) };

    // Set on the thread that enabled a thread-scoped session.
    static TRACKED_THREAD: Cell<bool> = const { Cell::new(false) };
}

pub(crate) type TraceId = usize;

#[derive(Clone, Copy, Debug)]
struct LiveAllocation {
    size: usize,
    trace: TraceId,
}

/// A tracked allocation removed from the live table, kept so it can be put back if the
/// operation that removed it turns out to have failed.
#[derive(Debug)]
pub(crate) struct Forgotten {
    generation: u64,
    allocation: LiveAllocation,
}

/// Live allocations of one trace, as seen at one point in time.
#[derive(Debug)]
pub(crate) struct LiveGroup {
    pub(crate) trace: TraceId,
    /// Only provided for traces the caller has not resolved yet.
    pub(crate) raw: Option<RawTrace>,
    pub(crate) size: u64,
    pub(crate) count: u64,
}

#[derive(Debug)]
struct TrackerState {
    generation: u64,
    live: HashMap<usize, LiveAllocation>,
    trace_ids: HashMap<RawTrace, TraceId>,
    traces: Vec<RawTrace>,
    current_bytes: usize,
    peak_bytes: usize,
}

impl TrackerState {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            live: HashMap::default(),
            trace_ids: HashMap::default(),
            traces: Vec::new(),
            current_bytes: 0,
            peak_bytes: 0,
        }
    }

    fn intern(&mut self, trace: RawTrace) -> TraceId {
        if let Some(&id) = self.trace_ids.get(&trace) {
            return id;
        }

        let id = self.traces.len();
        self.traces.push(trace.clone());
        self.trace_ids.insert(trace, id);
        id
    }

    fn insert(&mut self, address: usize, allocation: LiveAllocation) {
        // An address we still hold was released without us seeing it, so the old entry is stale.
        if let Some(stale) = self.live.insert(address, allocation) {
            self.current_bytes = self.current_bytes.wrapping_sub(stale.size);
        }

        self.current_bytes = self.current_bytes.wrapping_add(allocation.size);
        self.peak_bytes = self.peak_bytes.max(self.current_bytes);
    }

    fn remove(&mut self, address: usize) -> Option<LiveAllocation> {
        let allocation = self.live.remove(&address)?;
        self.current_bytes = self.current_bytes.wrapping_sub(allocation.size);
        Some(allocation)
    }
}

/// Runs `f` as tracker bookkeeping: nothing it allocates on this thread is recorded.
pub(crate) fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let previous = BOOKKEEPING.replace(true);

    defer! {
        BOOKKEEPING.set(previous);
    }

    f()
}

/// Whether a tracking session is active in this process.
#[must_use]
pub fn is_tracking() -> bool {
    ACTIVE_GENERATION.load(Ordering::Acquire) != 0
}

pub(crate) fn is_active(generation: u64) -> bool {
    ACTIVE_GENERATION.load(Ordering::Acquire) == generation
}

/// Starts a new tracking session, returning its generation.
pub(crate) fn start(raw_depth: usize, scope: TrackingScope) -> Result<u64> {
    untracked(|| {
        let mut state = STATE.lock().expect(ERR_POISONED_LOCK);

        if is_tracking() {
            return Err(Error::AlreadyTracking);
        }

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        *state = Some(TrackerState::new(generation));

        CAPTURE_DEPTH.store(raw_depth, Ordering::Relaxed);
        PROCESS_WIDE.store(scope == TrackingScope::Process, Ordering::Relaxed);
        TRACKED_THREAD.set(scope == TrackingScope::Thread);

        ACTIVE_GENERATION.store(generation, Ordering::Release);
        Ok(generation)
    })
}

/// Stops the session with the given generation. Returns whether it was still active.
pub(crate) fn stop(generation: u64) -> bool {
    untracked(|| {
        let mut state = STATE.lock().expect(ERR_POISONED_LOCK);

        if !is_active(generation) {
            return false;
        }

        ACTIVE_GENERATION.store(0, Ordering::Release);
        TRACKED_THREAD.set(false);
        drop(state.take());

        true
    })
}

fn with_state<R>(generation: u64, f: impl FnOnce(&mut TrackerState) -> R) -> Result<R> {
    untracked(|| {
        let mut state = STATE.lock().expect(ERR_POISONED_LOCK);

        match state.as_mut() {
            Some(state) if state.generation == generation => Ok(f(state)),
            _ => Err(Error::TrackingNotEnabled),
        }
    })
}

fn should_record_on_this_thread() -> bool {
    // Thread-local storage may be unavailable while a thread is being torn down.
    if BOOKKEEPING.try_with(Cell::get).unwrap_or(true) {
        return false;
    }

    PROCESS_WIDE.load(Ordering::Relaxed) || TRACKED_THREAD.try_with(Cell::get).unwrap_or(false)
}

/// Records a new allocation, attributing it to the current stack.
pub(crate) fn record_allocation(address: usize, size: usize) {
    let generation = ACTIVE_GENERATION.load(Ordering::Acquire);

    if generation == 0 || !should_record_on_this_thread() {
        return;
    }

    untracked(|| {
        // Captured before taking the lock to keep the critical section short.
        let trace = traceback::capture_raw(CAPTURE_DEPTH.load(Ordering::Relaxed));

        _ = with_state(generation, |state| {
            let trace = state.intern(trace);
            state.insert(address, LiveAllocation { size, trace });
        });
    });
}

/// Removes an allocation from the live table if it was tracked.
///
/// Must be called before the memory is handed back, so that a concurrent allocation reusing
/// the address cannot be mistaken for this one.
pub(crate) fn forget_allocation(address: usize) -> Option<Forgotten> {
    let generation = ACTIVE_GENERATION.load(Ordering::Acquire);

    if generation == 0 || BOOKKEEPING.try_with(Cell::get).unwrap_or(true) {
        return None;
    }

    with_state(generation, |state| {
        state.remove(address).map(|allocation| Forgotten {
            generation,
            allocation,
        })
    })
    .ok()
    .flatten()
}

/// Puts back an allocation removed by [`forget_allocation`].
pub(crate) fn restore_allocation(address: usize, forgotten: Forgotten) {
    _ = with_state(forgotten.generation, |state| {
        state.insert(address, forgotten.allocation);
    });
}

/// Sums up the live allocations of the session per trace.
pub(crate) fn live_groups(
    generation: u64,
    is_resolved: impl Fn(TraceId) -> bool,
) -> Result<Vec<LiveGroup>> {
    with_state(generation, |state| {
        let mut totals: HashMap<TraceId, (u64, u64)> = HashMap::default();

        for allocation in state.live.values() {
            let size: u64 = allocation
                .size
                .try_into()
                .expect("usize always fits into u64");

            let (total_size, count) = totals.entry(allocation.trace).or_insert((0, 0));
            *total_size = total_size.wrapping_add(size);
            *count = count.wrapping_add(1);
        }

        totals
            .into_iter()
            .map(|(trace, (size, count))| LiveGroup {
                trace,
                raw: if is_resolved(trace) {
                    None
                } else {
                    state.traces.get(trace).cloned()
                },
                size,
                count,
            })
            .collect()
    })
}

/// Current and peak bytes held by live tracked allocations.
pub(crate) fn traced_memory(generation: u64) -> Result<(usize, usize)> {
    with_state(generation, |state| (state.current_bytes, state.peak_bytes))
}

/// Forgets all tracked allocations, as if the session had just started.
///
/// Interned traces are kept, so trace identifiers handed out earlier stay valid.
pub(crate) fn clear(generation: u64) -> Result<()> {
    with_state(generation, |state| {
        state.live.clear();
        state.current_bytes = 0;
        state.peak_bytes = 0;
    })
}
