use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, Ordering};

static LIVE_BYTES: AtomicU64 = AtomicU64::new(0);
static TOTAL_BYTES: AtomicU64 = AtomicU64::new(0);
static MALLOCS: AtomicU64 = AtomicU64::new(0);
static FREES: AtomicU64 = AtomicU64::new(0);
static REALLOCS: AtomicU64 = AtomicU64::new(0);

/// A global allocator that forwards to the system allocator and counts what
/// passes through it.
///
/// Allocation statistics are only sampled when a binary opts in:
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: metrika::sampler::CountingAlloc = metrika::sampler::CountingAlloc;
/// ```
pub struct CountingAlloc;

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        FREES.fetch_add(1, Ordering::Relaxed);
        LIVE_BYTES.fetch_sub(layout.size() as u64, Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new = System.realloc(ptr, layout, new_size);
        if !new.is_null() {
            REALLOCS.fetch_add(1, Ordering::Relaxed);
            let old_size = layout.size() as u64;
            let new_size = new_size as u64;
            if new_size > old_size {
                TOTAL_BYTES.fetch_add(new_size - old_size, Ordering::Relaxed);
                LIVE_BYTES.fetch_add(new_size - old_size, Ordering::Relaxed);
            } else {
                LIVE_BYTES.fetch_sub(old_size - new_size, Ordering::Relaxed);
            }
        }
        new
    }
}

#[inline]
fn record_alloc(size: usize) {
    MALLOCS.fetch_add(1, Ordering::Relaxed);
    TOTAL_BYTES.fetch_add(size as u64, Ordering::Relaxed);
    LIVE_BYTES.fetch_add(size as u64, Ordering::Relaxed);
}

/// A point-in-time read of the allocator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocStats {
    /// Bytes currently allocated.
    pub live_bytes: u64,
    /// Bytes ever allocated.
    pub total_bytes: u64,
    /// Allocation calls.
    pub mallocs: u64,
    /// Deallocation calls.
    pub frees: u64,
    /// Reallocation calls.
    pub reallocs: u64,
}

impl AllocStats {
    /// Allocations not yet freed.
    pub fn live_objects(&self) -> u64 {
        self.mallocs.saturating_sub(self.frees)
    }
}

/// Read the counters. `None` when `CountingAlloc` is not the global
/// allocator, since nothing has ever been counted.
pub fn stats() -> Option<AllocStats> {
    let mallocs = MALLOCS.load(Ordering::Relaxed);
    if mallocs == 0 {
        return None;
    }
    Some(AllocStats {
        live_bytes: LIVE_BYTES.load(Ordering::Relaxed),
        total_bytes: TOTAL_BYTES.load(Ordering::Relaxed),
        mallocs,
        frees: FREES.load(Ordering::Relaxed),
        reallocs: REALLOCS.load(Ordering::Relaxed),
    })
}
