//! Platform abstraction (§4.1): timestamps, cached pid/tid, page size, a
//! page-aligned copy-with-flush primitive, and the tracepoint fast path's
//! stack-vs-heap staging buffer.
//!
//! Failure semantics: the first call on a thread initializes the pid/tid
//! cache under a once-guard; any syscall failure while filling it is
//! unrecoverable (see [`crate::error::abort`]) — tracing must never
//! silently run with a corrupted identity cache.

use std::cell::Cell;
use std::sync::Once;

use nix::time::{clock_gettime, ClockId};
use nix::unistd::{getpid, gettid};

use crate::error::abort;

thread_local! {
    static PID_TID: Cell<Option<(u32, u32)>> = Cell::new(None);
}

static REGISTER_ATFORK: Once = Once::new();

extern "C" fn on_fork_child() {
    PID_TID.with(|c| c.set(None));
}

fn register_atfork() {
    REGISTER_ATFORK.call_once(|| unsafe {
        libc::pthread_atfork(None, None, Some(on_fork_child));
    });
}

/// Returns the calling thread's (pid, tid), refilling the per-thread cache
/// if it is empty or was invalidated by an intervening fork.
pub fn cached_pid_tid() -> (u32, u32) {
    register_atfork();
    PID_TID.with(|c| {
        if let Some(v) = c.get() {
            return v;
        }
        let pid = getpid().as_raw() as u32;
        let tid = gettid().as_raw() as u32;
        if pid == 0 || tid == 0 {
            abort("platform: failed to resolve pid/tid for cache");
        }
        c.set(Some((pid, tid)));
        (pid, tid)
    })
}

/// UTC nanoseconds since the epoch. Captured before lock acquisition on the
/// tracepoint fast path (§5), so ordering within a ring is by mutex
/// acquisition order, not strictly by timestamp.
pub fn timestamp_ns() -> u64 {
    match clock_gettime(ClockId::CLOCK_REALTIME) {
        Ok(ts) => (ts.tv_sec() as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec() as u64),
        Err(e) => abort(&format!("platform: clock_gettime failed: {}", e)),
    }
}

/// The system page size, cached after the first call.
pub fn page_size() -> usize {
    page_size::get()
}

/// Rounds `value` up to the next multiple of `align` (must be a power of two).
pub fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Copies `src` into `dst` and, on ARM64, issues a data-cache flush over the
/// destination range so a peer reading through a separate mapping observes
/// the write without relying on coherency alone. A no-op flush elsewhere.
pub fn copy_and_flush(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    dst.copy_from_slice(src);
    flush_range(dst);
}

#[cfg(target_arch = "aarch64")]
fn flush_range(range: &[u8]) {
    // Data cache clean-by-VA to point of coherency, one cache line at a time.
    // 64 bytes is the common ARM64 cache line size; over-flushing a few
    // extra lines at the boundaries is harmless.
    const LINE: usize = 64;
    let start = range.as_ptr() as usize & !(LINE - 1);
    let end = range.as_ptr() as usize + range.len();
    let mut addr = start;
    while addr < end {
        unsafe {
            std::arch::asm!("dc cvac, {0}", in(reg) addr);
        }
        addr += LINE;
    }
    unsafe {
        std::arch::asm!("dsb sy");
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_range(_range: &[u8]) {}

/// Scratch storage for staging a trace entry before it's appended to the
/// ring. Small, fixed-width entries stay on the stack; larger or
/// variable-width ones spill to the heap (§4.8 policy).
pub enum Stage {
    Inline([u8; Self::INLINE_CAP], usize),
    Heap(Vec<u8>),
}

impl Stage {
    /// Entries up to this size are staged in-frame; the threshold the spec
    /// calls "approximately 1 KiB".
    pub const INLINE_CAP: usize = 1024;

    pub fn for_size(size: usize) -> Self {
        if size <= Self::INLINE_CAP {
            Stage::Inline([0u8; Self::INLINE_CAP], size)
        } else {
            Stage::Heap(vec![0u8; size])
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Stage::Inline(buf, len) => &mut buf[..*len],
            Stage::Heap(v) => v.as_mut_slice(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Stage::Inline(buf, len) => &buf[..*len],
            Stage::Heap(v) => v.as_slice(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_tid_cache_is_stable_within_thread() {
        let a = cached_pid_tid();
        let b = cached_pid_tid();
        assert_eq!(a, b);
        assert_eq!(a.0, std::process::id());
    }

    #[test]
    fn align_up_rounds_correctly() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
    }

    #[test]
    fn stage_picks_inline_or_heap() {
        let mut small = Stage::for_size(16);
        assert_eq!(small.as_mut_slice().len(), 16);
        assert!(matches!(small, Stage::Inline(_, _)));

        let big = Stage::for_size(Stage::INLINE_CAP + 1);
        assert!(matches!(big, Stage::Heap(_)));
    }

    #[test]
    fn timestamps_advance() {
        let a = timestamp_ns();
        let b = timestamp_ns();
        assert!(b >= a);
    }
}
