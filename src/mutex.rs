//! Robust shared mutex (§4.2): a 64-byte opaque region usable directly in
//! shared memory, addressable as the first field of [`crate::ring::RingHead`]
//! and [`crate::stack::StackHead`].
//!
//! Built as a hand-rolled futex-based mutex (raw `FUTEX_WAIT`/`FUTEX_WAKE`
//! via `libc::syscall`) rather than glibc's `PTHREAD_PROCESS_SHARED` +
//! `PTHREAD_MUTEX_ROBUST` pthread mutex — this is named explicitly as one of
//! the hard, in-scope parts of the design, so it's hand-built like the ring
//! and stack rather than delegated to a library. Robustness (detecting a
//! dead holder) is implemented by probing the recorded owner pid with
//! `kill(pid, 0)` once a waiter's lock attempt times out, rather than by
//! registering with the kernel's robust-futex list — the externally
//! observable contract (`OWNER_DEAD` surfaces as [`LockOutcome::Recovered`]
//! exactly once per death, consistency must be explicitly restored) is the
//! same either way, and a raw `robust_list` registration would add a large
//! amount of kernel-ABI bookkeeping for no behavioral difference here.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::platform::cached_pid_tid;
use crate::recoverable;

/// Hard cap on any single acquisition attempt, regardless of the caller's
/// requested timeout (§4.2, §5).
pub const MAX_ACQUIRE: Duration = Duration::from_secs(2);

const REGION_SIZE: usize = 64;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const LOCKED_CONTENDED: u32 = 2;

/// Deliberately plain `#[repr(C)]`, not `#[repr(align(64))]`: the file
/// format only promises 8-byte section alignment (§3), and every field
/// here needs at most natural 8-byte alignment, which that guarantee
/// already satisfies. Forcing a 64-byte Rust alignment would make casting
/// a raw mmap'd pointer at an 8-byte-aligned-but-not-64-byte-aligned
/// section offset undefined behavior. The 64-byte footprint is a
/// wire-format reservation, not an alignment requirement.
#[repr(C)]
pub struct RobustMutex {
    state: AtomicU32,
    _pad0: [u8; 4],
    /// `(pid as u64) << 32 | tid as u64`; `0` means no owner.
    owner: AtomicU64,
    /// `0` once a holder has died without the recovering thread calling
    /// [`RobustMutex::mark_consistent`]; `1` otherwise. Mirrors pthread
    /// robust-mutex semantics: once inconsistent, every subsequent
    /// acquirer keeps observing [`LockOutcome::Recovered`] until someone
    /// explicitly restores consistency.
    consistent: AtomicU32,
    _pad1: [u8; REGION_SIZE - 4 - 4 - 8 - 4],
}

const _: () = assert!(std::mem::size_of::<RobustMutex>() == REGION_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Locked,
    /// The previous owner died holding the mutex; the caller now owns it
    /// and is expected to treat protected state as potentially torn.
    Recovered,
}

#[derive(Debug)]
pub enum LockError {
    Timeout,
    Deadlocked,
    Other(String),
}

impl RobustMutex {
    /// Initializes a mutex in place, typically over a freshly mmap'd
    /// region. Safety: `region` must point at at least 64 live, writable
    /// bytes and must not already hold a mutex another process is using.
    pub unsafe fn init_in_place(region: *mut u8) -> &'static RobustMutex {
        let m = &*(region as *const RobustMutex);
        m.state.store(UNLOCKED, Ordering::Relaxed);
        m.owner.store(0, Ordering::Relaxed);
        m.consistent.store(1, Ordering::Relaxed);
        m
    }

    /// Views an existing, already-initialized region as a mutex. Safety:
    /// the caller must guarantee the region really holds one (the file
    /// manager only ever calls this on sections it created or that passed
    /// header validation).
    pub unsafe fn open(region: *mut u8) -> &'static RobustMutex {
        &*(region as *const RobustMutex)
    }

    fn self_id() -> u64 {
        let (pid, tid) = cached_pid_tid();
        ((pid as u64) << 32) | tid as u64
    }

    /// Attempts to acquire the mutex, waiting up to `min(timeout, 2s)`.
    pub fn try_lock(&self, timeout: Duration) -> Result<LockOutcome, LockError> {
        let bounded = timeout.min(MAX_ACQUIRE);
        let deadline = Instant::now() + bounded;
        let me = Self::self_id();

        loop {
            if self.owner.load(Ordering::Relaxed) == me
                && self.state.load(Ordering::Relaxed) != UNLOCKED
            {
                return Err(LockError::Deadlocked);
            }

            if self
                .state
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.owner.store(me, Ordering::Relaxed);
                return Ok(self.claim_outcome());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                if let Some(outcome) = self.try_reap_dead_owner(me) {
                    return Ok(outcome);
                }
                return Err(LockError::Timeout);
            }

            // Announce contention so the holder's unlock knows to wake us.
            let _ = self.state.compare_exchange(
                LOCKED,
                LOCKED_CONTENDED,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );

            if let Some(outcome) = self.try_reap_dead_owner(me) {
                return Ok(outcome);
            }

            futex_wait(&self.state, LOCKED_CONTENDED, remaining);
        }
    }

    /// If the current owner process is no longer alive, force-takes the
    /// lock on its behalf and reports the recovery.
    fn try_reap_dead_owner(&self, me: u64) -> Option<LockOutcome> {
        let owner = self.owner.load(Ordering::Relaxed);
        if owner == 0 {
            return None;
        }
        let owner_pid = (owner >> 32) as i32;
        if process_alive(owner_pid) {
            return None;
        }
        let prev = self.state.swap(LOCKED, Ordering::Acquire);
        if prev == UNLOCKED {
            // Lost the race: nobody actually held it.
            self.state.store(UNLOCKED, Ordering::Relaxed);
            return None;
        }
        self.owner.store(me, Ordering::Relaxed);
        self.consistent.store(0, Ordering::Relaxed);
        Some(LockOutcome::Recovered)
    }

    fn claim_outcome(&self) -> LockOutcome {
        if self.consistent.load(Ordering::Relaxed) == 0 {
            LockOutcome::Recovered
        } else {
            LockOutcome::Locked
        }
    }

    /// Declares the protected state consistent again after a
    /// [`LockOutcome::Recovered`] acquisition. Must be called before
    /// [`RobustMutex::unlock`] or the mutex keeps reporting `Recovered` to
    /// every future acquirer.
    pub fn mark_consistent(&self) {
        self.consistent.store(1, Ordering::Relaxed);
    }

    /// Releases the mutex. Per §4.2, releasing a mutex this thread does
    /// not hold is a recoverable error (logged, not propagated as a
    /// failure that aborts tracing).
    pub fn unlock(&self) {
        let me = Self::self_id();
        if self.owner.load(Ordering::Relaxed) != me {
            recoverable!("unlock on a mutex we don't hold");
            return;
        }
        self.owner.store(0, Ordering::Relaxed);
        let prev = self.state.swap(UNLOCKED, Ordering::Release);
        if prev == LOCKED_CONTENDED {
            futex_wake_one(&self.state);
        }
    }
}

fn process_alive(pid: i32) -> bool {
    // kill(pid, 0) probes existence/permission without sending a signal.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || unsafe { *libc::__errno_location() } != libc::ESRCH
}

fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as i64,
    };
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
        );
    }
}

fn futex_wake_one(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            1i32,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Box<[u8; REGION_SIZE]> {
        Box::new([0u8; REGION_SIZE])
    }

    #[test]
    fn lock_unlock_roundtrip() {
        let mut region = fresh();
        let m = unsafe { RobustMutex::init_in_place(region.as_mut_ptr()) };
        assert_eq!(m.try_lock(Duration::from_millis(100)).unwrap(), LockOutcome::Locked);
        m.unlock();
        assert_eq!(m.try_lock(Duration::from_millis(100)).unwrap(), LockOutcome::Locked);
        m.unlock();
    }

    #[test]
    fn double_lock_same_thread_is_deadlocked() {
        let mut region = fresh();
        let m = unsafe { RobustMutex::init_in_place(region.as_mut_ptr()) };
        assert_eq!(m.try_lock(Duration::from_millis(50)).unwrap(), LockOutcome::Locked);
        match m.try_lock(Duration::from_millis(50)) {
            Err(LockError::Deadlocked) => {}
            other => panic!("expected Deadlocked, got {:?}", other),
        }
        m.unlock();
    }

    #[test]
    fn unlock_without_holding_is_recoverable_not_fatal() {
        let mut region = fresh();
        let m = unsafe { RobustMutex::init_in_place(region.as_mut_ptr()) };
        // Should log, not panic or abort.
        m.unlock();
    }

    #[test]
    fn dead_owner_is_recovered_then_marked_consistent() {
        let mut region = fresh();
        let m = unsafe { RobustMutex::init_in_place(region.as_mut_ptr()) };
        // Simulate a holder from a pid that cannot possibly be alive.
        m.state.store(LOCKED, Ordering::Relaxed);
        m.owner.store((999_999_999u64) << 32, Ordering::Relaxed);

        let outcome = m.try_lock(Duration::from_millis(200)).unwrap();
        assert_eq!(outcome, LockOutcome::Recovered);
        m.mark_consistent();
        m.unlock();

        assert_eq!(
            m.try_lock(Duration::from_millis(100)).unwrap(),
            LockOutcome::Locked
        );
        m.unlock();
    }
}
